//! Validation report formatting, grouped by config section.

use super::{ValidationIssue, ValidationResult, ValidationSeverity};

/// Top-level config sections in file order.
pub const SECTIONS: &[&str] = &[
    "store",
    "redis",
    "queues",
    "worker",
    "mail",
    "alerts",
    "prometheus",
];

/// Issue counts for one config section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionSummary<'a> {
    pub section: &'a str,
    pub errors: usize,
    pub warnings: usize,
}

fn section_of(issue: &ValidationIssue) -> &str {
    issue.path.split('.').next().unwrap_or(issue.path.as_str())
}

/// Counts issues per section, in file order, skipping clean sections.
///
/// Issues whose path names no known section are listed after the known ones.
pub fn section_summaries(result: &ValidationResult) -> Vec<SectionSummary<'_>> {
    let mut summaries: Vec<SectionSummary<'_>> = Vec::new();

    for issue in result.errors().chain(result.warnings()) {
        let section = section_of(issue);
        let index = match summaries.iter().position(|s| s.section == section) {
            Some(index) => index,
            None => {
                summaries.push(SectionSummary {
                    section,
                    errors: 0,
                    warnings: 0,
                });
                summaries.len() - 1
            }
        };
        match issue.severity {
            ValidationSeverity::Error => summaries[index].errors += 1,
            ValidationSeverity::Warning => summaries[index].warnings += 1,
        }
    }

    summaries.sort_by_key(|s| {
        SECTIONS
            .iter()
            .position(|known| *known == s.section)
            .unwrap_or(SECTIONS.len())
    });
    summaries
}

/// Formats a validation result as a per-section report.
pub fn format_report(result: &ValidationResult) -> String {
    let summaries = section_summaries(result);
    if summaries.is_empty() {
        return format!(
            "Configuration is valid ({} sections checked).",
            SECTIONS.len()
        );
    }

    let mut report = String::new();
    for summary in &summaries {
        report.push_str(&format!(
            "[{}] {} error(s), {} warning(s)\n",
            summary.section, summary.errors, summary.warnings
        ));

        let issues = result
            .errors()
            .chain(result.warnings())
            .filter(|issue| section_of(issue) == summary.section);
        for issue in issues {
            report.push_str(&format_issue(issue));
        }
        report.push('\n');
    }

    let error_count = result.error_count();
    let clean = SECTIONS
        .iter()
        .filter(|known| !summaries.iter().any(|s| s.section == **known))
        .count();
    report.push_str(&format!(
        "{} section(s) clean, {} error(s), {} warning(s)\n",
        clean,
        error_count,
        result.warnings().count()
    ));
    if error_count > 0 {
        report.push_str("Config rejected, the service will not start.\n");
    }

    report
}

fn format_issue(issue: &ValidationIssue) -> String {
    let label = match issue.severity {
        ValidationSeverity::Error => "error",
        ValidationSeverity::Warning => "warn ",
    };

    let mut output = format!("  {} {}: {}\n", label, issue.path, issue.message);
    if let Some(suggestion) = &issue.suggestion {
        output.push_str(&format!("        hint: {}\n", suggestion));
    }
    output
}

/// One-line summary for logs, naming the sections with issues.
pub fn format_brief_summary(result: &ValidationResult) -> String {
    let summaries = section_summaries(result);
    if summaries.is_empty() {
        return "Configuration valid".to_string();
    }

    let sections: Vec<&str> = summaries.iter().map(|s| s.section).collect();
    let error_count = result.error_count();
    let warning_count = result.warnings().count();
    if error_count == 0 {
        format!(
            "Configuration valid with {} warning(s) in {}",
            warning_count,
            sections.join(", ")
        )
    } else {
        format!(
            "Configuration invalid: {} error(s), {} warning(s) in {}",
            error_count,
            warning_count,
            sections.join(", ")
        )
    }
}
