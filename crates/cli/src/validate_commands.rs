use std::path::Path;

use jobkit_config::validate::{self, Severity, ValidationResult};

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Validate the config file and print a report. Exits with status 1 when
/// there are errors.
pub fn check(path: Option<&Path>, verbose: bool) {
    let result = validate::validate(path);
    eprint!("{}", render(&result, verbose));
    if result.has_errors() {
        std::process::exit(1);
    }
}

fn render(result: &ValidationResult, verbose: bool) -> String {
    let mut out = match &result.config_path {
        Some(path) => format!("Checking {}\n\n", path.display()),
        None => "No config file found; checking defaults.\n\n".to_string(),
    };

    let mut shown = 0;
    for d in &result.diagnostics {
        if d.severity == Severity::Info && !verbose {
            continue;
        }
        let color = match d.severity {
            Severity::Error => RED,
            Severity::Warning => YELLOW,
            Severity::Info => CYAN,
        };
        if d.path.is_empty() {
            out.push_str(&format!("  {BOLD}{color}{}{RESET} {}\n", d.severity, d.message));
        } else {
            out.push_str(&format!(
                "  {BOLD}{color}{}{RESET} {}: {}\n",
                d.severity, d.path, d.message
            ));
        }
        shown += 1;
    }
    if shown > 0 {
        out.push('\n');
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);
    if errors == 0 && warnings == 0 {
        out.push_str("No issues found.\n");
    } else {
        out.push_str(&format!("{errors} error(s), {warnings} warning(s)\n"));
    }
    out
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::io::Write};

    fn validate_file(contents: &str) -> ValidationResult {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        validate::validate(Some(file.path()))
    }

    #[test]
    fn reports_clean_config() {
        let result = validate_file(
            r#"
            [[jobs]]
            name = "backup"
            schedule = "@daily"
            exec = ["tar", "czf", "/tmp/backup.tgz", "/srv"]
            "#,
        );
        let report = render(&result, false);
        assert!(report.starts_with("Checking "));
        assert!(report.ends_with("No issues found.\n"));
    }

    #[test]
    fn reports_errors_and_warnings() {
        let result = validate_file(
            r#"
            [[jobs]]
            name = "backup"
            schedule = "not a schedule"
            exec = ["true"]
            timeout_secs = 5
            shutdown_grace_period_secs = 10
            "#,
        );
        let report = render(&result, false);
        assert!(result.has_errors());
        assert!(report.contains("jobs[0].schedule"));
        assert!(report.ends_with("1 error(s), 1 warning(s)\n"));
    }
}
