//! Configuration validation.
//!
//! Two passes: the untyped tree is walked against the known schema to catch
//! misspelled fields, then the typed config is checked for problems serde
//! cannot see (duplicate names, unparseable schedules, empty commands).

use std::{
    collections::{HashMap, HashSet},
    fmt,
    path::{Path, PathBuf},
};

use jobkit_cron::Schedule;

use crate::{
    error::{Error, Result},
    loader,
    schema::{HistoryBackend, JobkitConfig},
};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "job", "schedule", "history"
    pub category: &'static str,
    /// Dotted path, e.g. "jobs[1].schedule"
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    fn error(category: &'static str, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            category,
            path: path.into(),
            message: message.into(),
        }
    }

    fn warning(category: &'static str, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(category, path, message)
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}: {}", self.severity, self.message)
        } else {
            write!(f, "{}: {}: {}", self.severity, self.path, self.message)
        }
    }
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    /// `Err(Error::Invalid)` carrying the error diagnostics, if any.
    pub fn into_result(self) -> Result<()> {
        let diagnostics: Vec<_> = self
            .diagnostics
            .into_iter()
            .filter(|d| d.severity == Severity::Error)
            .collect();
        if diagnostics.is_empty() {
            Ok(())
        } else {
            Err(Error::Invalid { diagnostics })
        }
    }
}

// ── Schema tree for unknown-field detection ─────────────────────────────────

enum KnownKeys {
    Struct(HashMap<&'static str, KnownKeys>),
    /// Dynamic keys with scalar values (labels, headers, env).
    Map,
    Array(Box<KnownKeys>),
    Leaf,
}

fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Array, Leaf, Map, Struct};

    let slack = || {
        Struct(HashMap::from([
            ("webhook_url", Leaf),
            ("channel", Leaf),
            ("username", Leaf),
            ("icon_emoji", Leaf),
        ]))
    };
    let email = || {
        Struct(HashMap::from([
            ("from", Leaf),
            ("to", Leaf),
            ("cc", Leaf),
            ("bcc", Leaf),
            ("sendmail_path", Leaf),
        ]))
    };
    let webhook = Struct(HashMap::from([
        ("method", Leaf),
        ("url", Leaf),
        ("headers", Map),
        ("body", Leaf),
    ]));

    let job = Struct(HashMap::from([
        ("name", Leaf),
        ("description", Leaf),
        ("schedule", Leaf),
        ("exec", Leaf),
        ("timeout_secs", Leaf),
        ("shutdown_grace_period_secs", Leaf),
        ("labels", Map),
        (
            "parameters",
            Array(Box::new(Struct(HashMap::from([
                ("name", Leaf),
                ("label", Leaf),
                ("default", Leaf),
                ("required", Leaf),
            ])))),
        ),
        ("disabled", Leaf),
        (
            "history",
            Struct(HashMap::from([
                ("disabled", Leaf),
                ("persistence_disabled", Leaf),
                ("max_count", Leaf),
                ("max_age_secs", Leaf),
            ])),
        ),
        (
            "notifications",
            Struct(HashMap::from([
                ("on_begin", Leaf),
                ("on_complete", Leaf),
                ("on_success", Leaf),
                ("on_error", Leaf),
                ("on_cancellation", Leaf),
                ("on_broken", Leaf),
                ("on_fixed", Leaf),
                ("on_enabled", Leaf),
                ("on_disabled", Leaf),
                ("max_retries", Leaf),
                ("retry_wait_secs", Leaf),
                ("webhook", webhook),
                ("slack", slack()),
                ("email", email()),
            ])),
        ),
        (
            "shell",
            Struct(HashMap::from([
                ("skip_expand_env", Leaf),
                ("discard_output", Leaf),
                ("hide_output", Leaf),
                ("working_dir", Leaf),
                ("env", Map),
            ])),
        ),
    ]));

    Struct(HashMap::from([
        ("title", Leaf),
        (
            "server",
            Struct(HashMap::from([("bind", Leaf), ("disabled", Leaf)])),
        ),
        (
            "history",
            Struct(HashMap::from([
                ("backend", Leaf),
                ("path", Leaf),
                ("url", Leaf),
            ])),
        ),
        ("slack", slack()),
        ("email", email()),
        ("metrics", Struct(HashMap::from([("enabled", Leaf)]))),
        ("jobs", Array(Box::new(job))),
    ]))
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b_len = b.chars().count();
    if a.is_empty() {
        return b_len;
    }
    if b_len == 0 {
        return a.chars().count();
    }

    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.chars().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_len]
}

fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    let mut best: Option<(&'a str, usize)> = None;
    for &candidate in candidates {
        let d = levenshtein(needle, candidate);
        if d > 0 && d <= max_distance && best.as_ref().is_none_or(|(_, bd)| d < *bd) {
            best = Some((candidate, d));
        }
    }
    best.map(|(s, _)| s)
}

fn check_unknown_fields(
    value: &serde_json::Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match (value, schema) {
        (serde_json::Value::Object(table), KnownKeys::Struct(fields)) => {
            let mut known_keys: Vec<&str> = fields.keys().copied().collect();
            known_keys.sort_unstable();
            for (key, child_value) in table {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                if let Some(child_schema) = fields.get(key.as_str()) {
                    check_unknown_fields(child_value, child_schema, &path, diagnostics);
                } else {
                    let message = match suggest(key, &known_keys, 3) {
                        Some(s) => format!("unknown field (did you mean \"{s}\"?)"),
                        None => "unknown field".to_string(),
                    };
                    diagnostics.push(Diagnostic::error("unknown-field", path, message));
                }
            }
        },
        (serde_json::Value::Array(items), KnownKeys::Array(item_schema)) => {
            for (i, item) in items.iter().enumerate() {
                check_unknown_fields(item, item_schema, &format!("{prefix}[{i}]"), diagnostics);
            }
        },
        // Leaf, dynamic map, or type mismatch (serde reports the latter).
        _ => {},
    }
}

fn check_semantics(config: &JobkitConfig, diagnostics: &mut Vec<Diagnostic>) {
    match &config.history {
        HistoryBackend::File { path } if path.as_os_str().is_empty() => {
            diagnostics.push(Diagnostic::error("history", "history.path", "must not be empty"));
        },
        HistoryBackend::Sqlite { url } if url.trim().is_empty() => {
            diagnostics.push(Diagnostic::error("history", "history.url", "must not be empty"));
        },
        _ => {},
    }

    let mut names = HashSet::new();
    for (i, job) in config.jobs.iter().enumerate() {
        let at = |field: &str| format!("jobs[{i}].{field}");

        if job.name.trim().is_empty() {
            diagnostics.push(Diagnostic::error("job", at("name"), "job name is required"));
        } else if !names.insert(job.name.as_str()) {
            diagnostics.push(Diagnostic::error(
                "job",
                at("name"),
                format!("duplicate job name \"{}\"", job.name),
            ));
        }

        let scheduled = match Schedule::parse(&job.schedule) {
            Ok(schedule) => !schedule.is_on_demand(),
            Err(e) => {
                diagnostics.push(Diagnostic::error("schedule", at("schedule"), e.to_string()));
                false
            },
        };

        if job.exec.first().is_none_or(|program| program.trim().is_empty()) {
            diagnostics.push(Diagnostic::error("job", at("exec"), "exec must name a program"));
        }

        let mut params = HashSet::new();
        for (j, param) in job.parameters.iter().enumerate() {
            let path = format!("jobs[{i}].parameters[{j}].name");
            if param.name.trim().is_empty() {
                diagnostics.push(Diagnostic::error("job", path, "parameter name is required"));
            } else if !params.insert(param.name.as_str()) {
                diagnostics.push(Diagnostic::error(
                    "job",
                    path,
                    format!("duplicate parameter \"{}\"", param.name),
                ));
            }
        }

        if let Some(param) = job
            .parameters
            .iter()
            .find(|p| scheduled && p.required && p.default.is_none())
        {
            diagnostics.push(Diagnostic::warning(
                "job",
                at("parameters"),
                format!(
                    "scheduled runs will fail: required parameter \"{}\" has no default",
                    param.name
                ),
            ));
        }

        if job.timeout_secs > 0 && job.shutdown_grace_period_secs > job.timeout_secs {
            diagnostics.push(Diagnostic::warning(
                "job",
                at("shutdown_grace_period_secs"),
                "grace period is longer than the timeout",
            ));
        }
    }
}

/// Check a typed config.
#[must_use]
pub fn validate_config(config: &JobkitConfig) -> ValidationResult {
    let mut result = ValidationResult::default();
    check_semantics(config, &mut result.diagnostics);
    result
}

/// Validate config text. The format comes from `path`'s extension.
#[must_use]
pub fn validate_str(raw: &str, path: &Path) -> ValidationResult {
    let mut result = ValidationResult {
        config_path: Some(path.to_path_buf()),
        ..Default::default()
    };
    let raw = crate::env_subst::substitute_env(raw);

    match loader::parse_config(&raw, path) {
        Ok(config) => {
            if let Ok(value) = loader::parse_config_value(&raw, path) {
                check_unknown_fields(&value, &build_schema_map(), "", &mut result.diagnostics);
            }
            check_semantics(&config, &mut result.diagnostics);
        },
        Err(e) => result
            .diagnostics
            .push(Diagnostic::error("syntax", "", e.to_string())),
    }
    result
}

/// Validate a config file, or the discovered one when `path` is `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let Some(path) = path.map(Path::to_path_buf).or_else(loader::find_config_file) else {
        return ValidationResult {
            diagnostics: vec![Diagnostic {
                severity: Severity::Info,
                category: "syntax",
                path: String::new(),
                message: "no config file found".into(),
            }],
            config_path: None,
        };
    };

    match std::fs::read_to_string(&path) {
        Ok(raw) => validate_str(&raw, &path),
        Err(e) => ValidationResult {
            diagnostics: vec![Diagnostic::error(
                "syntax",
                "",
                format!("failed to read config file: {e}"),
            )],
            config_path: Some(path),
        },
    }
}

impl JobkitConfig {
    /// Every error-level problem, as [`Error::Invalid`].
    pub fn validate(&self) -> Result<()> {
        validate_config(self).into_result()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::schema::{JobConfig, ParameterConfig},
        rstest::rstest,
    };

    fn job(name: &str, schedule: &str, exec: &[&str]) -> JobConfig {
        JobConfig {
            name: name.into(),
            schedule: schedule.into(),
            exec: exec.iter().map(ToString::to_string).collect(),
            ..Default::default()
        }
    }

    fn paths(result: &ValidationResult, severity: Severity) -> Vec<String> {
        result
            .diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .map(|d| d.path.clone())
            .collect()
    }

    #[test]
    fn valid_config_has_no_diagnostics() {
        let config = JobkitConfig {
            jobs: vec![
                job("backup", "@daily", &["pg_dump"]),
                job("report", "", &["make", "report"]),
            ],
            ..Default::default()
        };
        assert!(validate_config(&config).diagnostics.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn reports_every_problem() {
        let config = JobkitConfig {
            jobs: vec![
                job("", "@daily", &["true"]),
                job("a", "not a schedule", &["true"]),
                job("a", "@hourly", &[]),
            ],
            ..Default::default()
        };
        let result = validate_config(&config);
        assert_eq!(paths(&result, Severity::Error), vec![
            "jobs[0].name",
            "jobs[1].schedule",
            "jobs[2].name",
            "jobs[2].exec",
        ]);

        let err = config.validate().unwrap_err();
        match err {
            Error::Invalid { diagnostics } => assert_eq!(diagnostics.len(), 4),
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn warns_about_required_parameters_on_scheduled_jobs() {
        let mut scheduled = job("a", "@every 1m", &["deploy", "${TARGET}"]);
        scheduled.parameters.push(ParameterConfig {
            name: "TARGET".into(),
            required: true,
            ..Default::default()
        });
        let result = validate_config(&JobkitConfig {
            jobs: vec![scheduled],
            ..Default::default()
        });
        assert!(!result.has_errors());
        assert_eq!(result.count(Severity::Warning), 1);
    }

    #[rstest]
    #[case("jobs.toml", "titel = \"x\"\n", "titel", Some("title"))]
    #[case(
        "jobs.toml",
        "[[jobs]]\nname = \"a\"\nexec = [\"true\"]\nshedule = \"@daily\"\n",
        "jobs[0].shedule",
        Some("schedule")
    )]
    #[case(
        "jobs.yaml",
        "jobs:\n  - name: a\n    exec: [\"true\"]\n    notifications:\n      on_eror: true\n",
        "jobs[0].notifications.on_eror",
        Some("on_error")
    )]
    #[case("jobs.json", "{\"zzzzzzzz\": 1}", "zzzzzzzz", None)]
    fn unknown_fields_are_reported(
        #[case] file: &str,
        #[case] raw: &str,
        #[case] path: &str,
        #[case] hint: Option<&str>,
    ) {
        let result = validate_str(raw, Path::new(file));
        let diagnostic = result
            .diagnostics
            .iter()
            .find(|d| d.category == "unknown-field")
            .expect("unknown field diagnostic");
        assert_eq!(diagnostic.path, path);
        match hint {
            Some(hint) => assert!(diagnostic.message.contains(hint)),
            None => assert_eq!(diagnostic.message, "unknown field"),
        }
    }

    #[test]
    fn dynamic_maps_accept_any_key() {
        let raw = "[[jobs]]\nname = \"a\"\nexec = [\"true\"]\n[jobs.labels]\nanything = \"x\"\n";
        let result = validate_str(raw, Path::new("jobkit.toml"));
        assert!(result.diagnostics.is_empty(), "{:?}", result.diagnostics);
    }

    #[test]
    fn syntax_errors_are_reported() {
        let result = validate_str("jobs = [", Path::new("jobkit.toml"));
        assert!(result.has_errors());
        assert_eq!(result.diagnostics[0].category, "syntax");
    }

    #[test]
    fn validate_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobkit.toml");
        std::fs::write(&path, "[[jobs]]\nname = \"a\"\nexec = [\"true\"]\n").unwrap();
        let result = validate(Some(&path));
        assert!(!result.has_errors());
        assert_eq!(result.config_path.as_deref(), Some(path.as_path()));

        let missing = validate(Some(&dir.path().join("nope.toml")));
        assert!(missing.has_errors());
    }
}
