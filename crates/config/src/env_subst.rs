//! `${VAR}` substitution applied to raw config text before parsing.

/// Replace `${VAR}` placeholders with values from the process environment.
///
/// Unset variables are left as written so parameter references such as
/// `${TARGET}` reach the shell action intact. `$${` produces a literal `${`
/// even when the variable is set.
pub fn substitute_env(input: &str) -> String {
    substitute_env_with(input, |name| std::env::var(name).ok())
}

pub(crate) fn substitute_env_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        let (before, tail) = rest.split_at(start);
        let after = &tail[2..];
        if let Some(before) = before.strip_suffix('$') {
            out.push_str(before);
            out.push_str("${");
            rest = after;
            continue;
        }
        out.push_str(before);

        match after.find('}') {
            Some(end) if end > 0 => {
                let name = &after[..end];
                match lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&tail[..end + 3]),
                }
                rest = &after[end + 1..];
            },
            _ => {
                out.push_str("${");
                rest = after;
            },
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    fn lookup(name: &str) -> Option<String> {
        match name {
            "JOBKIT_HOST" => Some("db.internal".to_string()),
            "EMPTY" => Some(String::new()),
            _ => None,
        }
    }

    #[rstest]
    #[case("url = \"postgres://${JOBKIT_HOST}/app\"", "url = \"postgres://db.internal/app\"")]
    #[case("${JOBKIT_HOST}:${JOBKIT_HOST}", "db.internal:db.internal")]
    #[case("a${EMPTY}b", "ab")]
    #[case("echo ${TARGET}", "echo ${TARGET}")]
    #[case("echo $${JOBKIT_HOST}", "echo ${JOBKIT_HOST}")]
    #[case("echo ${OOPS", "echo ${OOPS")]
    #[case("${}", "${}")]
    #[case("cost $5 and $HOME", "cost $5 and $HOME")]
    #[case("plain text", "plain text")]
    fn substitutes(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(substitute_env_with(input, lookup), expected);
    }
}
