//! `$NAME` / `${NAME}` expansion for command arguments.

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Replace `$NAME` and `${NAME}` in `input` using `lookup`.
///
/// When `lookup` returns `None` the reference is kept verbatim. `$$` is a
/// literal `$`, as is a `$` not followed by a name.
pub fn expand(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
            continue;
        }

        if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => {
                    let name = &braced[..end];
                    match lookup(name) {
                        Some(value) => out.push_str(&value),
                        None => out.push_str(&rest[pos..pos + 2 + end + 1]),
                    }
                    rest = &braced[end + 1..];
                },
                None => {
                    out.push_str(&rest[pos..]);
                    rest = "";
                },
            }
            continue;
        }

        let len = after
            .char_indices()
            .find(|&(_, c)| !is_name_char(c))
            .map_or(after.len(), |(i, _)| i);
        if len == 0 {
            out.push('$');
            rest = after;
            continue;
        }
        let name = &after[..len];
        match lookup(name) {
            Some(value) => out.push_str(&value),
            None => {
                out.push('$');
                out.push_str(name);
            },
        }
        rest = &after[len..];
    }

    out.push_str(rest);
    out
}
