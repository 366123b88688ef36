//! Slugs for job names used in file names, labels, and URLs.

/// Lowercase `name`, map every run of non-alphanumeric characters to a single
/// `-`, and trim leading/trailing dashes.
#[must_use]
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars() {
        if ch.is_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}
