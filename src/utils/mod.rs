//! Shared string helpers.

/// Truncates `s` to at most `max` bytes on a char boundary, marking the cut.
pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}... [truncated]", &s[..end])
}

/// Keeps the last `max` bytes of `s`; test and agent failures print at the end.
pub fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) && start < s.len() {
        start += 1;
    }
    format!("[truncated] ...{}", &s[start..])
}

/// Lowercase slug safe for container names and directory prefixes.
///
/// Runs of other characters collapse into a single `-`.
pub fn slugify(raw: &str, max: usize) -> String {
    let mut slug = String::with_capacity(raw.len().min(max));
    let mut last_dash = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash && !slug.is_empty() {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= max {
            break;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}
