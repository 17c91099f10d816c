//! Contact identifier normalization shared by intake and inbound matching.

/// Strip everything but digits; ten-digit numbers are assumed North American
/// and get the `1` country code. Returns `None` if no digits remain.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        0 => None,
        10 => Some(format!("1{digits}")),
        _ => Some(digits),
    }
}

/// Lowercase, unwrap a `Name <addr>` display form, and trim.
/// Returns `None` for blank input.
pub fn normalize_email(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let addr = match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(open), Some(close)) if open < close => &trimmed[open + 1..close],
        _ => trimmed,
    };
    let addr = addr.trim().trim_matches('"').to_lowercase();
    if addr.is_empty() { None } else { Some(addr) }
}
