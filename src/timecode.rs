//! `HH:MM:SS.mmm` timecode conversion used by schedule positions and
//! tracking-macro context.

/// Format a position in seconds as `HH:MM:SS.mmm`.
///
/// Rounds to the nearest millisecond first so `0.9996` renders as
/// `00:00:01.000` rather than carrying a stray `999`.
pub fn timecode_to_string(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    let s = total_secs % 60;
    let m = (total_secs / 60) % 60;
    let h = total_secs / 3600;
    format!("{h:02}:{m:02}:{s:02}.{ms:03}")
}

/// Parse a schedule position into seconds.
///
/// Accepts either a plain number of seconds (`"93.5"`) or a colon-separated
/// timecode with any number of leading fields (`"SS"`, `"MM:SS"`,
/// `"HH:MM:SS.mmm"`). Returns `None` if any field fails to parse.
pub fn timecode_from_string(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if !value.contains(':') {
        return value.parse::<f64>().ok().filter(|v| v.is_finite());
    }
    let mut total = 0.0;
    for field in value.split(':') {
        let part = field.parse::<f64>().ok().filter(|v| v.is_finite())?;
        total = total * 60.0 + part;
    }
    Some(total)
}
