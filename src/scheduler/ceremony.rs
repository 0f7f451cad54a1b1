//! Daily ceremony timing and digest.

use chrono::{NaiveDateTime, NaiveTime};

use crate::store::PendingValidation;

/// Whether the ceremony should run at `now`.
///
/// Compares calendar dates, not elapsed time: a ceremony at 23:59 does not
/// block one at 09:00 the next morning.
pub fn ceremony_due(now: NaiveDateTime, last: Option<NaiveDateTime>, time: NaiveTime) -> bool {
    if now.time() < time {
        return false;
    }
    match last {
        Some(last) => last.date() != now.date(),
        None => true,
    }
}

/// Lowest-confidence validations first, at most `max_items`.
pub fn digest(validations: &[PendingValidation], max_items: usize) -> Vec<&PendingValidation> {
    let mut sorted: Vec<&PendingValidation> = validations.iter().collect();
    sorted.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));
    sorted.truncate(max_items);
    sorted
}

/// Plain-text rendering of a digest, used as prompt input and as a fallback message.
pub fn render_digest(items: &[&PendingValidation]) -> String {
    let mut out = String::from("Things I'm not sure about yet:\n");
    for (i, v) in items.iter().enumerate() {
        out.push_str(&format!("{}. {} ({:.0}% sure)", i + 1, v.item_name, v.confidence * 100.0));
        if !v.description.is_empty() {
            out.push_str(&format!(": {}", v.description));
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}
