//! Context window selection.
//!
//! Decides which messages of a persona's history are part of the active
//! conversational context handed to the model.

use chrono::{DateTime, Duration, Utc};

use super::types::{ContextStatus, Message};

/// Whether a single message belongs to the active context.
///
/// `Always` beats `Never`, which beats the default rule. The default rule keeps a
/// message when it is inside the sliding window and not before the persona's
/// context boundary.
pub fn in_context(message: &Message, now: DateTime<Utc>, window: Duration, boundary: Option<DateTime<Utc>>) -> bool {
    match message.context_status {
        ContextStatus::Always => true,
        ContextStatus::Never => false,
        ContextStatus::Default => {
            if let Some(boundary) = boundary
                && message.timestamp < boundary
            {
                return false;
            }
            message.timestamp >= now - window
        }
    }
}

/// Filter a history down to its active context, preserving order.
pub fn select_context<'a>(
    messages: &'a [Message],
    now: DateTime<Utc>,
    window: Duration,
    boundary: Option<DateTime<Utc>>,
) -> Vec<&'a Message> {
    messages
        .iter()
        .filter(|m| in_context(m, now, window, boundary))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(age_minutes: i64, status: ContextStatus, now: DateTime<Utc>) -> Message {
        let mut m = Message::human(format!("{} minutes ago", age_minutes)).at(now - Duration::minutes(age_minutes));
        m.context_status = status;
        m
    }

    #[test]
    fn test_window_applies_to_default() {
        let now = Utc::now();
        let window = Duration::hours(1);
        assert!(in_context(&msg(30, ContextStatus::Default, now), now, window, None));
        assert!(!in_context(&msg(90, ContextStatus::Default, now), now, window, None));
    }

    #[test]
    fn test_always_overrides_window_and_boundary() {
        let now = Utc::now();
        let boundary = Some(now - Duration::minutes(10));
        assert!(in_context(&msg(600, ContextStatus::Always, now), now, Duration::hours(1), boundary));
    }

    #[test]
    fn test_never_overrides_window() {
        let now = Utc::now();
        assert!(!in_context(&msg(1, ContextStatus::Never, now), now, Duration::hours(1), None));
    }

    #[test]
    fn test_boundary_excludes_older_default_messages() {
        let now = Utc::now();
        let boundary = Some(now - Duration::minutes(10));
        let history = vec![
            msg(20, ContextStatus::Default, now),
            msg(5, ContextStatus::Default, now),
            msg(30, ContextStatus::Always, now),
        ];

        let selected = select_context(&history, now, Duration::hours(8), boundary);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].content, "5 minutes ago");
        assert_eq!(selected[1].content, "30 minutes ago");
    }
}
