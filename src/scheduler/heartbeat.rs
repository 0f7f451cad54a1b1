//! Heartbeat eligibility and affect decay.

use chrono::{DateTime, Utc};

use crate::store::{Concept, PersonaEntity, Topic};

/// Minimum `level_ideal - level_current` for a concept to prompt outreach.
pub const MIN_DESIRE_GAP: f64 = 0.3;

/// Tolerance for levels that land a rounding error short of the gap.
const GAP_EPSILON: f64 = 1e-9;

/// Concepts at or below this sentiment are never raised unprompted.
pub const MIN_SENTIMENT: f64 = -0.5;

/// First concept that justifies a heartbeat, if any.
pub fn heartbeat_candidate<C: Concept>(concepts: &[C]) -> Option<&C> {
    concepts
        .iter()
        .find(|c| c.desire_gap() >= MIN_DESIRE_GAP - GAP_EPSILON && c.sentiment() > MIN_SENTIMENT)
}

/// Whether enough silence has passed for the persona to reach out.
///
/// Silence is measured from the later of the last message and the last heartbeat.
pub fn silence_elapsed(persona: &PersonaEntity, now: DateTime<Utc>, default_delay: std::time::Duration) -> bool {
    let delay = persona
        .heartbeat_delay_ms
        .map(std::time::Duration::from_millis)
        .unwrap_or(default_delay);
    let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);

    let since = match (persona.last_activity, persona.last_heartbeat) {
        (Some(a), Some(h)) => a.max(h),
        (Some(a), None) => a,
        (None, Some(h)) => h,
        (None, None) => persona.created_at,
    };
    now.signed_duration_since(since) >= delay
}

/// Decay `level_current` toward zero by `per_day`, prorated over `elapsed`.
///
/// Returns true if any level moved.
pub fn decay_topics(topics: &mut [Topic], elapsed: chrono::Duration, per_day: f64) -> bool {
    let days = elapsed.num_milliseconds() as f64 / 86_400_000.0;
    if days <= 0.0 || per_day <= 0.0 {
        return false;
    }
    let amount = per_day * days;
    let now = Utc::now();

    let mut changed = false;
    for topic in topics.iter_mut().filter(|t| t.level_current > 0.0) {
        topic.level_current = (topic.level_current - amount).max(0.0);
        topic.last_updated = now;
        changed = true;
    }
    changed
}
