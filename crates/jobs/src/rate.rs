use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Rate limit for one event type: consecutive deliveries are spaced
/// `delta` apart, and an idle type may burst at most `max_age` worth of
/// backlog.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub delta: std::time::Duration,
    pub max_age: std::time::Duration,
}

/// Per-process schedule state: the last slot assigned to each rate-limited
/// event type. The persisted `scheduled_at` keeps restarts safe.
#[derive(Debug, Default)]
pub(crate) struct RateState {
    slots: HashMap<String, DateTime<Utc>>,
}

impl RateState {
    /// Assign the next delivery slot for `type_`. Slots advance by
    /// `delta` per call; a slot older than `now - max_age` collapses to
    /// `now`, which bounds the burst an idle type may accumulate.
    pub fn next_slot(&mut self, type_: &str, limit: &RateLimit, now: DateTime<Utc>) -> DateTime<Utc> {
        let delta = Duration::from_std(limit.delta).unwrap_or(Duration::zero());
        let max_age = Duration::from_std(limit.max_age).unwrap_or(Duration::zero());

        let candidate = match self.slots.get(type_) {
            Some(previous) => *previous + delta,
            None => now,
        };
        let slot = if candidate < now - max_age { now } else { candidate };

        self.slots.insert(type_.to_string(), slot);
        slot
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn limit(delta_ms: i64, max_age_ms: i64) -> RateLimit {
        RateLimit {
            delta: std::time::Duration::from_millis(delta_ms as u64),
            max_age: std::time::Duration::from_millis(max_age_ms as u64),
        }
    }

    #[test]
    fn burst_is_spaced_by_delta() {
        let mut state = RateState::default();
        let limit = limit(500, 60_000);
        let t0 = Utc::now();

        assert_eq!(state.next_slot("refresh", &limit, t0), t0);
        assert_eq!(
            state.next_slot("refresh", &limit, t0),
            t0 + Duration::milliseconds(500)
        );
        assert_eq!(
            state.next_slot("refresh", &limit, t0),
            t0 + Duration::milliseconds(1000)
        );
        assert_eq!(
            state.next_slot("refresh", &limit, t0),
            t0 + Duration::milliseconds(1500)
        );
    }

    #[test]
    fn stale_slot_collapses_to_now() {
        let mut state = RateState::default();
        let limit = limit(500, 1_000);
        let t0 = Utc::now();

        state.next_slot("refresh", &limit, t0);
        // Two hours later the stale slot is far past `now - max_age`.
        let later = t0 + Duration::hours(2);
        assert_eq!(state.next_slot("refresh", &limit, later), later);
    }

    #[test]
    fn types_are_independent() {
        let mut state = RateState::default();
        let limit = limit(500, 60_000);
        let t0 = Utc::now();

        state.next_slot("refresh", &limit, t0);
        state.next_slot("refresh", &limit, t0);
        // A different type starts its own schedule.
        assert_eq!(state.next_slot("rebuild", &limit, t0), t0);
    }
}
