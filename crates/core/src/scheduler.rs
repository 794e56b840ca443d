use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::{config::SchedulerConfig, types::AttemptRecord};

/// Expanding-interval scheduler: a correct answer multiplies the previous interval by the
/// growth factor, a miss resets it to the base interval.
#[derive(Debug, Clone)]
pub struct SpacedRepetitionScheduler {
    config: SchedulerConfig,
}

impl SpacedRepetitionScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn interval(&self, prior: Option<&AttemptRecord>, correct: bool) -> Duration {
        if !correct {
            return self.config.base_interval;
        }

        let previous = prior
            .map(|p| p.next_due_at - p.attempted_at)
            .filter(|d| *d > Duration::zero())
            .unwrap_or(self.config.base_interval);
        let grown_ms = previous.num_milliseconds() as f64 * self.config.growth_factor;
        let grown = if grown_ms >= self.config.max_interval.num_milliseconds() as f64 {
            self.config.max_interval
        } else {
            Duration::milliseconds(grown_ms.round() as i64)
        };
        grown.min(self.config.max_interval)
    }

    pub fn next_due(
        &self,
        prior: Option<&AttemptRecord>,
        correct: bool,
        attempted_at: DateTime<Utc>,
    ) -> DateTime<Utc> {
        attempted_at + self.interval(prior, correct)
    }

    /// Latest attempt per question. Equal timestamps resolve to the one appended last.
    pub fn latest_per_question(
        attempts: &[AttemptRecord],
    ) -> BTreeMap<(&str, u32, u32), &AttemptRecord> {
        let mut latest: BTreeMap<(&str, u32, u32), &AttemptRecord> = BTreeMap::new();
        for attempt in attempts {
            let key = attempt.question_key();
            match latest.get(&key) {
                Some(current) if current.attempted_at > attempt.attempted_at => {}
                _ => {
                    latest.insert(key, attempt);
                }
            }
        }
        latest
    }

    /// Questions whose latest attempt is due at `now`, soonest first, ties in question order.
    pub fn due<'a>(
        &self,
        attempts: &'a [AttemptRecord],
        now: DateTime<Utc>,
    ) -> Vec<&'a AttemptRecord> {
        let mut due: Vec<&AttemptRecord> = Self::latest_per_question(attempts)
            .into_values()
            .filter(|a| a.next_due_at <= now)
            .collect();
        due.sort_by(|a, b| {
            a.next_due_at
                .cmp(&b.next_due_at)
                .then_with(|| a.question_key().cmp(&b.question_key()))
        });
        due
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()
    }

    fn scheduler() -> SpacedRepetitionScheduler {
        SpacedRepetitionScheduler::new(SchedulerConfig::default())
    }

    fn attempt(
        scheduler: &SpacedRepetitionScheduler,
        prior: Option<&AttemptRecord>,
        question_index: u32,
        correct: bool,
        at: DateTime<Utc>,
    ) -> AttemptRecord {
        AttemptRecord {
            learner_id: "learner".into(),
            video_id: "abc123".into(),
            module_index: 0,
            question_index,
            chosen_option: "A".into(),
            correct,
            flagged: !correct,
            attempted_at: at,
            next_due_at: scheduler.next_due(prior, correct, at),
        }
    }

    #[test]
    fn correct_answers_expand_and_miss_resets() {
        let s = scheduler();
        let first = attempt(&s, None, 0, true, t0());
        assert_eq!(first.next_due_at - first.attempted_at, Duration::days(2));

        let second_at = first.next_due_at;
        let second = attempt(&s, Some(&first), 0, true, second_at);
        assert_eq!(second.next_due_at - second.attempted_at, Duration::days(4));

        let third_at = second.next_due_at + Duration::hours(3);
        let third = attempt(&s, Some(&second), 0, false, third_at);
        assert_eq!(third.next_due_at, third_at + Duration::days(1));
        assert!(third.flagged);
    }

    #[test]
    fn interval_is_capped() {
        let s = SpacedRepetitionScheduler::new(SchedulerConfig {
            base_interval: Duration::days(1),
            growth_factor: 10.0,
            max_interval: Duration::days(30),
        });
        let first = attempt(&s, None, 0, true, t0());
        let second = attempt(&s, Some(&first), 0, true, first.next_due_at);
        assert_eq!(second.next_due_at - second.attempted_at, Duration::days(30));
    }

    #[test]
    fn due_uses_latest_attempt_only() {
        let s = scheduler();
        let missed = attempt(&s, None, 0, false, t0());
        let fixed = attempt(&s, Some(&missed), 0, true, t0() + Duration::hours(1));
        let attempts = vec![missed, fixed];

        assert!(s.due(&attempts, t0() + Duration::days(1)).is_empty());
        let due = s.due(&attempts, t0() + Duration::days(3));
        assert_eq!(due.len(), 1);
        assert!(due[0].correct);
    }

    #[test]
    fn due_orders_by_due_time_then_question_order() {
        let s = scheduler();
        let attempts = vec![
            attempt(&s, None, 2, false, t0()),
            attempt(&s, None, 1, false, t0()),
            attempt(&s, None, 0, true, t0()),
            attempt(&s, None, 3, false, t0() - Duration::hours(2)),
        ];

        let due: Vec<u32> = s
            .due(&attempts, t0() + Duration::days(5))
            .iter()
            .map(|a| a.question_index)
            .collect();
        assert_eq!(due, vec![3, 1, 2, 0]);

        let due_now: Vec<u32> = s
            .due(&attempts, t0() + Duration::days(1))
            .iter()
            .map(|a| a.question_index)
            .collect();
        assert_eq!(due_now, vec![3, 1, 2]);
    }
}
