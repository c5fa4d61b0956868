//! Schedule policies and slot computation.
//!
//! A policy maps wall-clock time onto logical slots: the nominal time
//! periods runs are materialized for. Cron policies accept standard
//! 5-field Unix expressions (minute, hour, day-of-month, month,
//! day-of-week) and are converted to the 6-field format (with seconds)
//! the `cron` crate expects.

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::graph::DefinitionError;

/// Convert a 5-field Unix cron expression to 6-field format.
///
/// The `cron` crate requires 6 fields (sec min hour dom month dow), but
/// standard Unix cron uses 5. Prepending "0 " fires at second 0 of each
/// match.
fn normalize_cron_expr(cron_expr: &str) -> String {
    let fields: Vec<&str> = cron_expr.split_whitespace().collect();
    if fields.len() == 5 {
        format!("0 {}", cron_expr)
    } else {
        cron_expr.to_string()
    }
}

fn parse_cron(cron_expr: &str) -> Result<Schedule, DefinitionError> {
    Schedule::from_str(&normalize_cron_expr(cron_expr)).map_err(|e| DefinitionError::InvalidCron {
        expr: cron_expr.to_string(),
        reason: e.to_string(),
    })
}

/// When a graph materializes new runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulePolicy {
    /// Only `trigger_run`/`backfill` create runs.
    Manual,
    /// Fixed interval anchored at the graph's start boundary.
    Interval { every_seconds: i64 },
    /// 5-field Unix cron expression (6-field with seconds accepted).
    Cron { expr: String },
}

impl SchedulePolicy {
    /// Validate the policy at graph load time.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        match self {
            Self::Manual => Ok(()),
            Self::Interval { every_seconds } => {
                if *every_seconds <= 0 {
                    return Err(DefinitionError::InvalidInterval(*every_seconds));
                }
                Ok(())
            }
            Self::Cron { expr } => parse_cron(expr).map(|_| ()),
        }
    }

    /// Slot boundaries strictly after `after` and no later than `until`,
    /// oldest first, capped at `limit`.
    ///
    /// `anchor` is the graph's logical start boundary; interval slots are
    /// anchored there, cron slots live on the absolute cron grid.
    pub fn occurrences(
        &self,
        anchor: DateTime<Utc>,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Vec<DateTime<Utc>> {
        let floor = after.max(anchor);
        match self {
            Self::Manual => Vec::new(),
            Self::Interval { every_seconds } => {
                let elapsed = (floor - anchor).num_seconds();
                // Candidate at or just before `floor`; the `slot > floor`
                // guard below discards anything not strictly after it.
                let mut k = (elapsed / every_seconds).max(1);
                let mut slots = Vec::new();
                loop {
                    let slot = anchor + Duration::seconds(every_seconds * k);
                    if slot > until || slots.len() >= limit {
                        break;
                    }
                    if slot > floor {
                        slots.push(slot);
                    }
                    k += 1;
                }
                slots
            }
            Self::Cron { expr } => {
                let Ok(schedule) = parse_cron(expr) else {
                    // Unparseable expressions are rejected at load time.
                    return Vec::new();
                };
                schedule
                    .after(&floor)
                    .take_while(|slot| *slot <= until)
                    .take(limit)
                    .collect()
            }
        }
    }

    /// Slots due at `now` that are newer than the last materialized slot.
    pub fn due_slots(
        &self,
        anchor: DateTime<Utc>,
        last: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Vec<DateTime<Utc>> {
        self.occurrences(anchor, last.unwrap_or(anchor), now, limit)
    }

    /// Slots within `[start, end]`, used by backfill.
    pub fn slots_between(
        &self,
        anchor: DateTime<Utc>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Vec<DateTime<Utc>> {
        self.occurrences(anchor, start - Duration::milliseconds(1), end, limit)
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Interval { .. } => "interval",
            Self::Cron { .. } => "cron",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, 0, 0).unwrap()
    }

    #[test]
    fn normalize_prepends_seconds_to_five_field_exprs() {
        assert_eq!(normalize_cron_expr("* * * * *"), "0 * * * * *");
        assert_eq!(normalize_cron_expr("0 6 * * *"), "0 0 6 * * *");
        // 6-field expressions pass through unchanged.
        assert_eq!(normalize_cron_expr("0 0 * * * *"), "0 0 * * * *");
    }

    #[test]
    fn validate_accepts_standard_cron() {
        assert!(SchedulePolicy::Cron { expr: "0 * * * *".into() }.validate().is_ok());
        assert!(SchedulePolicy::Cron { expr: "0 0 * * *".into() }.validate().is_ok());
        assert!(SchedulePolicy::Cron { expr: "0 0 * * * *".into() }.validate().is_ok());
    }

    #[test]
    fn validate_rejects_garbage() {
        assert!(SchedulePolicy::Cron { expr: "invalid".into() }.validate().is_err());
        assert!(SchedulePolicy::Cron { expr: "".into() }.validate().is_err());
        assert!(SchedulePolicy::Interval { every_seconds: 0 }.validate().is_err());
        assert!(SchedulePolicy::Interval { every_seconds: -5 }.validate().is_err());
    }

    #[test]
    fn manual_policy_never_produces_slots() {
        let policy = SchedulePolicy::Manual;
        let slots = policy.due_slots(utc(2026, 1, 1, 0), None, utc(2026, 2, 1, 0), 100);
        assert!(slots.is_empty());
    }

    #[test]
    fn interval_slots_are_anchored_and_chronological() {
        let policy = SchedulePolicy::Interval { every_seconds: 86_400 };
        let anchor = utc(2026, 1, 1, 0);

        let slots = policy.due_slots(anchor, None, utc(2026, 1, 6, 0), 100);
        assert_eq!(
            slots,
            vec![
                utc(2026, 1, 2, 0),
                utc(2026, 1, 3, 0),
                utc(2026, 1, 4, 0),
                utc(2026, 1, 5, 0),
                utc(2026, 1, 6, 0),
            ]
        );
    }

    #[test]
    fn interval_slots_resume_after_last() {
        let policy = SchedulePolicy::Interval { every_seconds: 3600 };
        let anchor = utc(2026, 1, 1, 0);

        let slots = policy.due_slots(anchor, Some(utc(2026, 1, 1, 2)), utc(2026, 1, 1, 4), 100);
        assert_eq!(slots, vec![utc(2026, 1, 1, 3), utc(2026, 1, 1, 4)]);
    }

    #[test]
    fn interval_slot_on_boundary_is_not_repeated() {
        let policy = SchedulePolicy::Interval { every_seconds: 3600 };
        let anchor = utc(2026, 1, 1, 0);

        // `last` exactly on a slot boundary: that slot is done.
        let slots = policy.due_slots(anchor, Some(utc(2026, 1, 1, 1)), utc(2026, 1, 1, 1), 100);
        assert!(slots.is_empty());
    }

    #[test]
    fn cron_slots_follow_the_grid() {
        let policy = SchedulePolicy::Cron { expr: "0 6 * * *".into() };
        let anchor = utc(2026, 1, 1, 0);

        let slots = policy.due_slots(anchor, None, utc(2026, 1, 3, 12), 100);
        assert_eq!(slots, vec![utc(2026, 1, 1, 6), utc(2026, 1, 2, 6), utc(2026, 1, 3, 6)]);
    }

    #[test]
    fn occurrences_respect_limit() {
        let policy = SchedulePolicy::Interval { every_seconds: 60 };
        let anchor = utc(2026, 1, 1, 0);

        let slots = policy.due_slots(anchor, None, utc(2026, 1, 2, 0), 10);
        assert_eq!(slots.len(), 10);
    }

    #[test]
    fn slots_between_is_start_inclusive() {
        let policy = SchedulePolicy::Interval { every_seconds: 86_400 };
        let anchor = utc(2026, 1, 1, 0);

        let slots = policy.slots_between(anchor, utc(2026, 1, 3, 0), utc(2026, 1, 5, 0), 100);
        assert_eq!(slots, vec![utc(2026, 1, 3, 0), utc(2026, 1, 4, 0), utc(2026, 1, 5, 0)]);
    }

    #[test]
    fn slots_never_precede_the_anchor() {
        let policy = SchedulePolicy::Interval { every_seconds: 86_400 };
        let anchor = utc(2026, 1, 10, 0);

        let slots = policy.slots_between(anchor, utc(2026, 1, 1, 0), utc(2026, 1, 12, 0), 100);
        assert_eq!(slots, vec![utc(2026, 1, 11, 0), utc(2026, 1, 12, 0)]);
    }
}
