use chrono::{DateTime, Duration, FixedOffset, Utc};
use tracing::error;

use crate::config::ScheduleSection;

/// Fixed daily broadcast grid: a handful of anchor hours in one fixed-offset
/// zone, each slot nominally `slot_minutes` long.
#[derive(Debug, Clone)]
pub struct BroadcastSchedule {
    offset: FixedOffset,
    anchor_hours: Vec<u32>,
    slot_minutes: i64,
}

impl BroadcastSchedule {
    pub fn new(utc_offset_hours: i32, mut anchor_hours: Vec<u32>, slot_minutes: i64) -> Self {
        anchor_hours.sort_unstable();
        anchor_hours.dedup();
        let offset = FixedOffset::east_opt(utc_offset_hours * 3600)
            .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
        Self {
            offset,
            anchor_hours,
            slot_minutes,
        }
    }

    pub fn from_config(section: &ScheduleSection) -> Self {
        Self::new(
            section.utc_offset_hours,
            section.anchor_hours.clone(),
            section.slot_minutes,
        )
    }

    pub fn slot_minutes(&self) -> i64 {
        self.slot_minutes
    }

    /// Smallest anchor at or after the reference instant, converted to UTC.
    ///
    /// Two days of candidates is always enough with at least one anchor per
    /// day; the fallback below exists only to keep a platform bug from
    /// turning into a panic.
    pub fn next_slot_start(&self, reference: DateTime<Utc>) -> DateTime<Utc> {
        let local = reference.with_timezone(&self.offset);
        let date = local.date_naive();
        for day in 0..2 {
            for &hour in &self.anchor_hours {
                let candidate = (date + Duration::days(day))
                    .and_hms_opt(hour, 0, 0)
                    .and_then(|naive| naive.and_local_timezone(self.offset).single());
                if let Some(candidate) = candidate {
                    if candidate >= local {
                        return candidate.with_timezone(&Utc);
                    }
                }
            }
        }
        error!("no slot anchor found within the 48-hour lookahead");
        let fallback_hour = self.anchor_hours.first().copied().unwrap_or(0);
        (date + Duration::days(1))
            .and_hms_opt(fallback_hour, 0, 0)
            .and_then(|naive| naive.and_local_timezone(self.offset).single())
            .map(|fallback| fallback.with_timezone(&Utc))
            .unwrap_or(reference)
    }

    /// First anchor strictly after the given instant. Used to find the end of
    /// the schedule window an instant falls into.
    pub fn following_slot_start(&self, reference: DateTime<Utc>) -> DateTime<Utc> {
        self.next_slot_start(reference + Duration::seconds(1))
    }
}
