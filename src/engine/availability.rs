use std::collections::HashSet;

use crate::model::*;

use super::slots::generate_slots;
use super::{Engine, EngineError};

/// Mark each slot taken when a live reservation starts at the same clock time.
pub fn annotate(slots: Vec<CandidateSlot>, taken: &HashSet<TimeOfDay>) -> Vec<SlotAvailability> {
    slots
        .into_iter()
        .map(|slot| SlotAvailability {
            available: !taken.contains(&slot.start_time()),
            slot,
        })
        .collect()
}

/// Storage key and weekday of a caller-supplied date.
pub(super) fn parse_date(date: &str) -> Result<(String, u8), EngineError> {
    let day = parse_iso_date(date)
        .ok_or_else(|| EngineError::Validation(format!("invalid date {date:?}, expected YYYY-MM-DD")))?;
    Ok((date_key(day), weekday_of(day)))
}

impl Engine {
    /// Bookable slots of one resource on one date, each flagged free or taken.
    ///
    /// A day without a schedule is closed and yields no slots. The answer is a
    /// snapshot: a free slot may be gone by the time it is booked.
    pub async fn get_availability(
        &self,
        resource_id: &str,
        date: &str,
    ) -> Result<Vec<SlotAvailability>, EngineError> {
        let resource_id = resource_id.trim();
        let (date, weekday) = parse_date(date)?;
        let (info, schedule) = self
            .directory
            .day(resource_id, weekday)
            .ok_or_else(|| EngineError::NotFound(format!("resource {resource_id}")))?;
        let Some(schedule) = schedule else {
            tracing::debug!(resource_id, %date, "closed on this weekday");
            return Ok(Vec::new());
        };

        let slots = generate_slots(&schedule, info.slot_minutes)?;
        let store = &self.store;
        let date = date.as_str();
        let taken = self
            .read_store("live_starts", move || store.live_starts(resource_id, date))
            .await?;
        Ok(annotate(slots, &taken))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotate_marks_taken_starts() {
        let slots = vec![
            CandidateSlot { start: 1320, end: 1380, price_multiplier: 1.0 },
            CandidateSlot { start: 1380, end: 1440, price_multiplier: 1.0 },
            CandidateSlot { start: 1440, end: 1500, price_multiplier: 1.5 },
        ];
        let taken: HashSet<TimeOfDay> = ["23:00", "00:00"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();

        let flags: Vec<bool> = annotate(slots, &taken).iter().map(|a| a.available).collect();
        assert_eq!(flags, vec![true, false, false]);
    }

    #[test]
    fn parse_date_rejects_bad_input() {
        assert_eq!(parse_date("2024-06-01").unwrap(), ("2024-06-01".to_string(), 6));
        assert_eq!(parse_date("2024-6-1").unwrap(), ("2024-06-01".to_string(), 6));
        assert!(matches!(parse_date("2024-13-01"), Err(EngineError::Validation(_))));
        assert!(matches!(parse_date(""), Err(EngineError::Validation(_))));
    }
}
