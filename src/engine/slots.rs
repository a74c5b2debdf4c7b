use crate::model::*;

use super::EngineError;

/// Cut a day's opening window into back-to-back slots of `duration` minutes.
///
/// The window runs from opening to closing, where a closing at or before the
/// opening belongs to the next day. A trailing remainder shorter than `duration`
/// is not offered.
pub fn generate_slots(
    schedule: &WeeklySchedule,
    duration: u32,
) -> Result<Vec<CandidateSlot>, EngineError> {
    validate_schedule(schedule, duration)?;

    let window = schedule.window();
    let mut slots = Vec::with_capacity((window.len() / duration) as usize);
    let mut start = window.start;
    while start + duration <= window.end {
        slots.push(CandidateSlot {
            start,
            end: start + duration,
            price_multiplier: price_multiplier(
                &schedule.price_ranges,
                TimeOfDay::wrapping(start),
            ),
        });
        start += duration;
    }
    Ok(slots)
}

/// First range covering `at`, in declaration order; 1.0 when none does.
pub fn price_multiplier(ranges: &[PriceRange], at: TimeOfDay) -> f64 {
    ranges
        .iter()
        .find(|r| r.window().covers(at))
        .map_or(1.0, |r| r.multiplier)
}

/// `hourly_price × minutes / 60 × multiplier`, rounded to whole units.
pub fn slot_price(hourly_price: Price, minutes: u32, multiplier: f64) -> Price {
    (hourly_price as f64 * f64::from(minutes) / 60.0 * multiplier).round() as Price
}

pub fn validate_multiplier(multiplier: f64) -> Result<(), EngineError> {
    if multiplier.is_finite() && multiplier > 0.0 {
        Ok(())
    } else {
        Err(EngineError::InvalidSchedule(format!(
            "price multiplier must be positive and finite, got {multiplier}"
        )))
    }
}

pub fn validate_duration(duration: u32) -> Result<(), EngineError> {
    if duration == 0 || duration > MINUTES_PER_DAY {
        return Err(EngineError::InvalidSchedule(format!(
            "slot duration must be 1..={MINUTES_PER_DAY} minutes, got {duration}"
        )));
    }
    Ok(())
}

fn validate_schedule(schedule: &WeeklySchedule, duration: u32) -> Result<(), EngineError> {
    validate_duration(duration)?;
    schedule
        .price_ranges
        .iter()
        .try_for_each(|r| validate_multiplier(r.multiplier))
}
