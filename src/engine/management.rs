use crate::directory::Directory;
use crate::limits::*;
use crate::model::*;

use super::slots::{validate_duration, validate_multiplier};
use super::{Engine, EngineError};

fn check_weekday(weekday: u8) -> Result<(), EngineError> {
    if weekday > 6 {
        return Err(EngineError::Validation(format!(
            "weekday must be 0 (Sunday) to 6, got {weekday}"
        )));
    }
    Ok(())
}

fn require_resource(directory: &Directory, id: &str) -> Result<(), EngineError> {
    if directory.contains(id) {
        Ok(())
    } else {
        Err(EngineError::NotFound(format!("resource {id}")))
    }
}

impl Engine {
    /// Create or update a resource. Existing schedules are kept.
    pub async fn register_resource(
        &self,
        id: String,
        name: Option<String>,
        hourly_price: Price,
        slot_minutes: Option<u32>,
    ) -> Result<ResourceInfo, EngineError> {
        let id = id.trim().to_string();
        if id.is_empty() {
            return Err(EngineError::validation("resource id must not be empty"));
        }
        if id.len() > MAX_RESOURCE_ID_LEN {
            return Err(EngineError::LimitExceeded("resource id too long"));
        }
        if name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
        if hourly_price < 0 {
            return Err(EngineError::validation("hourly price must not be negative"));
        }
        let slot_minutes = slot_minutes.unwrap_or(DEFAULT_SLOT_MINUTES);
        validate_duration(slot_minutes)?;

        let info = ResourceInfo {
            id,
            name,
            hourly_price,
            slot_minutes,
        };
        let event = Event::ResourceRegistered {
            id: info.id.clone(),
            name: info.name.clone(),
            hourly_price,
            slot_minutes,
        };
        let id = info.id.clone();
        self.commit_catalogue(move |directory| {
            if !directory.contains(&id) && directory.len() >= MAX_RESOURCES_PER_TENANT {
                return Err(EngineError::LimitExceeded("too many resources"));
            }
            Ok(event)
        })
        .await?;
        tracing::info!(id = %info.id, hourly_price, slot_minutes, "resource registered");
        Ok(info)
    }

    /// Open the resource on `weekday` from `opening` to `closing`, replacing that
    /// day's schedule and its price ranges.
    pub async fn set_schedule(
        &self,
        resource_id: String,
        weekday: u8,
        opening: TimeOfDay,
        closing: TimeOfDay,
    ) -> Result<(), EngineError> {
        check_weekday(weekday)?;
        let resource_id = resource_id.trim().to_string();
        self.commit_catalogue(move |directory| {
            require_resource(directory, &resource_id)?;
            Ok(Event::ScheduleSet {
                resource_id,
                weekday,
                opening,
                closing,
            })
        })
        .await?;
        Ok(())
    }

    /// Append a price range to an open day. Earlier ranges take precedence.
    pub async fn add_price_range(
        &self,
        resource_id: String,
        weekday: u8,
        range: PriceRange,
    ) -> Result<(), EngineError> {
        check_weekday(weekday)?;
        let resource_id = resource_id.trim().to_string();
        validate_multiplier(range.multiplier)?;
        self.commit_catalogue(move |directory| {
            let (_, schedule) = directory
                .day(&resource_id, weekday)
                .ok_or_else(|| EngineError::NotFound(format!("resource {resource_id}")))?;
            let schedule = schedule.ok_or_else(|| {
                EngineError::InvalidSchedule(format!(
                    "{resource_id} has no schedule on weekday {weekday}"
                ))
            })?;
            if schedule.price_ranges.len() >= MAX_PRICE_RANGES_PER_DAY {
                return Err(EngineError::LimitExceeded("too many price ranges on one day"));
            }
            Ok(Event::PriceRangeAdded {
                resource_id,
                weekday,
                range,
            })
        })
        .await?;
        Ok(())
    }

    /// Close the resource on `weekday`.
    pub async fn clear_schedule(&self, resource_id: String, weekday: u8) -> Result<(), EngineError> {
        check_weekday(weekday)?;
        let resource_id = resource_id.trim().to_string();
        self.commit_catalogue(move |directory| {
            require_resource(directory, &resource_id)?;
            Ok(Event::ScheduleCleared {
                resource_id,
                weekday,
            })
        })
        .await?;
        Ok(())
    }

    /// Under the catalogue write lock: build the event from current state, journal it, apply it.
    async fn commit_catalogue<F>(&self, build: F) -> Result<Event, EngineError>
    where
        F: FnOnce(&Directory) -> Result<Event, EngineError> + Send + 'static,
    {
        let directory = self.directory.clone();
        let wal = self.wal.clone();
        let event = self
            .detached(async move {
                let _writes = directory.lock_writes().await;
                let event = build(&directory)?;
                wal.append(&event)
                    .await
                    .map_err(|e| EngineError::WalError(e.to_string()))?;
                directory.apply(&event);
                Ok::<_, EngineError>(event)
            })
            .await??;
        self.notify.send(&event);
        Ok(event)
    }
}
