//! Resource catalogue: pricing, slot length and the weekly schedule of each resource.

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};

use crate::model::{Event, ResourceInfo, WeeklySchedule};

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceEntry {
    pub info: ResourceInfo,
    /// Indexed by weekday, 0 = Sunday. `None` means closed.
    pub week: [Option<WeeklySchedule>; 7],
}

impl ResourceEntry {
    fn new(info: ResourceInfo) -> Self {
        Self {
            info,
            week: Default::default(),
        }
    }
}

/// Catalogue writes are rare, so they share one lock; reads never take it.
pub struct Directory {
    resources: DashMap<String, ResourceEntry>,
    writes: Mutex<()>,
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            writes: Mutex::new(()),
        }
    }

    /// Serialize catalogue writers so journal order equals apply order.
    pub async fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.writes.lock().await
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.resources.contains_key(id)
    }

    pub fn resource(&self, id: &str) -> Option<ResourceInfo> {
        self.resources.get(id).map(|e| e.info.clone())
    }

    /// Resource info plus the schedule for `weekday`; `None` if the resource is unknown.
    pub fn day(&self, id: &str, weekday: u8) -> Option<(ResourceInfo, Option<WeeklySchedule>)> {
        let entry = self.resources.get(id)?;
        let schedule = entry.week.get(usize::from(weekday)).cloned().flatten();
        Some((entry.info.clone(), schedule))
    }

    pub fn entry(&self, id: &str) -> Option<ResourceEntry> {
        self.resources.get(id).map(|e| e.clone())
    }

    /// Apply a catalogue event. Reservation events are ignored.
    pub fn apply(&self, event: &Event) {
        match event {
            Event::ResourceRegistered {
                id,
                name,
                hourly_price,
                slot_minutes,
            } => {
                let info = ResourceInfo {
                    id: id.clone(),
                    name: name.clone(),
                    hourly_price: *hourly_price,
                    slot_minutes: *slot_minutes,
                };
                self.resources
                    .entry(id.clone())
                    .and_modify(|e| e.info = info.clone())
                    .or_insert_with(|| ResourceEntry::new(info));
            }
            Event::ScheduleSet {
                resource_id,
                weekday,
                opening,
                closing,
            } => {
                if let Some(mut e) = self.resources.get_mut(resource_id)
                    && let Some(day) = e.week.get_mut(usize::from(*weekday))
                {
                    *day = Some(WeeklySchedule::new(*opening, *closing));
                }
            }
            Event::PriceRangeAdded {
                resource_id,
                weekday,
                range,
            } => {
                if let Some(mut e) = self.resources.get_mut(resource_id)
                    && let Some(Some(day)) = e.week.get_mut(usize::from(*weekday))
                {
                    day.price_ranges.push(range.clone());
                }
            }
            Event::ScheduleCleared {
                resource_id,
                weekday,
            } => {
                if let Some(mut e) = self.resources.get_mut(resource_id)
                    && let Some(day) = e.week.get_mut(usize::from(*weekday))
                {
                    *day = None;
                }
            }
            Event::ReservationCreated { .. } | Event::StatusChanged { .. } => {}
        }
    }

    /// Minimal event sequence that rebuilds the catalogue, ordered by resource id.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut entries: Vec<ResourceEntry> =
            self.resources.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.info.id.cmp(&b.info.id));

        let mut events = Vec::new();
        for entry in entries {
            let id = entry.info.id;
            events.push(Event::ResourceRegistered {
                id: id.clone(),
                name: entry.info.name,
                hourly_price: entry.info.hourly_price,
                slot_minutes: entry.info.slot_minutes,
            });
            for (weekday, day) in entry.week.into_iter().enumerate() {
                let Some(day) = day else { continue };
                let weekday = weekday as u8;
                events.push(Event::ScheduleSet {
                    resource_id: id.clone(),
                    weekday,
                    opening: day.opening,
                    closing: day.closing,
                });
                events.extend(day.price_ranges.into_iter().map(|range| Event::PriceRangeAdded {
                    resource_id: id.clone(),
                    weekday,
                    range,
                }));
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PriceRange, TimeOfDay};

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn register(dir: &Directory, id: &str, price: i64) {
        dir.apply(&Event::ResourceRegistered {
            id: id.into(),
            name: None,
            hourly_price: price,
            slot_minutes: 60,
        });
    }

    #[test]
    fn schedule_set_replaces_ranges() {
        let dir = Directory::new();
        register(&dir, "R1", 20_000);
        dir.apply(&Event::ScheduleSet {
            resource_id: "R1".into(),
            weekday: 6,
            opening: t("08:00"),
            closing: t("22:00"),
        });
        dir.apply(&Event::PriceRangeAdded {
            resource_id: "R1".into(),
            weekday: 6,
            range: PriceRange {
                start: t("18:00"),
                end: t("22:00"),
                multiplier: 1.5,
            },
        });
        let (_, day) = dir.day("R1", 6).unwrap();
        assert_eq!(day.unwrap().price_ranges.len(), 1);

        dir.apply(&Event::ScheduleSet {
            resource_id: "R1".into(),
            weekday: 6,
            opening: t("10:00"),
            closing: t("20:00"),
        });
        let (_, day) = dir.day("R1", 6).unwrap();
        let day = day.unwrap();
        assert_eq!(day.opening, t("10:00"));
        assert!(day.price_ranges.is_empty());
    }

    #[test]
    fn reregistering_keeps_schedule() {
        let dir = Directory::new();
        register(&dir, "R1", 20_000);
        dir.apply(&Event::ScheduleSet {
            resource_id: "R1".into(),
            weekday: 1,
            opening: t("08:00"),
            closing: t("12:00"),
        });
        register(&dir, "R1", 30_000);

        let (info, day) = dir.day("R1", 1).unwrap();
        assert_eq!(info.hourly_price, 30_000);
        assert!(day.is_some());
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn events_for_unknown_resources_are_ignored() {
        let dir = Directory::new();
        dir.apply(&Event::ScheduleSet {
            resource_id: "ghost".into(),
            weekday: 0,
            opening: t("08:00"),
            closing: t("12:00"),
        });
        assert!(dir.is_empty());
        assert!(dir.day("ghost", 0).is_none());
    }

    #[test]
    fn snapshot_rebuilds_same_catalogue() {
        let dir = Directory::new();
        register(&dir, "B", 10_000);
        register(&dir, "A", 20_000);
        for (wd, open) in [(0u8, "09:00"), (5, "18:00")] {
            dir.apply(&Event::ScheduleSet {
                resource_id: "A".into(),
                weekday: wd,
                opening: t(open),
                closing: t("02:00"),
            });
        }
        for m in [1.5, 2.0] {
            dir.apply(&Event::PriceRangeAdded {
                resource_id: "A".into(),
                weekday: 5,
                range: PriceRange {
                    start: t("22:00"),
                    end: t("02:00"),
                    multiplier: m,
                },
            });
        }
        dir.apply(&Event::ScheduleCleared {
            resource_id: "A".into(),
            weekday: 0,
        });

        let rebuilt = Directory::new();
        for e in dir.snapshot() {
            rebuilt.apply(&e);
        }
        assert_eq!(rebuilt.entry("A"), dir.entry("A"));
        assert_eq!(rebuilt.entry("B"), dir.entry("B"));
        // Range order survives.
        let (_, day) = rebuilt.day("A", 5).unwrap();
        let mults: Vec<f64> = day.unwrap().price_ranges.iter().map(|r| r.multiplier).collect();
        assert_eq!(mults, vec![1.5, 2.0]);
    }
}
