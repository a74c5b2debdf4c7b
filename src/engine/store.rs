use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;
use crate::wal::WalHandle;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("slot already held by reservation {0}")]
    SlotTaken(Ulid),
    #[error("booking code {0} already issued")]
    CodeTaken(BookingCode),
    /// Compare-and-swap lost: the stored status is no longer the expected one.
    #[error("status changed concurrently, now {0}")]
    StatusMoved(ReservationStatus),
    #[error("reservation {0} not found")]
    NotFound(Ulid),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Wal(String),
}

/// Persistence seam for reservations.
///
/// `claim` is the only way a reservation enters the store and must be atomic per
/// (resource, date, start): of any number of concurrent claims for one slot, at most
/// one succeeds while the slot is held by a live reservation. It must likewise
/// refuse a booking code that is already issued.
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Start times held by live reservations on that day.
    async fn live_starts(&self, resource_id: &str, date: &str)
    -> Result<HashSet<TimeOfDay>, StoreError>;

    async fn claim(&self, reservation: Reservation) -> Result<(), StoreError>;

    /// Apply `change` only if the stored status still equals `change.from`.
    async fn update_status(
        &self,
        id: Ulid,
        change: StatusChange,
        payment_ref: Option<String>,
    ) -> Result<Reservation, StoreError>;

    async fn get(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;

    async fn find_by_code(&self, code: &BookingCode) -> Result<Option<Reservation>, StoreError>;

    async fn code_in_use(&self, code: &BookingCode) -> Result<bool, StoreError>;

    /// Every match, newest `booked_at` first. Paging is the caller's job.
    async fn query(&self, query: &ReservationQuery) -> Result<Vec<Reservation>, StoreError>;

    /// Events that rebuild the store's current contents, for journal compaction.
    /// Stores that persist elsewhere return nothing.
    async fn snapshot(&self) -> Vec<Event> {
        Vec::new()
    }
}

#[derive(Default)]
struct DayLedger {
    reservations: HashMap<Ulid, Reservation>,
    /// Start time -> live reservation holding it.
    live: HashMap<TimeOfDay, Ulid>,
}

impl DayLedger {
    fn insert(&mut self, reservation: Reservation) {
        if reservation.is_live() {
            self.live.insert(reservation.start, reservation.id);
        }
        self.reservations.insert(reservation.id, reservation);
    }

    fn apply_status(
        &mut self,
        id: Ulid,
        change: &StatusChange,
        payment_ref: Option<&String>,
    ) -> Option<Reservation> {
        let r = self.reservations.get_mut(&id)?;
        r.status = change.to;
        if let Some(p) = payment_ref {
            r.payment_ref = Some(p.clone());
        }
        r.history.push(change.clone());
        if !change.to.is_live() && self.live.get(&r.start) == Some(&id) {
            self.live.remove(&r.start);
        }
        Some(r.clone())
    }
}

/// Journal-backed store: one lock per (resource, date), held across the WAL append
/// so the slot check and the write are one step.
pub struct LedgerStore {
    days: DashMap<DayKey, Arc<RwLock<DayLedger>>>,
    by_id: DashMap<Ulid, DayKey>,
    by_code: DashMap<BookingCode, Ulid>,
    wal: WalHandle,
}

impl LedgerStore {
    pub fn new(wal: WalHandle) -> Self {
        Self::restore(wal, &[])
    }

    /// Rebuild from replayed events. Catalogue events are skipped.
    pub fn restore(wal: WalHandle, events: &[Event]) -> Self {
        let mut days: HashMap<DayKey, DayLedger> = HashMap::new();
        let mut by_id = HashMap::new();
        let mut by_code = HashMap::new();

        for event in events {
            match event {
                Event::ReservationCreated { reservation } => {
                    let key = reservation.day_key();
                    by_id.insert(reservation.id, key.clone());
                    by_code.insert(reservation.booking_code.clone(), reservation.id);
                    days.entry(key).or_default().insert(reservation.clone());
                }
                Event::StatusChanged {
                    id,
                    change,
                    payment_ref,
                    ..
                } => {
                    if let Some(key) = by_id.get(id)
                        && let Some(day) = days.get_mut(key)
                    {
                        day.apply_status(*id, change, payment_ref.as_ref());
                    }
                }
                _ => {}
            }
        }

        Self {
            days: days
                .into_iter()
                .map(|(k, d)| (k, Arc::new(RwLock::new(d))))
                .collect(),
            by_id: by_id.into_iter().collect(),
            by_code: by_code.into_iter().collect(),
            wal,
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn day(&self, key: &DayKey) -> Option<Arc<RwLock<DayLedger>>> {
        self.days.get(key).map(|d| d.value().clone())
    }

    fn day_or_create(&self, key: DayKey) -> Arc<RwLock<DayLedger>> {
        self.days.entry(key).or_default().value().clone()
    }

    fn day_of(&self, id: &Ulid) -> Option<Arc<RwLock<DayLedger>>> {
        let key = self.by_id.get(id).map(|k| k.value().clone())?;
        self.day(&key)
    }

    async fn wal_append(&self, event: &Event) -> Result<(), StoreError> {
        self.wal
            .append(event)
            .await
            .map_err(|e| StoreError::Wal(e.to_string()))
    }
}

#[async_trait]
impl BookingStore for LedgerStore {
    async fn live_starts(
        &self,
        resource_id: &str,
        date: &str,
    ) -> Result<HashSet<TimeOfDay>, StoreError> {
        let Some(day) = self.day(&DayKey::new(resource_id, date)) else {
            return Ok(HashSet::new());
        };
        let ledger = day.read().await;
        Ok(ledger.live.keys().copied().collect())
    }

    async fn claim(&self, reservation: Reservation) -> Result<(), StoreError> {
        let key = reservation.day_key();
        let day = self.day_or_create(key.clone());
        let mut ledger = day.write().await;

        if let Some(holder) = ledger.live.get(&reservation.start) {
            return Err(StoreError::SlotTaken(*holder));
        }
        let code = reservation.booking_code.clone();
        match self.by_code.entry(code.clone()) {
            Entry::Occupied(_) => return Err(StoreError::CodeTaken(code)),
            Entry::Vacant(v) => {
                v.insert(reservation.id);
            }
        }

        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        if let Err(e) = self.wal_append(&event).await {
            self.by_code.remove(&code);
            return Err(e);
        }
        self.by_id.insert(reservation.id, key);
        ledger.insert(reservation);
        Ok(())
    }

    async fn update_status(
        &self,
        id: Ulid,
        change: StatusChange,
        payment_ref: Option<String>,
    ) -> Result<Reservation, StoreError> {
        let day = self.day_of(&id).ok_or(StoreError::NotFound(id))?;
        let mut ledger = day.write().await;
        let (current, resource_id) = ledger
            .reservations
            .get(&id)
            .map(|r| (r.status, r.resource_id.clone()))
            .ok_or(StoreError::NotFound(id))?;
        if current != change.from {
            return Err(StoreError::StatusMoved(current));
        }

        let event = Event::StatusChanged {
            id,
            resource_id,
            change: change.clone(),
            payment_ref: payment_ref.clone(),
        };
        self.wal_append(&event).await?;
        ledger
            .apply_status(id, &change, payment_ref.as_ref())
            .ok_or(StoreError::NotFound(id))
    }

    async fn get(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        let Some(day) = self.day_of(&id) else {
            return Ok(None);
        };
        let ledger = day.read().await;
        Ok(ledger.reservations.get(&id).cloned())
    }

    async fn find_by_code(&self, code: &BookingCode) -> Result<Option<Reservation>, StoreError> {
        let Some(id) = self.by_code.get(code).map(|e| *e.value()) else {
            return Ok(None);
        };
        self.get(id).await
    }

    async fn code_in_use(&self, code: &BookingCode) -> Result<bool, StoreError> {
        Ok(self.by_code.contains_key(code))
    }

    async fn query(&self, query: &ReservationQuery) -> Result<Vec<Reservation>, StoreError> {
        let days: Vec<_> = self
            .days
            .iter()
            .filter(|e| {
                let key = e.key();
                query.resource_id.as_ref().is_none_or(|id| *id == key.resource_id)
                    && query.date.as_ref().is_none_or(|d| *d == key.date)
            })
            .map(|e| e.value().clone())
            .collect();

        let mut out = Vec::new();
        for day in days {
            let ledger = day.read().await;
            out.extend(
                ledger
                    .reservations
                    .values()
                    .filter(|r| query.matches(r))
                    .cloned(),
            );
        }
        out.sort_by(|a, b| b.booked_at.cmp(&a.booked_at).then(b.id.cmp(&a.id)));
        Ok(out)
    }

    async fn snapshot(&self) -> Vec<Event> {
        let days: Vec<_> = self.days.iter().map(|e| e.value().clone()).collect();
        let mut reservations = Vec::with_capacity(self.by_id.len());
        for day in days {
            let ledger = day.read().await;
            reservations.extend(ledger.reservations.values().cloned());
        }
        reservations.sort_by(|a, b| a.booked_at.cmp(&b.booked_at).then(a.id.cmp(&b.id)));
        reservations
            .into_iter()
            .map(|reservation| Event::ReservationCreated { reservation })
            .collect()
    }
}
