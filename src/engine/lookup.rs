use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::parse_date;
use super::{Engine, EngineError};

impl Engine {
    /// Guest-facing lookup by booking code.
    ///
    /// The code is matched case-insensitively. When `contact` is non-empty it must
    /// appear (case-insensitively) in the guest's phone or email, otherwise the
    /// reservation is withheld with [`EngineError::ContactMismatch`].
    pub async fn find_reservation(
        &self,
        code: &str,
        contact: Option<&str>,
    ) -> Result<Reservation, EngineError> {
        let not_found = || EngineError::NotFound(format!("booking code {}", code.trim()));
        let code = BookingCode::parse(code).ok_or_else(not_found)?;

        let store = &self.store;
        let lookup = &code;
        let reservation = self
            .read_store("find_by_code", move || store.find_by_code(lookup))
            .await?
            .ok_or_else(not_found)?;

        match contact.map(str::trim).filter(|c| !c.is_empty()) {
            Some(needle) if !reservation.guest.contact.matches(needle) => {
                tracing::debug!(%code, "contact check failed");
                Err(EngineError::ContactMismatch(code))
            }
            _ => Ok(reservation),
        }
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let store = &self.store;
        self.read_store("get", move || store.get(id))
            .await?
            .ok_or_else(|| EngineError::reservation_not_found(id))
    }

    /// Staff listing, newest first, one page at a time.
    pub async fn list_reservations(
        &self,
        mut query: ReservationQuery,
    ) -> Result<ReservationPage, EngineError> {
        if query
            .search
            .as_ref()
            .is_some_and(|s| s.len() > MAX_SEARCH_LEN)
        {
            return Err(EngineError::LimitExceeded("search term too long"));
        }
        let page = query.page.max(1);
        let page_size = match query.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        query.page = page;
        query.page_size = page_size;
        query.resource_id = query.resource_id.map(|id| id.trim().to_string());
        if let Some(date) = query.date.take() {
            query.date = Some(parse_date(&date)?.0);
        }

        let store = &self.store;
        let filter = &query;
        let matches = self
            .read_store("query", move || store.query(filter))
            .await?;
        let total = matches.len();
        let reservations = matches
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .collect();

        Ok(ReservationPage {
            reservations,
            total,
            page,
            page_size,
        })
    }
}
