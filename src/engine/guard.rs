use ulid::Ulid;
use validator::Validate;

use crate::limits::*;
use crate::model::*;

use super::availability::parse_date;
use super::slots::{generate_slots, slot_price};
use super::store::StoreError;
use super::{Engine, EngineError};

/// Guest details as submitted. Exactly one of `phone` and `email` must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Validate)]
pub struct GuestDetails {
    #[validate(length(min = 1, max = 128, message = "first name must be 1-128 characters"))]
    pub first_name: String,
    #[validate(length(min = 1, max = 128, message = "last name must be 1-128 characters"))]
    pub last_name: String,
    #[validate(length(max = 254))]
    pub phone: Option<String>,
    #[validate(email(message = "malformed email address"), length(max = 254))]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub resource_id: String,
    pub date: String,
    pub start: TimeOfDay,
    pub guest: GuestDetails,
    /// Price the guest was shown. Refused if it no longer matches.
    pub expected_price: Option<Price>,
}

/// Trim, drop blank contacts, then check shape.
pub fn validate_guest(details: GuestDetails) -> Result<Guest, EngineError> {
    let blank_to_none = |v: Option<String>| {
        v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
    };
    let details = GuestDetails {
        first_name: details.first_name.trim().to_string(),
        last_name: details.last_name.trim().to_string(),
        phone: blank_to_none(details.phone),
        email: blank_to_none(details.email),
    };
    details
        .validate()
        .map_err(|e| EngineError::Validation(e.to_string()))?;

    let contact = match (details.phone, details.email) {
        (Some(phone), None) => {
            validate_phone(&phone)?;
            Contact::Phone(phone)
        }
        (None, Some(email)) => Contact::Email(email),
        (Some(_), Some(_)) => {
            return Err(EngineError::validation("give either a phone number or an email, not both"));
        }
        (None, None) => return Err(EngineError::validation("a phone number or an email is required")),
    };

    Ok(Guest {
        first_name: details.first_name,
        last_name: details.last_name,
        contact,
    })
}

/// Digits with the usual separators; an optional leading `+`.
fn validate_phone(phone: &str) -> Result<(), EngineError> {
    let body = phone.strip_prefix('+').unwrap_or(phone);
    let well_formed = body
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, ' ' | '-' | '.' | '(' | ')'));
    let digits = body.chars().filter(char::is_ascii_digit).count();
    if !well_formed || !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits) {
        return Err(EngineError::Validation(format!("malformed phone number {phone:?}")));
    }
    Ok(())
}

impl Engine {
    /// Book one slot. The reservation starts `pending` with a fresh booking code.
    ///
    /// The slot check and the write happen atomically in the store, so of several
    /// concurrent bookings for the same start exactly one wins and the rest get
    /// [`EngineError::Conflict`].
    pub async fn create_reservation(&self, req: BookingRequest) -> Result<Reservation, EngineError> {
        let guest = validate_guest(req.guest)?;
        let resource_id = req.resource_id.trim().to_string();
        let (date, weekday) = parse_date(&req.date)?;
        let (info, schedule) = self
            .directory
            .day(&resource_id, weekday)
            .ok_or_else(|| EngineError::NotFound(format!("resource {resource_id}")))?;
        let schedule = schedule.ok_or_else(|| {
            EngineError::Validation(format!("{resource_id} is closed on {date}"))
        })?;
        let slot = generate_slots(&schedule, info.slot_minutes)?
            .into_iter()
            .find(|s| s.start_time() == req.start)
            .ok_or_else(|| {
                EngineError::Validation(format!("{} is not a bookable start time", req.start))
            })?;

        let total_price = slot_price(info.hourly_price, slot.duration(), slot.price_multiplier);
        if let Some(expected) = req.expected_price
            && expected != total_price
        {
            return Err(EngineError::Validation(format!(
                "price changed: expected {expected}, slot costs {total_price}"
            )));
        }

        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let booking_code = BookingCode::generate(&mut rand::rng());
            let store = &self.store;
            let code = &booking_code;
            if self
                .read_store("code_in_use", move || store.code_in_use(code))
                .await?
            {
                self.code_collision(attempt, &booking_code);
                continue;
            }

            let reservation = Reservation {
                id: Ulid::new(),
                resource_id: resource_id.clone(),
                date: date.clone(),
                start: slot.start_time(),
                end: slot.end_time(),
                duration_minutes: slot.duration(),
                total_price,
                status: ReservationStatus::Pending,
                guest: guest.clone(),
                booking_code,
                booked_at: now_ms(),
                payment_ref: None,
                history: Vec::new(),
            };

            let store = self.store.clone();
            let claimed = reservation.clone();
            match self.detached(async move { store.claim(claimed).await }).await? {
                Ok(()) => {
                    metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL).increment(1);
                    tracing::info!(
                        id = %reservation.id,
                        code = %reservation.booking_code,
                        resource_id = %reservation.resource_id,
                        date = %reservation.date,
                        start = %reservation.start,
                        "reservation created"
                    );
                    self.notify.send(&Event::ReservationCreated {
                        reservation: reservation.clone(),
                    });
                    return Ok(reservation);
                }
                Err(StoreError::CodeTaken(code)) => self.code_collision(attempt, &code),
                Err(StoreError::SlotTaken(holder)) => {
                    metrics::counter!(crate::observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
                    tracing::debug!(%holder, %resource_id, %date, start = %req.start, "slot already taken");
                    return Err(EngineError::Conflict {
                        resource_id,
                        date,
                        start: req.start,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::error!(
            attempts = MAX_CODE_ATTEMPTS,
            %resource_id,
            "booking code space exhausted"
        );
        Err(EngineError::CodeExhaustion(MAX_CODE_ATTEMPTS))
    }

    fn code_collision(&self, attempt: u32, code: &BookingCode) {
        metrics::counter!(crate::observability::BOOKING_CODE_COLLISIONS_TOTAL).increment(1);
        tracing::debug!(attempt, %code, "booking code collision, drawing another");
    }
}
