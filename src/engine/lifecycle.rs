use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::store::StoreError;
use super::{Engine, EngineError};

use crate::model::ReservationStatus::*;

/// Statuses reachable from `from` in one step. Terminal statuses have none.
pub fn allowed_targets(from: ReservationStatus) -> &'static [ReservationStatus] {
    match from {
        Pending => &[Confirmed, Cancelled],
        Confirmed => &[Paid, Cancelled],
        Paid => &[Completed],
        Completed | Cancelled => &[],
    }
}

pub fn check_transition(from: ReservationStatus, to: ReservationStatus) -> Result<(), EngineError> {
    if allowed_targets(from).contains(&to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition { from, to })
    }
}

/// Decides whether an actor may apply a structurally legal transition.
pub trait TransitionPolicy: Send + Sync {
    fn authorize(
        &self,
        actor: &Actor,
        reservation: &Reservation,
        to: ReservationStatus,
    ) -> Result<(), EngineError>;
}

/// Staff may apply any legal transition; guests may only cancel.
pub struct RolePolicy;

impl TransitionPolicy for RolePolicy {
    fn authorize(
        &self,
        actor: &Actor,
        _reservation: &Reservation,
        to: ReservationStatus,
    ) -> Result<(), EngineError> {
        if actor.role.is_staff() || to == Cancelled {
            Ok(())
        } else {
            Err(EngineError::Forbidden {
                role: actor.role,
                to,
            })
        }
    }
}

impl Engine {
    /// Move a reservation to `to` on behalf of `actor`.
    ///
    /// The write is a compare-and-swap on the status that was checked; if another
    /// writer got there first the transition is re-checked against the new status.
    /// Cancelling frees the slot.
    pub async fn transition_status(
        &self,
        id: Ulid,
        to: ReservationStatus,
        actor: Actor,
        payment_ref: Option<String>,
    ) -> Result<Reservation, EngineError> {
        let actor_id_len = actor.id.trim().len();
        if actor_id_len == 0 || actor_id_len > MAX_ACTOR_ID_LEN {
            return Err(EngineError::validation("actor id must be 1-128 characters"));
        }
        let payment_ref = payment_ref
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        if let Some(p) = &payment_ref {
            if to != Paid {
                return Err(EngineError::validation("a payment reference is only accepted when marking paid"));
            }
            if p.len() > MAX_PAYMENT_REF_LEN {
                return Err(EngineError::LimitExceeded("payment reference too long"));
            }
        }

        let store = &self.store;
        let mut current = self
            .read_store("get", move || store.get(id))
            .await?
            .ok_or_else(|| EngineError::reservation_not_found(id))?;

        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            check_transition(current.status, to)?;
            self.policy.authorize(&actor, &current, to)?;

            let change = StatusChange {
                from: current.status,
                to,
                actor: actor.clone(),
                at: now_ms(),
            };
            let store = self.store.clone();
            let payment = payment_ref.clone();
            match self
                .detached(async move { store.update_status(id, change, payment).await })
                .await?
            {
                Ok(updated) => {
                    metrics::counter!(crate::observability::STATUS_TRANSITIONS_TOTAL, "to" => to.as_str())
                        .increment(1);
                    tracing::info!(%id, from = %current.status, %to, actor = %actor, "reservation status changed");
                    if let Some(change) = updated.history.last() {
                        self.notify.send(&Event::StatusChanged {
                            id,
                            resource_id: updated.resource_id.clone(),
                            change: change.clone(),
                            payment_ref: payment_ref.clone(),
                        });
                    }
                    return Ok(updated);
                }
                Err(StoreError::StatusMoved(now)) => {
                    tracing::debug!(%id, expected = %current.status, %now, "status moved underneath, re-checking");
                    current.status = now;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::Internal(format!(
            "reservation {id} kept changing, gave up after {MAX_TRANSITION_ATTEMPTS} attempts"
        )))
    }
}
