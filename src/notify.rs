use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::model::{BookingCode, Contact, Event};

const CHANNEL_CAPACITY: usize = 1024;

/// Fan-out of committed events to in-process listeners.
pub struct NotifyHub {
    tx: broadcast::Sender<Event>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, event: &Event) {
        let _ = self.tx.send(event.clone());
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("{channel} delivery to {recipient} failed: {reason}")]
    Delivery {
        channel: &'static str,
        recipient: String,
        reason: String,
    },
}

/// Tells a guest their booking code. Delivery is best effort.
#[async_trait]
pub trait GuestNotifier: Send + Sync {
    async fn deliver(&self, contact: &Contact, code: &BookingCode) -> Result<(), NotifyError>;
}

/// Writes the notification to the log instead of sending it.
pub struct LogNotifier;

#[async_trait]
impl GuestNotifier for LogNotifier {
    async fn deliver(&self, contact: &Contact, code: &BookingCode) -> Result<(), NotifyError> {
        tracing::info!(
            channel = contact.channel(),
            recipient = contact.value(),
            %code,
            "booking code sent"
        );
        Ok(())
    }
}

/// Deliver a notification for every created reservation until the hub closes.
/// Failures are logged and counted; the reservation stands either way.
pub async fn run_dispatcher(mut rx: broadcast::Receiver<Event>, notifier: Arc<dyn GuestNotifier>) {
    loop {
        let reservation = match rx.recv().await {
            Ok(Event::ReservationCreated { reservation }) => reservation,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "notification dispatcher lagged, some guests were not notified");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let contact = &reservation.guest.contact;
        if let Err(e) = notifier.deliver(contact, &reservation.booking_code).await {
            metrics::counter!(crate::observability::NOTIFY_FAILURES_TOTAL, "channel" => contact.channel())
                .increment(1);
            tracing::warn!(reservation = %reservation.id, "guest notification failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::model::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe();

        let event = Event::ScheduleCleared {
            resource_id: "R1".into(),
            weekday: 2,
        };
        hub.send(&event);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&Event::ScheduleCleared {
            resource_id: "R1".into(),
            weekday: 2,
        });
    }

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl GuestNotifier for Recording {
        async fn deliver(&self, contact: &Contact, code: &BookingCode) -> Result<(), NotifyError> {
            self.sent
                .lock()
                .unwrap()
                .push((contact.value().to_string(), code.to_string()));
            if self.fail {
                return Err(NotifyError::Delivery {
                    channel: contact.channel(),
                    recipient: contact.value().to_string(),
                    reason: "gateway down".into(),
                });
            }
            Ok(())
        }
    }

    fn created(code: &str, contact: Contact) -> Event {
        Event::ReservationCreated {
            reservation: Reservation {
                id: ulid::Ulid::new(),
                resource_id: "R1".into(),
                date: "2024-06-01".into(),
                start: "14:00".parse().unwrap(),
                end: "15:00".parse().unwrap(),
                duration_minutes: 60,
                total_price: 20_000,
                status: ReservationStatus::Pending,
                guest: Guest {
                    first_name: "Awa".into(),
                    last_name: "Diop".into(),
                    contact,
                },
                booking_code: BookingCode::parse(code).unwrap(),
                booked_at: 0,
                payment_ref: None,
                history: Vec::new(),
            },
        }
    }

    #[tokio::test]
    async fn dispatcher_delivers_created_reservations_only() {
        let hub = NotifyHub::new();
        let notifier = Arc::new(Recording::default());
        let task = tokio::spawn(run_dispatcher(hub.subscribe(), notifier.clone()));

        hub.send(&Event::ScheduleCleared {
            resource_id: "R1".into(),
            weekday: 0,
        });
        hub.send(&created("AB12C3", Contact::Phone("771234567".into())));
        hub.send(&created("ZZ99ZZ", Contact::Email("a@b.co".into())));
        drop(hub);
        task.await.unwrap();

        let sent = notifier.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                ("771234567".to_string(), "AB12C3".to_string()),
                ("a@b.co".to_string(), "ZZ99ZZ".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn dispatcher_survives_delivery_failures() {
        let hub = NotifyHub::new();
        let notifier = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        let task = tokio::spawn(run_dispatcher(hub.subscribe(), notifier.clone()));

        hub.send(&created("AB12C3", Contact::Phone("771234567".into())));
        hub.send(&created("CD34E5", Contact::Phone("771234568".into())));
        drop(hub);
        task.await.unwrap();

        assert_eq!(notifier.sent.lock().unwrap().len(), 2);
    }
}
