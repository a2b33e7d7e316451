use std::fmt;

use chrono::NaiveDateTime;
use tokio::sync::mpsc;

use crate::{
    delivery::TransportError,
    reminder::{DISPLAY_FORMAT, ReminderId},
};

/// Identifies a pending delivery. Scheduling twice under the same key replaces
/// the earlier delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryKey {
    pub fire_at: NaiveDateTime,
    pub recipient: String,
}

impl fmt::Display for DeliveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}",
            self.fire_at.format(DISPLAY_FORMAT),
            self.recipient
        )
    }
}

#[derive(Debug)]
pub enum DeliveryEvent {
    Delivered {
        reminder_id: ReminderId,
        key: DeliveryKey,
    },
    Failed {
        reminder_id: ReminderId,
        key: DeliveryKey,
        error: TransportError,
    },
}

#[derive(Clone)]
pub struct DeliveryEventSender(mpsc::Sender<DeliveryEvent>);

impl DeliveryEventSender {
    pub fn new(inner: mpsc::Sender<DeliveryEvent>) -> Self {
        DeliveryEventSender(inner)
    }

    pub async fn notify_delivered(
        &self,
        reminder_id: ReminderId,
        key: DeliveryKey,
    ) -> anyhow::Result<()> {
        self.0
            .send(DeliveryEvent::Delivered { reminder_id, key })
            .await?;

        Ok(())
    }

    pub async fn notify_failed(
        &self,
        reminder_id: ReminderId,
        key: DeliveryKey,
        error: TransportError,
    ) -> anyhow::Result<()> {
        self.0
            .send(DeliveryEvent::Failed {
                reminder_id,
                key,
                error,
            })
            .await?;

        Ok(())
    }
}

pub fn delivery_events(capacity: usize) -> (DeliveryEventSender, mpsc::Receiver<DeliveryEvent>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (DeliveryEventSender::new(sender), receiver)
}
