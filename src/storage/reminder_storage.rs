use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::reminder::{NewReminder, Reminder, ReminderId};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("Stored row {id} has an invalid date {value:?}")]
    InvalidDate {
        id: ReminderId,
        value: String,
        #[source]
        source: chrono::ParseError,
    },
}

#[async_trait]
pub trait ReminderStorage: Send + Sync {
    async fn insert(&self, reminder: NewReminder) -> Result<Reminder, StorageError>;

    /// All stored reminders, latest fire time first.
    async fn get_all(&self) -> Result<Vec<Reminder>, StorageError>;
}

pub struct InMemoryReminderStorage {
    store: RwLock<(ReminderId, Vec<Reminder>)>,
}

impl InMemoryReminderStorage {
    pub fn new() -> Self {
        InMemoryReminderStorage {
            store: RwLock::new((0, Vec::new())),
        }
    }
}

impl Default for InMemoryReminderStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReminderStorage for InMemoryReminderStorage {
    async fn insert(&self, reminder: NewReminder) -> Result<Reminder, StorageError> {
        let mut store = self.store.write().await;
        store.0 += 1;
        let reminder = Reminder::from_new(store.0, reminder);
        store.1.push(reminder.clone());

        log::debug!("Stored reminder in memory [reminder_id = {}]", reminder.id);
        Ok(reminder)
    }

    async fn get_all(&self) -> Result<Vec<Reminder>, StorageError> {
        let store = self.store.read().await;
        let mut reminders = store.1.clone();
        reminders.sort_by(|a, b| b.fire_at.cmp(&a.fire_at).then(b.id.cmp(&a.id)));
        Ok(reminders)
    }
}
