mod reminder_storage;
pub mod sqlite;

pub use reminder_storage::{InMemoryReminderStorage, ReminderStorage, StorageError};
