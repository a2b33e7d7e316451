mod model;

use std::path::Path;

use async_trait::async_trait;
use model::{DB_DATE_FORMAT, ReminderStorageModel};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::reminder::{NewReminder, Reminder};

use super::{ReminderStorage, StorageError};

const CREATE_TABLE: &str = "
CREATE TABLE IF NOT EXISTS advToDo (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    date TEXT NOT NULL
)";

pub struct SqliteReminderStorage {
    pool: sqlx::SqlitePool,
}

impl SqliteReminderStorage {
    pub fn new(pool: sqlx::SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let storage = Self::new(pool);
        storage.create_table().await?;

        log::info!("Opened reminder database at {}", path.display());
        Ok(storage)
    }

    pub async fn create_table(&self) -> Result<(), StorageError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ReminderStorage for SqliteReminderStorage {
    async fn insert(&self, reminder: NewReminder) -> Result<Reminder, StorageError> {
        let NewReminder {
            description,
            details,
            fire_at,
        } = reminder;
        let date = fire_at.datetime().format(DB_DATE_FORMAT).to_string();

        let created_reminder = sqlx::query_as::<_, ReminderStorageModel>(
            "INSERT INTO advToDo (name, description, date)
VALUES (?, ?, ?) RETURNING id, name, description, date",
        )
        .bind(description)
        .bind(details)
        .bind(date)
        .fetch_one(&self.pool)
        .await?;

        log::debug!(
            "Inserted reminder row [reminder_id = {}]",
            created_reminder.id
        );
        created_reminder.try_into()
    }

    async fn get_all(&self) -> Result<Vec<Reminder>, StorageError> {
        let rows = sqlx::query_as::<_, ReminderStorageModel>(
            "SELECT id, name, description, date FROM advToDo ORDER BY date DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Reminder::try_from).collect()
    }
}

#[cfg(test)]
pub(crate) async fn in_memory_storage() -> SqliteReminderStorage {
    use std::str::FromStr;

    let options = SqliteConnectOptions::from_str("sqlite::memory:").unwrap();
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    let storage = SqliteReminderStorage::new(pool);
    storage.create_table().await.unwrap();
    storage
}
