use chrono::NaiveDateTime;

use crate::reminder::{Reminder, ReminderFireTime, ReminderState};
use crate::storage::StorageError;

pub const DB_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(sqlx::FromRow)]
pub struct ReminderStorageModel {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub date: String,
}

impl TryFrom<ReminderStorageModel> for Reminder {
    type Error = StorageError;

    fn try_from(value: ReminderStorageModel) -> Result<Self, Self::Error> {
        let parsed = NaiveDateTime::parse_from_str(&value.date, DB_DATE_FORMAT);
        let fire_at = parsed.map_err(|source| StorageError::InvalidDate {
            id: value.id,
            value: value.date.clone(),
            source,
        })?;

        Ok(Self {
            id: value.id,
            description: value.name,
            details: value.description.filter(|details| !details.is_empty()),
            fire_at: ReminderFireTime::new(fire_at),
            notified: false,
            state: ReminderState::Created,
        })
    }
}
