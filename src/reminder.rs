use chrono::{NaiveDateTime, Timelike};
use thiserror::Error;

pub type ReminderId = i64;

pub const DISPLAY_FORMAT: &str = "%d.%m.%Y %H:%M";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReminderState {
    Created,
    Scheduled,
    Delivered,
    Failed,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Enter a reminder description")]
    EmptyDescription,
    #[error("Enter the recipient email")]
    EmptyRecipient,
    #[error("Reminder time must be in the future")]
    NotInFuture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReminderFireTime(NaiveDateTime);

impl ReminderFireTime {
    pub fn new(inner: NaiveDateTime) -> Self {
        let normalized = inner.with_nanosecond(0).expect("Will never fail.");
        Self(normalized)
    }

    pub fn datetime(&self) -> &NaiveDateTime {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderForm {
    pub description: String,
    pub details: String,
    pub scheduled_at: NaiveDateTime,
}

impl ReminderForm {
    pub fn new(
        description: impl Into<String>,
        details: impl Into<String>,
        scheduled_at: NaiveDateTime,
    ) -> Self {
        Self {
            description: description.into(),
            details: details.into(),
            scheduled_at,
        }
    }

    pub fn validate(&self) -> Result<NewReminder, ValidationError> {
        let description = self.description.trim();
        if description.is_empty() {
            return Err(ValidationError::EmptyDescription);
        }

        let details = Some(self.details.trim())
            .filter(|details| !details.is_empty())
            .map(str::to_owned);

        Ok(NewReminder {
            description: description.to_owned(),
            details,
            fire_at: ReminderFireTime::new(self.scheduled_at),
        })
    }
}

pub struct NewReminder {
    pub description: String,
    pub details: Option<String>,
    pub fire_at: ReminderFireTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reminder {
    pub id: ReminderId,
    pub description: String,
    pub details: Option<String>,
    pub fire_at: ReminderFireTime,
    pub notified: bool,
    pub state: ReminderState,
}

impl Reminder {
    pub fn from_new(id: ReminderId, new_reminder: NewReminder) -> Self {
        let NewReminder {
            description,
            details,
            fire_at,
        } = new_reminder;

        Self {
            id,
            description,
            details,
            fire_at,
            notified: false,
            state: ReminderState::Created,
        }
    }

    /// `DD.MM.YYYY HH:MM - description`, followed by the details on their own line.
    pub fn display_line(&self) -> String {
        let mut line = format!(
            "{} - {}",
            self.fire_at.datetime().format(DISPLAY_FORMAT),
            self.description
        );
        if let Some(details) = &self.details {
            line.push('\n');
            line.push_str(details);
        }
        line
    }
}
