use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};

use crate::{
    delivery::{MailTransport, OutgoingMail, TransportError},
    reminder::{NewReminder, Reminder},
    storage::{ReminderStorage, StorageError},
};

pub struct FakeMailTransport {
    attempts: Mutex<Vec<OutgoingMail>>,
    failure: Option<String>,
}

impl FakeMailTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            attempts: Mutex::new(Vec::new()),
            failure: None,
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            attempts: Mutex::new(Vec::new()),
            failure: Some(message.to_owned()),
        })
    }

    pub fn attempts(&self) -> Vec<OutgoingMail> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for FakeMailTransport {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), TransportError> {
        self.attempts.lock().unwrap().push(mail.clone());
        match &self.failure {
            Some(message) => Err(anyhow::anyhow!(message.clone()).into()),
            None => Ok(()),
        }
    }
}

/// Storage whose database is always gone.
pub struct FailingReminderStorage;

#[async_trait]
impl ReminderStorage for FailingReminderStorage {
    async fn insert(&self, _reminder: NewReminder) -> Result<Reminder, StorageError> {
        Err(sqlx::Error::PoolClosed.into())
    }

    async fn get_all(&self) -> Result<Vec<Reminder>, StorageError> {
        Err(sqlx::Error::PoolClosed.into())
    }
}

pub fn datetime(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, day)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}
