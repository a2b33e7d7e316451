use std::sync::Arc;

use thiserror::Error;

use crate::{
    export::{ExportError, ExportOutcome, PdfExporter},
    reminder::{Reminder, ReminderForm, ReminderId, ReminderState, ValidationError},
    scheduling::{
        DeliveryEvent, DeliveryKey, ReminderScheduler, ScheduleRequest, ScheduledDelivery,
    },
    storage::{ReminderStorage, StorageError},
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Could not save the reminder")]
    Storage(#[from] StorageError),

    #[error("Export failed")]
    Export(#[from] ExportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Info(String),
    Warning(String),
}

pub struct ReminderApp {
    reminders: Vec<Reminder>,
    display_text: String,
    scheduled: Vec<DeliveryKey>,
    storage: Arc<dyn ReminderStorage>,
    scheduler: Arc<dyn ReminderScheduler>,
    exporter: PdfExporter,
}

impl ReminderApp {
    pub fn new(
        storage: Arc<dyn ReminderStorage>,
        scheduler: Arc<dyn ReminderScheduler>,
        exporter: PdfExporter,
    ) -> Self {
        Self {
            reminders: Vec::new(),
            display_text: String::new(),
            scheduled: Vec::new(),
            storage,
            scheduler,
            exporter,
        }
    }

    pub fn reminders(&self) -> &[Reminder] {
        &self.reminders
    }

    pub fn display_text(&self) -> &str {
        &self.display_text
    }

    pub async fn add_reminder(&mut self, form: &ReminderForm) -> Result<&Reminder, AppError> {
        let new_reminder = form.validate()?;
        let reminder = self.storage.insert(new_reminder).await?;

        let line = reminder.display_line();
        self.display_text = if self.display_text.is_empty() {
            line
        } else {
            format!("{line}\n{}", self.display_text)
        };

        log::info!("Added reminder [reminder_id = {}]", reminder.id);
        self.reminders.push(reminder);
        Ok(&self.reminders[self.reminders.len() - 1])
    }

    /// Schedules an email for the most recently added reminder. When nothing
    /// was added yet the reminder is created from `form` first. A given form is
    /// always validated, even when an earlier reminder is sent instead.
    pub async fn send_notification(
        &mut self,
        recipient: &str,
        form: Option<&ReminderForm>,
    ) -> Result<ScheduledDelivery, AppError> {
        if recipient.trim().is_empty() {
            return Err(ValidationError::EmptyRecipient.into());
        }
        if let Some(form) = form {
            form.validate()?;
        }

        if self.reminders.is_empty() {
            let form = form.ok_or(ValidationError::EmptyDescription)?;
            self.add_reminder(form).await?;
        }

        let index = self.reminders.len() - 1;
        let request = ScheduleRequest::new(self.reminders[index].clone(), recipient);
        let scheduled = self.scheduler.schedule_delivery(request).await?;

        self.reminders[index].state = ReminderState::Scheduled;
        if !self.scheduled.contains(&scheduled.key) {
            self.scheduled.push(scheduled.key.clone());
        }
        Ok(scheduled)
    }

    pub async fn pending_deliveries(&self) -> usize {
        self.scheduler.pending_deliveries().await
    }

    /// Cancels every email of this session that has not fired yet. Returns how
    /// many were cancelled.
    pub async fn shutdown(&mut self) -> usize {
        let mut cancelled = 0;
        for key in self.scheduled.drain(..) {
            if self.scheduler.cancel_delivery(&key).await {
                cancelled += 1;
            }
        }

        if cancelled > 0 {
            log::info!("Cancelled {} pending delivery(ies) on exit", cancelled);
        }
        cancelled
    }

    pub async fn export_reminders(&self) -> Result<ExportOutcome, AppError> {
        Ok(self.exporter.export(self.storage.as_ref()).await?)
    }

    pub fn handle_delivery_event(&mut self, event: DeliveryEvent) -> Notice {
        let (DeliveryEvent::Delivered { key, .. } | DeliveryEvent::Failed { key, .. }) = &event;
        self.scheduled.retain(|scheduled| scheduled != key);

        match event {
            DeliveryEvent::Delivered { reminder_id, key } => {
                if let Some(reminder) = self.reminder_mut(reminder_id) {
                    reminder.state = ReminderState::Delivered;
                    reminder.notified = true;
                }
                Notice::Info(format!("Email sent to {}", key.recipient))
            }
            DeliveryEvent::Failed {
                reminder_id,
                key,
                error,
            } => {
                if let Some(reminder) = self.reminder_mut(reminder_id) {
                    reminder.state = ReminderState::Failed;
                }
                Notice::Warning(format!(
                    "Could not send email to {}: {}",
                    key.recipient,
                    error_chain(&error)
                ))
            }
        }
    }

    fn reminder_mut(&mut self, id: ReminderId) -> Option<&mut Reminder> {
        let reminder = self.reminders.iter_mut().find(|reminder| reminder.id == id);
        if reminder.is_none() {
            log::warn!(
                "Delivery result for unknown reminder [reminder_id = {}]",
                id
            );
        }
        reminder
    }
}

/// Joins the error and all of its sources into one line.
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
