mod common;
mod scheduler;

pub use common::{DeliveryEvent, DeliveryKey, delivery_events};
pub use scheduler::{DeliveryScheduler, ReminderScheduler, ScheduleRequest, ScheduledDelivery};
