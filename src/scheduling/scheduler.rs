use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use tokio::{
    sync::{Mutex, Semaphore},
    task::JoinHandle,
    time::{self, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    appsettings::SchedulerSettings,
    clock::Clock,
    delivery::{MailTransport, OutgoingMail, render_mail},
    reminder::{Reminder, ReminderId, ValidationError},
};

use super::common::{DeliveryEventSender, DeliveryKey};

pub struct ScheduleRequest {
    pub reminder: Reminder,
    pub recipient: String,
}

impl ScheduleRequest {
    pub fn new(reminder: Reminder, recipient: impl Into<String>) -> Self {
        Self {
            reminder,
            recipient: recipient.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledDelivery {
    pub reminder_id: ReminderId,
    pub key: DeliveryKey,
    /// An earlier pending delivery under the same key was cancelled.
    pub replaced: bool,
}

#[async_trait]
pub trait ReminderScheduler: Send + Sync + 'static {
    async fn schedule_delivery(
        &self,
        request: ScheduleRequest,
    ) -> Result<ScheduledDelivery, ValidationError>;

    /// Returns `false` when nothing was pending under the key.
    async fn cancel_delivery(&self, key: &DeliveryKey) -> bool;

    async fn pending_deliveries(&self) -> usize;
}

struct ScheduledTask {
    generation: u64,
    task: JoinHandle<()>,
    cancellation_token: CancellationToken,
}

impl ScheduledTask {
    fn cancel(self) {
        self.cancellation_token.cancel();
    }
}

type DeliveryTaskStore = Mutex<HashMap<DeliveryKey, ScheduledTask>>;

pub struct DeliveryScheduler {
    tasks: Arc<DeliveryTaskStore>,
    transport: Arc<dyn MailTransport>,
    events: DeliveryEventSender,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    misfire_grace: Duration,
    next_generation: AtomicU64,
}

impl DeliveryScheduler {
    pub fn new(
        transport: Arc<dyn MailTransport>,
        events: DeliveryEventSender,
        clock: Arc<dyn Clock>,
        settings: &SchedulerSettings,
    ) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            transport,
            events,
            clock,
            permits: Arc::new(Semaphore::new(settings.max_concurrent_deliveries.max(1))),
            misfire_grace: Duration::from_secs(settings.misfire_grace_secs),
            next_generation: AtomicU64::new(0),
        }
    }

    pub(super) fn get_target_delay(
        fire_at: &NaiveDateTime,
        now: NaiveDateTime,
    ) -> Result<Duration, ValidationError> {
        if *fire_at <= now {
            return Err(ValidationError::NotInFuture);
        }

        (*fire_at - now)
            .to_std()
            .map_err(|_| ValidationError::NotInFuture)
    }
}

#[async_trait]
impl ReminderScheduler for DeliveryScheduler {
    async fn schedule_delivery(
        &self,
        request: ScheduleRequest,
    ) -> Result<ScheduledDelivery, ValidationError> {
        let ScheduleRequest {
            reminder,
            recipient,
        } = request;

        let recipient = recipient.trim();
        if recipient.is_empty() {
            return Err(ValidationError::EmptyRecipient);
        }

        let fire_at = *reminder.fire_at.datetime();
        let delay = Self::get_target_delay(&fire_at, self.clock.now())?;

        let key = DeliveryKey {
            fire_at,
            recipient: recipient.to_owned(),
        };
        let mail = render_mail(&reminder, recipient);

        let mut tasks = self.tasks.lock().await;
        let replaced = match tasks.remove(&key) {
            Some(previous) => {
                log::info!("Replacing pending delivery [key = {}]", key);
                previous.cancel();
                true
            }
            None => false,
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancellation_token = CancellationToken::new();
        let delivery = DeliveryTask {
            reminder_id: reminder.id,
            key: key.clone(),
            mail,
            generation,
            tasks: Arc::clone(&self.tasks),
            transport: Arc::clone(&self.transport),
            events: self.events.clone(),
            permits: Arc::clone(&self.permits),
            misfire_grace: self.misfire_grace,
        };

        log::info!(
            "Scheduled delivery in {:?} [reminder_id = {}, key = {}]",
            delay,
            reminder.id,
            key
        );

        let deadline = Instant::now() + delay;
        let task = tokio::spawn(delivery.run(cancellation_token.child_token(), deadline));
        tasks.insert(
            key.clone(),
            ScheduledTask {
                generation,
                task,
                cancellation_token,
            },
        );

        Ok(ScheduledDelivery {
            reminder_id: reminder.id,
            key,
            replaced,
        })
    }

    async fn cancel_delivery(&self, key: &DeliveryKey) -> bool {
        match self.tasks.lock().await.remove(key) {
            Some(task) => {
                task.cancel();
                log::info!("Cancelled pending delivery [key = {}]", key);
                true
            }
            None => false,
        }
    }

    async fn pending_deliveries(&self) -> usize {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|scheduled| !scheduled.task.is_finished())
            .count()
    }
}

struct DeliveryTask {
    reminder_id: ReminderId,
    key: DeliveryKey,
    mail: OutgoingMail,
    generation: u64,
    tasks: Arc<DeliveryTaskStore>,
    transport: Arc<dyn MailTransport>,
    events: DeliveryEventSender,
    permits: Arc<Semaphore>,
    misfire_grace: Duration,
}

impl DeliveryTask {
    async fn run(self, cancellation_token: CancellationToken, deadline: Instant) {
        tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => {
                log::info!("Delivery was cancelled before firing [key = {}]", self.key);
                return;
            }
            _ = time::sleep_until(deadline) => {}
        }

        let lateness = Instant::now().saturating_duration_since(deadline);
        if lateness > self.misfire_grace {
            log::warn!(
                "Delivery fired {:?} late [reminder_id = {}, key = {}]",
                lateness,
                self.reminder_id,
                self.key
            );
        }

        if !self.unregister().await {
            log::info!("Delivery was superseded while firing [key = {}]", self.key);
            return;
        }

        self.deliver().await;
    }

    /// Removes this task from the store. Returns `false` when it was already
    /// cancelled or replaced, in which case it must not deliver.
    async fn unregister(&self) -> bool {
        let mut tasks = self.tasks.lock().await;
        let registered = tasks
            .get(&self.key)
            .is_some_and(|scheduled| scheduled.generation == self.generation);
        if registered {
            tasks.remove(&self.key);
        }
        registered
    }

    async fn deliver(self) {
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(error) => {
                log::error!("Delivery permits are gone [key = {}]: {}", self.key, error);
                return;
            }
        };

        let notified = match self.transport.send(&self.mail).await {
            Ok(()) => {
                log::info!(
                    "Delivered reminder [reminder_id = {}, key = {}]",
                    self.reminder_id,
                    self.key
                );
                self.events
                    .notify_delivered(self.reminder_id, self.key.clone())
                    .await
            }
            Err(error) => {
                log::error!(
                    "Failed to deliver reminder [reminder_id = {}, key = {}]: {:?}",
                    self.reminder_id,
                    self.key,
                    error
                );
                self.events
                    .notify_failed(self.reminder_id, self.key.clone(), error)
                    .await
            }
        };

        if let Err(error) = notified {
            log::warn!(
                "Could not report delivery result [key = {}]: {}",
                self.key,
                error
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, atomic::AtomicUsize};

    use chrono::{TimeDelta, Timelike};
    use proptest::prelude::*;
    use proptest_arbitrary_interop::arb;
    use tokio::sync::mpsc;

    use crate::{
        clock::FixedClock,
        delivery::TransportError,
        reminder::ReminderForm,
        scheduling::{DeliveryEvent, delivery_events},
        test_utils::{FakeMailTransport, datetime},
    };

    use super::*;

    struct TestContext {
        transport: Arc<FakeMailTransport>,
        events: mpsc::Receiver<DeliveryEvent>,
        scheduler: DeliveryScheduler,
        now: NaiveDateTime,
    }

    impl TestContext {
        fn new(transport: Arc<FakeMailTransport>) -> Self {
            Self::at(datetime(2025, 1, 1, 12, 0), transport)
        }

        fn at(now: NaiveDateTime, transport: Arc<FakeMailTransport>) -> Self {
            let (sender, events) = delivery_events(16);
            let scheduler = DeliveryScheduler::new(
                transport.clone(),
                sender,
                Arc::new(FixedClock(now)),
                &SchedulerSettings::default(),
            );

            Self {
                transport,
                events,
                scheduler,
                now,
            }
        }

        fn request_in(&self, delay: TimeDelta, recipient: &str) -> ScheduleRequest {
            ScheduleRequest::new(reminder_at(1, self.now + delay), recipient)
        }
    }

    /// Holds every send until the test opens the gate.
    struct GatedMailTransport {
        gate: Semaphore,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        sent: AtomicUsize,
    }

    impl GatedMailTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                sent: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MailTransport for GatedMailTransport {
        async fn send(&self, _mail: &OutgoingMail) -> Result<(), TransportError> {
            let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

            self.gate.acquire().await.unwrap().forget();

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn reminder_at(id: ReminderId, fire_at: NaiveDateTime) -> Reminder {
        let new_reminder = ReminderForm::new("Pay rent", "", fire_at)
            .validate()
            .unwrap();
        Reminder::from_new(id, new_reminder)
    }

    async fn wait(delay: TimeDelta) {
        time::sleep(delay.to_std().unwrap()).await;
    }

    fn tokio_ct(
        future: impl Future<Output = Result<(), TestCaseError>>,
    ) -> Result<(), TestCaseError> {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
            .block_on(future)
    }

    #[test]
    fn target_delay_is_distance_to_fire_time() {
        let now = datetime(2025, 5, 31, 12, 0);

        let delay = DeliveryScheduler::get_target_delay(&datetime(2025, 5, 31, 13, 30), now);

        assert_eq!(delay, Ok(Duration::from_secs(90 * 60)));
    }

    #[test]
    fn target_delay_rejects_present_and_past() {
        let now = datetime(2025, 5, 31, 12, 0);

        assert_eq!(
            DeliveryScheduler::get_target_delay(&now, now),
            Err(ValidationError::NotInFuture)
        );
        assert_eq!(
            DeliveryScheduler::get_target_delay(&datetime(2025, 5, 30, 12, 0), now),
            Err(ValidationError::NotInFuture)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_once_at_fire_time() {
        let mut ctx = TestContext::new(FakeMailTransport::new());
        let request = ctx.request_in(TimeDelta::hours(1), "a@b.com");

        let scheduled = ctx.scheduler.schedule_delivery(request).await.unwrap();
        assert!(!scheduled.replaced);
        assert_eq!(ctx.scheduler.pending_deliveries().await, 1);

        wait(TimeDelta::hours(1) - TimeDelta::seconds(1)).await;
        assert!(ctx.transport.attempts().is_empty(), "Delivery fired early");

        wait(TimeDelta::seconds(2)).await;
        let attempts = ctx.transport.attempts();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].recipient, "a@b.com");
        assert_eq!(attempts[0].subject, "Reminder: Pay rent");
        assert_eq!(ctx.scheduler.pending_deliveries().await, 0);

        match ctx.events.try_recv() {
            Ok(DeliveryEvent::Delivered { reminder_id, key }) => {
                assert_eq!(reminder_id, 1);
                assert_eq!(key, scheduled.key);
            }
            other => panic!("Expected delivered event, got {:?}", other),
        }

        wait(TimeDelta::days(2)).await;
        assert_eq!(ctx.transport.attempts().len(), 1);
        assert!(ctx.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn late_wakeup_still_delivers_once() {
        let mut ctx = TestContext::new(FakeMailTransport::new());
        ctx.scheduler
            .schedule_delivery(ctx.request_in(TimeDelta::hours(1), "a@b.com"))
            .await
            .unwrap();

        time::advance(Duration::from_secs(2 * 3600)).await;
        wait(TimeDelta::seconds(1)).await;

        assert_eq!(ctx.transport.attempts().len(), 1);
        assert!(matches!(
            ctx.events.try_recv(),
            Ok(DeliveryEvent::Delivered { .. })
        ));

        wait(TimeDelta::days(1)).await;
        assert_eq!(ctx.transport.attempts().len(), 1);
        assert!(ctx.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_sends_are_capped_by_settings() {
        let now = datetime(2025, 1, 1, 12, 0);
        let transport = GatedMailTransport::new();
        let (sender, _events) = delivery_events(16);
        let settings = SchedulerSettings {
            max_concurrent_deliveries: 1,
            ..SchedulerSettings::default()
        };
        let scheduler = DeliveryScheduler::new(
            transport.clone(),
            sender,
            Arc::new(FixedClock(now)),
            &settings,
        );

        for recipient in ["a@b.com", "c@d.com"] {
            let request =
                ScheduleRequest::new(reminder_at(1, now + TimeDelta::minutes(5)), recipient);
            scheduler.schedule_delivery(request).await.unwrap();
        }

        wait(TimeDelta::minutes(10)).await;
        assert_eq!(transport.in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(transport.sent.load(Ordering::SeqCst), 0);

        transport.gate.add_permits(2);
        wait(TimeDelta::seconds(1)).await;

        assert_eq!(transport.sent.load(Ordering::SeqCst), 2);
        assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_fire_time_that_is_not_in_future() {
        let ctx = TestContext::new(FakeMailTransport::new());

        let at_now = ctx.request_in(TimeDelta::zero(), "a@b.com");
        let in_past = ctx.request_in(TimeDelta::minutes(-5), "a@b.com");

        assert_eq!(
            ctx.scheduler.schedule_delivery(at_now).await,
            Err(ValidationError::NotInFuture)
        );
        assert_eq!(
            ctx.scheduler.schedule_delivery(in_past).await,
            Err(ValidationError::NotInFuture)
        );
        assert_eq!(ctx.scheduler.pending_deliveries().await, 0);

        wait(TimeDelta::days(1)).await;
        assert!(ctx.transport.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_empty_recipient() {
        let ctx = TestContext::new(FakeMailTransport::new());
        let request = ctx.request_in(TimeDelta::hours(1), "  ");

        assert_eq!(
            ctx.scheduler.schedule_delivery(request).await,
            Err(ValidationError::EmptyRecipient)
        );
        assert_eq!(ctx.scheduler.pending_deliveries().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_same_key_replaces_pending_delivery() {
        let mut ctx = TestContext::new(FakeMailTransport::new());

        let first = ctx
            .scheduler
            .schedule_delivery(ctx.request_in(TimeDelta::minutes(30), "a@b.com"))
            .await
            .unwrap();
        let second = ctx
            .scheduler
            .schedule_delivery(ctx.request_in(TimeDelta::minutes(30), "a@b.com"))
            .await
            .unwrap();

        assert_eq!(first.key, second.key);
        assert!(second.replaced);
        assert_eq!(ctx.scheduler.pending_deliveries().await, 1);

        wait(TimeDelta::hours(1)).await;

        assert_eq!(ctx.transport.attempts().len(), 1);
        assert!(matches!(
            ctx.events.try_recv(),
            Ok(DeliveryEvent::Delivered { .. })
        ));
        assert!(ctx.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn different_recipients_are_delivered_separately() {
        let ctx = TestContext::new(FakeMailTransport::new());

        for recipient in ["a@b.com", "c@d.com"] {
            let request = ctx.request_in(TimeDelta::minutes(10), recipient);
            ctx.scheduler.schedule_delivery(request).await.unwrap();
        }
        assert_eq!(ctx.scheduler.pending_deliveries().await, 2);

        wait(TimeDelta::minutes(11)).await;

        let mut recipients: Vec<_> = ctx
            .transport
            .attempts()
            .into_iter()
            .map(|mail| mail.recipient)
            .collect();
        recipients.sort();
        assert_eq!(recipients, ["a@b.com", "c@d.com"]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_delivery_never_fires() {
        let mut ctx = TestContext::new(FakeMailTransport::new());
        let scheduled = ctx
            .scheduler
            .schedule_delivery(ctx.request_in(TimeDelta::minutes(10), "a@b.com"))
            .await
            .unwrap();

        assert!(ctx.scheduler.cancel_delivery(&scheduled.key).await);
        assert!(!ctx.scheduler.cancel_delivery(&scheduled.key).await);

        wait(TimeDelta::hours(1)).await;

        assert!(ctx.transport.attempts().is_empty());
        assert!(ctx.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_is_reported_once_without_retry() {
        let mut ctx = TestContext::new(FakeMailTransport::failing("authentication failed"));
        ctx.scheduler
            .schedule_delivery(ctx.request_in(TimeDelta::minutes(1), "a@b.com"))
            .await
            .unwrap();

        wait(TimeDelta::days(1)).await;

        assert_eq!(ctx.transport.attempts().len(), 1);
        match ctx.events.try_recv() {
            Ok(DeliveryEvent::Failed { error, .. }) => {
                assert!(error.to_string().contains("authentication failed"));
            }
            other => panic!("Expected failed event, got {:?}", other),
        }
        assert!(ctx.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_event_channel_does_not_break_delivery() {
        let ctx = TestContext::new(FakeMailTransport::new());
        let TestContext {
            transport,
            events,
            scheduler,
            now,
        } = ctx;
        drop(events);

        scheduler
            .schedule_delivery(ScheduleRequest::new(
                reminder_at(7, now + TimeDelta::minutes(1)),
                "a@b.com",
            ))
            .await
            .unwrap();
        wait(TimeDelta::minutes(2)).await;

        assert_eq!(transport.attempts().len(), 1);
        assert_eq!(scheduler.pending_deliveries().await, 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn fire_time_at_or_before_now_is_always_rejected(
            now in arb::<NaiveDateTime>(),
            seconds_before in 0i64..10_000_000,
        ) {
            let now = now.with_nanosecond(0).unwrap();
            let Some(fire_at) = now.checked_sub_signed(TimeDelta::seconds(seconds_before)) else {
                return Ok(());
            };

            tokio_ct(async move {
                let ctx = TestContext::at(now, FakeMailTransport::new());
                let result = ctx
                    .scheduler
                    .schedule_delivery(ScheduleRequest::new(reminder_at(1, fire_at), "a@b.com"))
                    .await;

                prop_assert_eq!(result, Err(ValidationError::NotInFuture));
                prop_assert_eq!(ctx.scheduler.pending_deliveries().await, 0);
                Ok(())
            })?;
        }

        #[test]
        fn accepted_delivery_fires_exactly_once_never_early(
            seconds_ahead in 1i64..(7 * 24 * 3600),
        ) {
            tokio_ct(async move {
                let now = datetime(2025, 6, 1, 8, 0);
                let ctx = TestContext::at(now, FakeMailTransport::new());
                let delay = TimeDelta::seconds(seconds_ahead);

                ctx.scheduler
                    .schedule_delivery(ctx.request_in(delay, "a@b.com"))
                    .await
                    .unwrap();

                wait(delay - TimeDelta::milliseconds(1)).await;
                prop_assert_eq!(ctx.transport.attempts().len(), 0);

                wait(TimeDelta::hours(1)).await;
                prop_assert_eq!(ctx.transport.attempts().len(), 1);
                Ok(())
            })?;
        }
    }
}
