use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use super::checkin::CLOSES_AFTER_MINUTES;
use super::lifecycle::{ensure_transition, WebhookOutcome};
use super::{store, Engine};
use crate::clock::Clock;
use crate::gateway::{classify, GatewayStatus, PaymentEvent};
use crate::models::*;
use crate::notifier::{Notification, NotificationKind};

/// Unpaid bookings older than this are expired.
pub const PAYMENT_EXPIRY_HOURS: i64 = 24;
/// Awaiting confirmation longer than this completes automatically.
pub const AUTO_COMPLETE_HOURS: i64 = 24;
/// Reminders go out for bookings starting this many minutes from now.
pub const REMINDER_FROM_MINUTES: i64 = 50;
pub const REMINDER_TO_MINUTES: i64 = 60;

/// Counts from one sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AutomationReport {
    pub ran_at: Option<DateTime<Utc>>,
    pub expired: usize,
    pub reconciled: usize,
    pub skipped: usize,
    pub no_shows: usize,
    pub auto_completed: usize,
    pub reminders: usize,
    pub failures: usize,
}

impl AutomationReport {
    pub fn is_empty(&self) -> bool {
        self.expired
            + self.reconciled
            + self.skipped
            + self.no_shows
            + self.auto_completed
            + self.reminders
            + self.failures
            == 0
    }
}

impl Engine {
    /// One pass of every periodic task. Each task and each booking fails on
    /// its own; the rest of the sweep continues.
    pub async fn run_automation(&self, now: DateTime<Utc>) -> AutomationReport {
        let mut report = AutomationReport {
            ran_at: Some(now),
            ..Default::default()
        };

        self.expire_unpaid(now, &mut report).await;
        self.mark_no_shows(now, &mut report).await;
        self.auto_complete(now, &mut report).await;
        self.send_reminders(now, &mut report).await;

        report
    }

    async fn expire_unpaid(&self, now: DateTime<Utc>, report: &mut AutomationReport) {
        let cutoff = now - Duration::hours(PAYMENT_EXPIRY_HOURS);
        let stale = match store::stale_unpaid(self.db(), cutoff).await {
            Ok(list) => list,
            Err(e) => {
                tracing::error!("expire_unpaid: {}", e);
                report.failures += 1;
                return;
            }
        };

        for booking in stale {
            if self.settings().verify_expiry_with_gateway {
                let order_id = booking.order_id.clone().unwrap_or_default();
                match self.gateway.query_status(&order_id).await {
                    Ok(GatewayStatus::Found {
                        transaction_status,
                        fraud_status,
                    }) if classify(&transaction_status, fraud_status.as_deref()) == PaymentEvent::Settled => {
                        match self.apply_settlement(&booking, now).await {
                            Ok(WebhookOutcome::Confirmed) => report.reconciled += 1,
                            Ok(_) => {}
                            Err(e) => {
                                tracing::error!(booking_id = %booking.id, "Reconciling settled payment failed: {}", e);
                                report.failures += 1;
                            }
                        }
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(
                            booking_id = %booking.id,
                            order_id = %order_id,
                            "Gateway status unavailable, expiry postponed: {}",
                            e
                        );
                        report.skipped += 1;
                        continue;
                    }
                }
            }

            match self.close_unpaid(&booking, PaymentStatus::Expired, now).await {
                Ok(WebhookOutcome::Closed(_)) => report.expired += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(booking_id = %booking.id, "Expiring booking failed: {}", e);
                    report.failures += 1;
                }
            }
        }
    }

    async fn mark_no_shows(&self, now: DateTime<Utc>, report: &mut AutomationReport) {
        let cutoff = now - Duration::minutes(CLOSES_AFTER_MINUTES);
        let overdue = match store::overdue_confirmed(self.db(), cutoff).await {
            Ok(list) => list,
            Err(e) => {
                tracing::error!("mark_no_shows: {}", e);
                report.failures += 1;
                return;
            }
        };

        for booking in overdue {
            match self.force_no_show(&booking, now).await {
                Ok(true) => report.no_shows += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(booking_id = %booking.id, "Marking no-show failed: {}", e);
                    report.failures += 1;
                }
            }
        }
    }

    async fn auto_complete(&self, now: DateTime<Utc>, report: &mut AutomationReport) {
        let cutoff = now - Duration::hours(AUTO_COMPLETE_HOURS);
        let waiting = match store::stale_awaiting(self.db(), cutoff).await {
            Ok(list) => list,
            Err(e) => {
                tracing::error!("auto_complete: {}", e);
                report.failures += 1;
                return;
            }
        };

        for booking in waiting {
            if let Err(e) = ensure_transition(booking.status, BookingStatus::Completed) {
                tracing::error!(booking_id = %booking.id, "auto_complete: {}", e);
                report.failures += 1;
                continue;
            }
            match store::mark_completed(self.db(), &booking.id, true, now).await {
                Ok(true) => {
                    report.auto_completed += 1;
                    tracing::info!(booking_id = %booking.id, "Booking auto-completed");
                    self.notify(
                        Notification::new(
                            &booking.customer_id,
                            NotificationKind::BookingAutoCompleted,
                            "Visit completed",
                            "Your visit was confirmed automatically. You can now leave a review.",
                        )
                        .with_data(serde_json::json!({ "booking_id": booking.id })),
                    )
                    .await;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(booking_id = %booking.id, "Auto-completing booking failed: {}", e);
                    report.failures += 1;
                }
            }
        }
    }

    async fn send_reminders(&self, now: DateTime<Utc>, report: &mut AutomationReport) {
        let from = now + Duration::minutes(REMINDER_FROM_MINUTES);
        let to = now + Duration::minutes(REMINDER_TO_MINUTES);
        let due = match store::reminders_due(self.db(), from, to).await {
            Ok(list) => list,
            Err(e) => {
                tracing::error!("send_reminders: {}", e);
                report.failures += 1;
                return;
            }
        };

        for booking in due {
            // Claim first so a reminder goes out at most once.
            match store::mark_reminded(self.db(), &booking.id, now).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(booking_id = %booking.id, "Claiming reminder failed: {}", e);
                    report.failures += 1;
                    continue;
                }
            }

            let pin = booking.check_in_code.as_deref().unwrap_or("-");
            self.notify(
                Notification::new(
                    &booking.customer_id,
                    NotificationKind::BookingReminder,
                    "Your booking starts soon",
                    format!("Your appointment starts within the hour. Check-in PIN: {pin}"),
                )
                .with_data(serde_json::json!({
                    "booking_id": booking.id,
                    "booking_time": booking.booking_time,
                })),
            )
            .await;
            report.reminders += 1;
        }
    }
}

/// Periodic driver for [`Engine::run_automation`]. Overlapping runs are
/// skipped, never queued.
pub struct AutomationScheduler {
    engine: Arc<Engine>,
    clock: Arc<dyn Clock>,
    running: Mutex<()>,
    last: std::sync::Mutex<Option<AutomationReport>>,
}

impl AutomationScheduler {
    pub fn new(engine: Arc<Engine>, clock: Arc<dyn Clock>) -> Self {
        Self {
            engine,
            clock,
            running: Mutex::new(()),
            last: std::sync::Mutex::new(None),
        }
    }

    /// Run one sweep unless one is in flight. `None` means skipped.
    pub async fn run_once(&self) -> Option<AutomationReport> {
        let Ok(_guard) = self.running.try_lock() else {
            tracing::debug!("Automation sweep still running, skipping tick");
            return None;
        };

        let report = self.engine.run_automation(self.clock.now()).await;
        if !report.is_empty() {
            tracing::info!(
                expired = report.expired,
                reconciled = report.reconciled,
                no_shows = report.no_shows,
                auto_completed = report.auto_completed,
                reminders = report.reminders,
                failures = report.failures,
                "Automation sweep finished"
            );
        }

        if let Ok(mut last) = self.last.lock() {
            *last = Some(report.clone());
        }
        Some(report)
    }

    pub fn last_report(&self) -> Option<AutomationReport> {
        self.last.lock().ok().and_then(|last| last.clone())
    }

    pub fn spawn(self: Arc<Self>, every: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                self.run_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::engine::testing::{base_time, fixture, Fixture};

    async fn create(fx: &Fixture, staff: &str, start: DateTime<Utc>, created_at: DateTime<Utc>) -> Booking {
        let req = CreateBookingRequest {
            shop_id: "shop-1".into(),
            service_id: "svc-60".into(),
            staff_id: Some(staff.into()),
            booking_time: start,
        };
        let created = fx.engine.create_booking("cust-1", &req, created_at).await.unwrap();
        created.booking.booking
    }

    async fn pay(fx: &Fixture, booking: &Booking) -> Booking {
        let order = booking.order_id.clone().unwrap();
        fx.engine.handle_payment_notification(&order, "settlement", None, base_time()).await.unwrap();
        store::booking(&fx.db, &booking.id).await.unwrap().unwrap()
    }

    async fn status_of(fx: &Fixture, id: &str) -> BookingStatus {
        store::booking(&fx.db, id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_expiry_not_found_at_gateway() {
        let fx = fixture().await;
        let b = create(&fx, "staff-a", base_time() + Duration::days(3), base_time()).await;
        *fx.gateway.status.lock().unwrap() = Some(GatewayStatus::NotFound);

        let report = fx.engine.run_automation(base_time() + Duration::hours(23)).await;
        assert_eq!(report.expired, 0);

        let report = fx.engine.run_automation(base_time() + Duration::hours(25)).await;
        assert_eq!(report.expired, 1);
        let after = store::booking(&fx.db, &b.id).await.unwrap().unwrap();
        assert_eq!(after.status, BookingStatus::Cancelled);
        assert_eq!(after.payment_status, PaymentStatus::Expired);
    }

    #[tokio::test]
    async fn test_expiry_skips_on_gateway_error() {
        let fx = fixture().await;
        let b = create(&fx, "staff-a", base_time() + Duration::days(3), base_time()).await;

        let report = fx.engine.run_automation(base_time() + Duration::hours(25)).await;
        assert_eq!(report.skipped, 1);
        assert_eq!(status_of(&fx, &b.id).await, BookingStatus::PendingPayment);
    }

    #[tokio::test]
    async fn test_expiry_reconciles_settled_payment() {
        let fx = fixture().await;
        let b = create(&fx, "staff-a", base_time() + Duration::days(3), base_time()).await;
        *fx.gateway.status.lock().unwrap() = Some(GatewayStatus::Found {
            transaction_status: "settlement".into(),
            fraud_status: Some("accept".into()),
        });

        let report = fx.engine.run_automation(base_time() + Duration::hours(25)).await;
        assert_eq!(report.reconciled, 1);
        let after = store::booking(&fx.db, &b.id).await.unwrap().unwrap();
        assert_eq!(after.status, BookingStatus::Confirmed);
        assert!(after.check_in_code.is_some());
    }

    #[tokio::test]
    async fn test_no_show_after_grace_period() {
        let fx = fixture().await;
        let b = create(&fx, "staff-a", base_time() + Duration::hours(2), base_time()).await;
        let b = pay(&fx, &b).await;

        fx.engine.run_automation(b.booking_time + Duration::minutes(15)).await;
        assert_eq!(status_of(&fx, &b.id).await, BookingStatus::Confirmed);

        let report = fx.engine.run_automation(b.booking_time + Duration::minutes(16)).await;
        assert_eq!(report.no_shows, 1);
        assert_eq!(status_of(&fx, &b.id).await, BookingStatus::NoShow);
    }

    #[tokio::test]
    async fn test_auto_complete_after_a_day() {
        let fx = fixture().await;
        let b = create(&fx, "staff-a", base_time() + Duration::hours(2), base_time()).await;
        let b = pay(&fx, &b).await;
        let pin = b.check_in_code.clone().unwrap();
        let start = b.booking_time;

        fx.engine
            .check_in("cust-1", crate::engine::checkin::CheckInCredential::Pin { shop_id: "shop-1", pin: &pin }, start)
            .await
            .unwrap();
        fx.engine.start_service("owner-1", &b.id, start).await.unwrap();
        let done_at = start + Duration::hours(1);
        fx.engine.complete_service("owner-1", &b.id, done_at).await.unwrap();

        fx.engine.run_automation(done_at + Duration::hours(23)).await;
        assert_eq!(status_of(&fx, &b.id).await, BookingStatus::AwaitingConfirmation);

        let report = fx.engine.run_automation(done_at + Duration::hours(25)).await;
        assert_eq!(report.auto_completed, 1);
        let after = store::booking(&fx.db, &b.id).await.unwrap().unwrap();
        assert_eq!(after.status, BookingStatus::Completed);
        assert!(after.auto_confirmed);
    }

    #[tokio::test]
    async fn test_reminder_sent_once() {
        let fx = fixture().await;
        let b = create(&fx, "staff-a", base_time() + Duration::hours(2), base_time()).await;
        let b = pay(&fx, &b).await;

        let report = fx.engine.run_automation(b.booking_time - Duration::minutes(70)).await;
        assert_eq!(report.reminders, 0);

        let report = fx.engine.run_automation(b.booking_time - Duration::minutes(55)).await;
        assert_eq!(report.reminders, 1);

        let report = fx.engine.run_automation(b.booking_time - Duration::minutes(52)).await;
        assert_eq!(report.reminders, 0);

        let message: String = sqlx::query_scalar(
            "SELECT message FROM notifications WHERE kind = 'booking_reminder'",
        )
        .fetch_one(&fx.db)
        .await
        .unwrap();
        assert!(message.contains(b.check_in_code.as_deref().unwrap()));
    }

    #[tokio::test]
    async fn test_scheduler_skips_overlapping_run() {
        let fx = fixture().await;
        let engine = Arc::new(fx.engine);
        let scheduler = AutomationScheduler::new(engine, Arc::new(FixedClock::new(base_time())));

        let held = scheduler.running.lock().await;
        assert!(scheduler.run_once().await.is_none());
        drop(held);

        let report = scheduler.run_once().await.unwrap();
        assert_eq!(report.ran_at, Some(base_time()));
        assert!(scheduler.last_report().is_some());
    }
}
