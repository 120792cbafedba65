use std::sync::Arc;

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    BookingCreated,
    BookingConfirmed,
    CustomerCheckedIn,
    ServiceStarted,
    ServiceCompleted,
    BookingAutoCompleted,
    BookingNoShow,
    BookingReminder,
    BookingRescheduled,
    BookingStaffChanged,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::BookingCreated => "booking_created",
            NotificationKind::BookingConfirmed => "booking_confirmed",
            NotificationKind::CustomerCheckedIn => "customer_checked_in",
            NotificationKind::ServiceStarted => "service_started",
            NotificationKind::ServiceCompleted => "service_completed",
            NotificationKind::BookingAutoCompleted => "booking_auto_completed",
            NotificationKind::BookingNoShow => "booking_no_show",
            NotificationKind::BookingReminder => "booking_reminder",
            NotificationKind::BookingRescheduled => "booking_rescheduled",
            NotificationKind::BookingStaffChanged => "booking_staff_changed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub user_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub data: serde_json::Value,
}

impl Notification {
    pub fn new(
        user_id: impl Into<String>,
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            kind,
            title: title.into(),
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> anyhow::Result<()>;
}

/// Fire-and-forget delivery: failures are logged, never returned.
pub async fn dispatch(notifier: &dyn Notifier, notification: Notification) {
    let kind = notification.kind.as_str();
    let user_id = notification.user_id.clone();
    if let Err(e) = notifier.notify(notification).await {
        tracing::warn!(kind, user_id = %user_id, "Notification failed: {}", e);
    }
}

/// Persists notifications for the client apps to poll.
pub struct StoreNotifier {
    db: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl StoreNotifier {
    pub fn new(db: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }
}

#[async_trait]
impl Notifier for StoreNotifier {
    async fn notify(&self, notification: Notification) -> anyhow::Result<()> {
        let data = if notification.data.is_null() {
            None
        } else {
            Some(notification.data.to_string())
        };

        sqlx::query(
            "INSERT INTO notifications (id, user_id, kind, title, message, data, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&notification.user_id)
        .bind(notification.kind.as_str())
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(data)
        .bind(self.clock.now())
        .execute(&self.db)
        .await?;

        tracing::debug!(
            kind = notification.kind.as_str(),
            user_id = %notification.user_id,
            "Notification stored"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    struct Failing;

    #[async_trait]
    impl Notifier for Failing {
        async fn notify(&self, _notification: Notification) -> anyhow::Result<()> {
            anyhow::bail!("smtp down")
        }
    }

    #[tokio::test]
    async fn test_dispatch_swallows_failures() {
        let n = Notification::new("u1", NotificationKind::BookingReminder, "t", "m");
        dispatch(&Failing, n).await;
    }

    #[tokio::test]
    async fn test_store_notifier_persists() {
        let pool = crate::db::in_memory().await.unwrap();
        let notifier = StoreNotifier::new(pool.clone(), Arc::new(SystemClock));

        let n = Notification::new("cust-1", NotificationKind::BookingConfirmed, "Paid", "See you")
            .with_data(serde_json::json!({ "booking_id": "b1" }));
        notifier.notify(n).await.unwrap();

        let (kind, data): (String, Option<String>) =
            sqlx::query_as("SELECT kind, data FROM notifications WHERE user_id = 'cust-1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(kind, "booking_confirmed");
        assert!(data.unwrap().contains("b1"));
    }
}
