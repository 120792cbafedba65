//! The booking core: availability, assignment, the booking state machine,
//! check-in, rescheduling, schedule-change impact and the periodic sweeps.
//!
//! Every operation takes `now` from the caller; nothing in here reads the
//! wall clock.

pub mod assignment;
pub mod automation;
pub mod availability;
pub mod checkin;
pub mod lifecycle;
pub mod reschedule;
pub mod schedule_impact;
pub mod slots;
pub mod store;

use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use sqlx::SqlitePool;

use crate::error::{AppError, AppResult};
use crate::gateway::PaymentGateway;
use crate::models::{Booking, Shop, Staff};
use crate::notifier::{self, Notification, Notifier};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Offset of the shops' local time from UTC.
    pub utc_offset: FixedOffset,
    /// Base for payment callback URLs.
    pub frontend_url: String,
    /// Ask the gateway before expiring an unpaid booking.
    pub verify_expiry_with_gateway: bool,
}

pub struct Engine {
    db: SqlitePool,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<dyn Notifier>,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(
        db: SqlitePool,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            db,
            gateway,
            notifier,
            settings,
        }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub(crate) async fn notify(&self, notification: Notification) {
        notifier::dispatch(self.notifier.as_ref(), notification).await;
    }

    pub fn local_time(&self, at: DateTime<Utc>) -> DateTime<FixedOffset> {
        at.with_timezone(&self.settings.utc_offset)
    }

    /// Shop-local date and time of day as a UTC instant.
    pub fn to_utc(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let local = date.and_time(time);
        let shift = Duration::seconds(i64::from(self.settings.utc_offset.local_minus_utc()));
        Utc.from_utc_datetime(&(local - shift))
    }

    pub(crate) async fn require_booking(&self, booking_id: &str) -> AppResult<Booking> {
        store::booking(&self.db, booking_id)
            .await?
            .ok_or_else(|| AppError::not_found("Booking not found"))
    }

    /// A booking the customer owns.
    pub(crate) async fn customer_booking(&self, customer_id: &str, booking_id: &str) -> AppResult<Booking> {
        let booking = self.require_booking(booking_id).await?;
        if booking.customer_id != customer_id {
            return Err(AppError::forbidden("This booking belongs to another customer"));
        }
        Ok(booking)
    }

    pub(crate) async fn require_shop(&self, shop_id: &str) -> AppResult<Shop> {
        store::shop(&self.db, shop_id)
            .await?
            .ok_or_else(|| AppError::not_found("Shop not found"))
    }

    /// A shop the owner owns.
    pub(crate) async fn owned_shop(&self, owner_id: &str, shop_id: &str) -> AppResult<Shop> {
        let shop = self.require_shop(shop_id).await?;
        if shop.owner_id != owner_id {
            return Err(AppError::forbidden("You do not own this shop"));
        }
        Ok(shop)
    }

    pub(crate) async fn owned_staff(&self, owner_id: &str, staff_id: &str) -> AppResult<Staff> {
        let staff = store::staff(&self.db, staff_id)
            .await?
            .ok_or_else(|| AppError::not_found("Staff not found"))?;
        self.owned_shop(owner_id, &staff.shop_id).await?;
        Ok(staff)
    }

    /// A booking at a shop the owner owns, plus that shop.
    pub(crate) async fn owner_booking(&self, owner_id: &str, booking_id: &str) -> AppResult<(Booking, Shop)> {
        let booking = self.require_booking(booking_id).await?;
        let shop = self.owned_shop(owner_id, &booking.shop_id).await?;
        Ok((booking, shop))
    }
}
