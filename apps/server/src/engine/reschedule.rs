use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::checkin::{Credentials, CLOSES_AFTER_MINUTES};
use super::lifecycle::{ensure_transition, view};
use super::{store, Engine};
use crate::error::{AppError, AppResult, ConflictReason};
use crate::models::*;
use crate::notifier::{Notification, NotificationKind};

pub const REASON_LATE_CHECK_IN: &str = "late_checkin";

/// More than the grace period past the start.
pub fn is_late(booking: &Booking, now: DateTime<Utc>) -> bool {
    now > booking.booking_time + Duration::minutes(CLOSES_AFTER_MINUTES)
}

pub fn can_reschedule(booking: &Booking, now: DateTime<Utc>) -> bool {
    is_late(booking, now) && booking.status == BookingStatus::Confirmed && booking.reschedule_count == 0
}

/// Late again after the one reschedule.
pub fn should_be_no_show(booking: &Booking, now: DateTime<Utc>) -> bool {
    is_late(booking, now) && booking.status == BookingStatus::Confirmed && booking.reschedule_count >= 1
}

#[derive(Debug, Clone, Serialize)]
pub struct RescheduleStatus {
    pub booking_id: String,
    pub status: BookingStatus,
    pub is_late: bool,
    pub can_reschedule: bool,
    pub should_be_no_show: bool,
    pub reschedule_count: i64,
    pub original_booking_time: Option<DateTime<Utc>>,
}

impl RescheduleStatus {
    pub fn of(booking: &Booking, now: DateTime<Utc>) -> Self {
        Self {
            booking_id: booking.id.clone(),
            status: booking.status,
            is_late: is_late(booking, now),
            can_reschedule: can_reschedule(booking, now),
            should_be_no_show: should_be_no_show(booking, now),
            reschedule_count: booking.reschedule_count,
            original_booking_time: booking.original_booking_time,
        }
    }
}

impl Engine {
    pub async fn reschedule_status(
        &self,
        customer_id: &str,
        booking_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<RescheduleStatus> {
        let booking = self.customer_booking(customer_id, booking_id).await?;
        Ok(RescheduleStatus::of(&booking, now))
    }

    /// Move a late booking once, to a new time with the same staff member.
    pub async fn reschedule(
        &self,
        customer_id: &str,
        booking_id: &str,
        new_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<BookingView> {
        let booking = self.customer_booking(customer_id, booking_id).await?;

        if should_be_no_show(&booking, now) {
            self.force_no_show(&booking, now).await?;
            return Err(AppError::conflict(
                ConflictReason::ForfeitedNoShow,
                "You were late again after rescheduling; the booking is now a no-show",
            ));
        }

        if !can_reschedule(&booking, now) {
            let message = if booking.reschedule_count > 0 {
                "This booking has already been rescheduled once"
            } else if booking.status != BookingStatus::Confirmed {
                "Only confirmed bookings can be rescheduled"
            } else {
                "Rescheduling opens once you are more than 15 minutes late"
            };
            return Err(AppError::conflict(ConflictReason::RescheduleUnavailable, message));
        }

        if new_time <= now {
            return Err(AppError::invalid("New booking time must be in the future"));
        }

        let new_end = new_time + (booking.end_time - booking.booking_time);
        self.ensure_within_hours(&booking.shop_id, new_time, new_end).await?;
        ensure_transition(booking.status, BookingStatus::Confirmed)?;

        let credentials = Credentials::issue();
        let moved = store::reschedule_if_free(
            self.db(),
            &store::Reschedule {
                id: &booking.id,
                staff_id: &booking.staff_id,
                booking_time: new_time,
                end_time: new_end,
                pin: &credentials.pin,
                qr_token: &credentials.qr_token,
                reason: REASON_LATE_CHECK_IN,
                now,
            },
        )
        .await?;

        if !moved {
            let current = self.require_booking(booking_id).await?;
            if current.status != BookingStatus::Confirmed || current.reschedule_count > 0 {
                return Err(AppError::conflict(
                    ConflictReason::RescheduleUnavailable,
                    "This booking can no longer be rescheduled",
                ));
            }
            return Err(AppError::conflict(
                ConflictReason::StaffBusy,
                "Your barber is not available at the new time",
            ));
        }

        tracing::info!(booking_id, %new_time, "Booking rescheduled after late check-in");
        self.notify(
            Notification::new(
                customer_id,
                NotificationKind::BookingRescheduled,
                "Booking rescheduled",
                format!("Your booking was moved. New check-in PIN: {}", credentials.pin),
            )
            .with_data(serde_json::json!({
                "booking_id": booking.id,
                "booking_time": new_time,
                "original_booking_time": booking.original_booking_time.unwrap_or(booking.booking_time),
            })),
        )
        .await;

        Ok(view(self.require_booking(booking_id).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::checkin::CheckInCredential;
    use crate::engine::testing::{base_time, fixture, Fixture};

    async fn confirmed(fx: &Fixture, staff: &str, start: DateTime<Utc>) -> Booking {
        let req = CreateBookingRequest {
            shop_id: "shop-1".into(),
            service_id: "svc-60".into(),
            staff_id: Some(staff.into()),
            booking_time: start,
        };
        let created = fx.engine.create_booking("cust-1", &req, base_time()).await.unwrap();
        let order = created.booking.booking.order_id.unwrap();
        fx.engine.handle_payment_notification(&order, "settlement", None, base_time()).await.unwrap();
        store::booking(&fx.db, &created.booking.booking.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_policy_predicates() {
        let fx = fixture().await;
        let mut b = confirmed(&fx, "staff-a", base_time() + Duration::hours(1)).await;
        let late = b.booking_time + Duration::minutes(16);

        assert!(!is_late(&b, b.booking_time + Duration::minutes(15)));
        assert!(is_late(&b, late));
        assert!(can_reschedule(&b, late));
        assert!(!should_be_no_show(&b, late));

        b.reschedule_count = 1;
        assert!(!can_reschedule(&b, late));
        assert!(should_be_no_show(&b, late));
    }

    #[tokio::test]
    async fn test_reschedule_once_reissues_credentials() {
        let fx = fixture().await;
        let b = confirmed(&fx, "staff-a", base_time() + Duration::hours(1)).await;
        let now = b.booking_time + Duration::minutes(20);
        let new_time = b.booking_time + Duration::hours(3);

        let moved = fx.engine.reschedule("cust-1", &b.id, new_time, now).await.unwrap();
        let m = &moved.booking;
        assert_eq!(m.booking_time, new_time);
        assert_eq!(m.end_time, new_time + Duration::minutes(60));
        assert_eq!(m.original_booking_time, Some(b.booking_time));
        assert_eq!(m.reschedule_count, 1);
        assert_eq!(m.reschedule_reason.as_deref(), Some(REASON_LATE_CHECK_IN));
        assert_ne!(m.qr_code_token, b.qr_code_token);

        // The old QR token no longer validates.
        let old = b.qr_code_token.clone().unwrap();
        let err = fx
            .engine
            .check_in("cust-1", CheckInCredential::QrCode(&old), new_time)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");

        // Second attempt before being late again: already used.
        let err = fx
            .engine
            .reschedule("cust-1", &b.id, new_time + Duration::hours(1), now)
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some("reschedule_unavailable"));
    }

    #[tokio::test]
    async fn test_late_again_forfeits() {
        let fx = fixture().await;
        let b = confirmed(&fx, "staff-a", base_time() + Duration::hours(1)).await;
        let new_time = b.booking_time + Duration::hours(3);
        fx.engine
            .reschedule("cust-1", &b.id, new_time, b.booking_time + Duration::minutes(20))
            .await
            .unwrap();

        let err = fx
            .engine
            .reschedule("cust-1", &b.id, new_time + Duration::hours(2), new_time + Duration::minutes(30))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some("forfeited_no_show"));
        let after = store::booking(&fx.db, &b.id).await.unwrap().unwrap();
        assert_eq!(after.status, BookingStatus::NoShow);
        assert_eq!(after.original_booking_time, Some(b.booking_time));
    }

    #[tokio::test]
    async fn test_reschedule_not_late_is_rejected() {
        let fx = fixture().await;
        let b = confirmed(&fx, "staff-a", base_time() + Duration::hours(1)).await;
        let err = fx
            .engine
            .reschedule("cust-1", &b.id, b.booking_time + Duration::hours(2), base_time())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some("reschedule_unavailable"));
    }

    #[tokio::test]
    async fn test_reschedule_into_own_staff_conflict() {
        let fx = fixture().await;
        let b = confirmed(&fx, "staff-a", base_time() + Duration::hours(1)).await;
        let other = confirmed(&fx, "staff-a", base_time() + Duration::hours(4)).await;

        let err = fx
            .engine
            .reschedule("cust-1", &b.id, other.booking_time, b.booking_time + Duration::minutes(20))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), Some("staff_busy"));

        let unchanged = store::booking(&fx.db, &b.id).await.unwrap().unwrap();
        assert_eq!(unchanged.reschedule_count, 0);
    }
}
