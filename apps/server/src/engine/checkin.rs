use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use super::lifecycle::{ensure_transition, stale_state, view};
use super::{store, Engine};
use crate::error::{AppError, AppResult, CheckInRejection};
use crate::models::*;
use crate::notifier::{Notification, NotificationKind};

/// Check-in opens this long before the booking starts.
pub const OPENS_BEFORE_MINUTES: i64 = 60;
/// And closes this long after.
pub const CLOSES_AFTER_MINUTES: i64 = 15;

const QR_TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub pin: String,
    pub qr_token: String,
}

impl Credentials {
    pub fn issue() -> Self {
        Self::issue_with(&mut rand::thread_rng())
    }

    pub fn issue_with<R: Rng>(rng: &mut R) -> Self {
        let mut token = [0u8; QR_TOKEN_BYTES];
        rng.fill(&mut token[..]);
        Self {
            pin: format!("{:06}", rng.gen_range(0..1_000_000u32)),
            qr_token: hex::encode(token),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    TooEarly,
    Open,
    TooLate,
}

pub fn window(booking_time: DateTime<Utc>, now: DateTime<Utc>) -> Window {
    if now < booking_time - Duration::minutes(OPENS_BEFORE_MINUTES) {
        Window::TooEarly
    } else if now > booking_time + Duration::minutes(CLOSES_AFTER_MINUTES) {
        Window::TooLate
    } else {
        Window::Open
    }
}

pub enum CheckInCredential<'a> {
    QrCode(&'a str),
    Pin { shop_id: &'a str, pin: &'a str },
}

impl CheckInCredential<'_> {
    fn method(&self) -> CheckInMethod {
        match self {
            CheckInCredential::QrCode(_) => CheckInMethod::QrCode,
            CheckInCredential::Pin { .. } => CheckInMethod::Pin,
        }
    }
}

impl Engine {
    pub async fn check_in(
        &self,
        customer_id: &str,
        credential: CheckInCredential<'_>,
        now: DateTime<Utc>,
    ) -> AppResult<BookingView> {
        let found = match &credential {
            CheckInCredential::QrCode(token) => store::confirmed_by_qr(self.db(), customer_id, token).await?,
            CheckInCredential::Pin { shop_id, pin } => {
                store::confirmed_by_pin(self.db(), customer_id, shop_id, pin).await?
            }
        };
        let booking = found.ok_or_else(|| AppError::not_found("No confirmed booking matches this check-in code"))?;

        match window(booking.booking_time, now) {
            Window::TooEarly => Err(AppError::CheckInWindow {
                rejection: CheckInRejection::TooEarly,
                message: format!("Check-in opens {OPENS_BEFORE_MINUTES} minutes before your booking"),
            }),
            Window::TooLate => {
                self.force_no_show(&booking, now).await?;
                Err(AppError::CheckInWindow {
                    rejection: CheckInRejection::TooLate,
                    message: format!(
                        "Check-in closed {CLOSES_AFTER_MINUTES} minutes after your booking time; marked as no-show"
                    ),
                })
            }
            Window::Open => {
                ensure_transition(booking.status, BookingStatus::CheckedIn)?;
                let method = credential.method();
                if !store::mark_checked_in(self.db(), &booking.id, method, now).await? {
                    return Err(stale_state());
                }
                tracing::info!(booking_id = %booking.id, ?method, "Customer checked in");

                let shop = self.require_shop(&booking.shop_id).await?;
                self.notify(
                    Notification::new(
                        &shop.owner_id,
                        NotificationKind::CustomerCheckedIn,
                        "Customer arrived",
                        "A customer has checked in and is ready for service.",
                    )
                    .with_data(serde_json::json!({
                        "booking_id": booking.id,
                        "staff_id": booking.staff_id,
                    })),
                )
                .await;

                Ok(view(self.require_booking(&booking.id).await?))
            }
        }
    }

    /// `confirmed -> no_show`. Returns whether this call made the change.
    pub(crate) async fn force_no_show(&self, booking: &Booking, now: DateTime<Utc>) -> AppResult<bool> {
        ensure_transition(booking.status, BookingStatus::NoShow)?;
        if !store::mark_no_show(self.db(), &booking.id, now).await? {
            return Ok(false);
        }
        tracing::info!(booking_id = %booking.id, "Booking marked as no-show");

        self.notify(
            Notification::new(
                &booking.customer_id,
                NotificationKind::BookingNoShow,
                "Booking missed",
                "You did not check in on time, so this booking was marked as a no-show.",
            )
            .with_data(serde_json::json!({ "booking_id": booking.id })),
        )
        .await;
        Ok(true)
    }
}
