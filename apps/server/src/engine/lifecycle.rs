use chrono::{DateTime, Utc};

use super::assignment::BookingDraft;
use super::{checkin, slots, store, Engine};
use crate::error::{AppError, AppResult, ConflictReason};
use crate::gateway::{self, CustomerDetails, LineItem, PaymentEvent, SessionRequest};
use crate::models::*;
use crate::notifier::{Notification, NotificationKind};

/// Permitted edges of the booking state machine. `Confirmed -> Confirmed`
/// is a reschedule.
pub fn can_transition(from: BookingStatus, to: BookingStatus) -> bool {
    use BookingStatus::*;
    matches!(
        (from, to),
        (PendingPayment, Confirmed)
            | (PendingPayment, Cancelled)
            | (Confirmed, CheckedIn)
            | (Confirmed, NoShow)
            | (Confirmed, Confirmed)
            | (CheckedIn, InProgress)
            | (InProgress, AwaitingConfirmation)
            | (AwaitingConfirmation, Completed)
    )
}

pub fn ensure_transition(from: BookingStatus, to: BookingStatus) -> AppResult<()> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(AppError::conflict(
            ConflictReason::InvalidState,
            format!("Booking is {from} and cannot move to {to}"),
        ))
    }
}

pub fn flags(status: BookingStatus) -> BookingFlags {
    BookingFlags {
        can_pay: status == BookingStatus::PendingPayment,
        can_check_in: status == BookingStatus::Confirmed,
        can_start: status == BookingStatus::CheckedIn,
        can_complete: status == BookingStatus::InProgress,
        can_confirm: status == BookingStatus::AwaitingConfirmation,
        can_review: status == BookingStatus::Completed,
    }
}

pub fn view(booking: Booking) -> BookingView {
    let flags = flags(booking.status);
    BookingView { booking, flags }
}

/// What a payment notification did to its booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Confirmed,
    AlreadyConfirmed,
    StillPending,
    Closed(PaymentStatus),
    AlreadyClosed,
    /// Paid after the booking was cancelled; needs a manual refund.
    LateSettlement,
    Ignored,
}

impl Engine {
    pub async fn create_booking(
        &self,
        customer_id: &str,
        req: &CreateBookingRequest,
        now: DateTime<Utc>,
    ) -> AppResult<CreateBookingResponse> {
        let shop = self.require_shop(&req.shop_id).await?;
        let service = store::service(self.db(), &req.service_id)
            .await?
            .filter(|s| s.shop_id == shop.id && s.is_active)
            .ok_or_else(|| AppError::not_found("Service not offered by this shop"))?;
        let customer = store::customer(self.db(), customer_id)
            .await?
            .ok_or_else(|| AppError::not_found("Customer not found"))?;

        if req.booking_time < now {
            return Err(AppError::invalid("Booking time is in the past"));
        }

        let booking_time = req.booking_time;
        let end_time = slots::end_time(booking_time, service.duration_minutes);
        self.ensure_within_hours(&shop.id, booking_time, end_time).await?;

        let booking_id = uuid::Uuid::new_v4().to_string();
        let order_id = gateway::order_id_for(&booking_id);
        let draft = BookingDraft {
            id: &booking_id,
            customer_id,
            shop_id: &shop.id,
            service_id: &service.id,
            booking_time,
            end_time,
            total_price: service.price,
            order_id: &order_id,
            now,
        };
        let staff_id = self
            .assign_and_insert(&draft, req.staff_id.as_deref())
            .await?;

        let session = match self.open_payment_session(&booking_id, &order_id, &customer, &service).await {
            Ok(session) => session,
            Err(e) => {
                // No unpaid booking may outlive a failed session.
                if let Err(cleanup) = store::delete_booking(self.db(), &booking_id).await {
                    tracing::error!(booking_id = %booking_id, "Failed to roll back booking: {}", cleanup);
                }
                return Err(e);
            }
        };
        store::attach_payment(self.db(), &booking_id, &session.token, &session.redirect_url, now).await?;

        tracing::info!(
            booking_id = %booking_id,
            order_id = %order_id,
            staff_id = %staff_id,
            "Booking awaiting payment"
        );

        self.notify(
            Notification::new(
                customer_id,
                NotificationKind::BookingCreated,
                "Booking created",
                format!("Complete the payment to confirm your {} at {}.", service.name, shop.name),
            )
            .with_data(serde_json::json!({ "booking_id": booking_id })),
        )
        .await;

        let booking = self.require_booking(&booking_id).await?;
        Ok(CreateBookingResponse {
            booking: view(booking),
            payment: PaymentRedirect {
                token: session.token,
                redirect_url: session.redirect_url,
            },
        })
    }

    async fn open_payment_session(
        &self,
        booking_id: &str,
        order_id: &str,
        customer: &Customer,
        service: &Service,
    ) -> AppResult<crate::gateway::PaymentSession> {
        let callbacks = gateway::callback_urls(&self.settings().frontend_url, booking_id)
            .map_err(crate::gateway::GatewayError::from)?;
        let request = SessionRequest {
            order_id: order_id.to_string(),
            amount: service.price,
            customer: CustomerDetails {
                id: customer.id.clone(),
                name: customer.name.clone(),
                email: customer.email.clone(),
                phone: customer.phone.clone(),
            },
            items: vec![LineItem {
                id: service.id.clone(),
                name: service.name.clone(),
                price: service.price,
                quantity: 1,
            }],
            callbacks,
        };
        Ok(self.gateway.create_session(&request).await?)
    }

    /// Reject an interval outside the shop's open window for that local day.
    /// Shops that never configured a schedule accept any time.
    pub(crate) async fn ensure_within_hours(
        &self,
        shop_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<()> {
        let Some(week) = store::schedule(self.db(), shop_id).await? else {
            return Ok(());
        };

        let local_start = self.local_time(start);
        let local_end = self.local_time(end);
        let day = DayOfWeek::from(chrono::Datelike::weekday(&local_start));

        let Some((open, close)) = week.day(day).window() else {
            return Err(AppError::invalid(format!("The shop is closed on {}", day.as_str())));
        };

        let same_day = local_start.date_naive() == local_end.date_naive();
        if local_start.time() < open || !same_day || local_end.time() > close {
            return Err(AppError::invalid(format!(
                "Booking must fit within opening hours {}-{}",
                slots::format_hhmm(open),
                slots::format_hhmm(close)
            )));
        }
        Ok(())
    }

    /// Apply a gateway notification. Unknown orders are `NotFound`.
    pub async fn handle_payment_notification(
        &self,
        order_id: &str,
        transaction_status: &str,
        fraud_status: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<WebhookOutcome> {
        let booking = match store::booking_by_order(self.db(), order_id).await? {
            Some(b) => b,
            None => {
                let id = order_id.strip_prefix(gateway::ORDER_PREFIX).unwrap_or(order_id);
                store::booking(self.db(), id)
                    .await?
                    .ok_or_else(|| AppError::not_found(format!("No booking for order {order_id}")))?
            }
        };

        let event = gateway::classify(transaction_status, fraud_status);
        tracing::info!(
            order_id,
            booking_id = %booking.id,
            transaction_status,
            ?event,
            "Payment notification"
        );

        let outcome = match event {
            PaymentEvent::Settled => self.apply_settlement(&booking, now).await?,
            PaymentEvent::Pending => WebhookOutcome::StillPending,
            PaymentEvent::Failed => self.close_unpaid(&booking, PaymentStatus::Failed, now).await?,
            PaymentEvent::Expired => self.close_unpaid(&booking, PaymentStatus::Expired, now).await?,
            PaymentEvent::Ignored => WebhookOutcome::Ignored,
        };
        Ok(outcome)
    }

    /// `pending_payment -> confirmed`, issuing check-in credentials. Re-applying
    /// to a confirmed booking is a no-op.
    pub(crate) async fn apply_settlement(&self, booking: &Booking, now: DateTime<Utc>) -> AppResult<WebhookOutcome> {
        match booking.status {
            BookingStatus::PendingPayment => {}
            BookingStatus::Cancelled => {
                tracing::warn!(
                    booking_id = %booking.id,
                    "Payment settled for a cancelled booking, refund required"
                );
                return Ok(WebhookOutcome::LateSettlement);
            }
            _ => return Ok(WebhookOutcome::AlreadyConfirmed),
        }
        ensure_transition(booking.status, BookingStatus::Confirmed)?;

        let credentials = checkin::Credentials::issue();
        if !store::mark_paid(self.db(), &booking.id, &credentials.pin, &credentials.qr_token, now).await? {
            return Ok(WebhookOutcome::AlreadyConfirmed);
        }

        tracing::info!(booking_id = %booking.id, "Booking confirmed, payment settled");
        self.notify(
            Notification::new(
                &booking.customer_id,
                NotificationKind::BookingConfirmed,
                "Payment received",
                format!("Your booking is confirmed. Check-in PIN: {}", credentials.pin),
            )
            .with_data(serde_json::json!({
                "booking_id": booking.id,
                "booking_time": booking.booking_time,
            })),
        )
        .await;

        Ok(WebhookOutcome::Confirmed)
    }

    pub(crate) async fn close_unpaid(
        &self,
        booking: &Booking,
        payment_status: PaymentStatus,
        now: DateTime<Utc>,
    ) -> AppResult<WebhookOutcome> {
        if booking.status != BookingStatus::PendingPayment {
            return Ok(WebhookOutcome::AlreadyClosed);
        }
        ensure_transition(booking.status, BookingStatus::Cancelled)?;

        if store::close_unpaid(self.db(), &booking.id, payment_status, now).await? {
            tracing::info!(booking_id = %booking.id, ?payment_status, "Unpaid booking cancelled");
            Ok(WebhookOutcome::Closed(payment_status))
        } else {
            Ok(WebhookOutcome::AlreadyClosed)
        }
    }

    pub async fn start_service(&self, owner_id: &str, booking_id: &str, now: DateTime<Utc>) -> AppResult<BookingView> {
        let (booking, shop) = self.owner_booking(owner_id, booking_id).await?;
        ensure_transition(booking.status, BookingStatus::InProgress)?;

        if !store::mark_started(self.db(), &booking.id, now).await? {
            return Err(stale_state());
        }

        self.notify(
            Notification::new(
                &booking.customer_id,
                NotificationKind::ServiceStarted,
                "Service started",
                format!("Your service at {} has started.", shop.name),
            )
            .with_data(serde_json::json!({ "booking_id": booking.id })),
        )
        .await;

        Ok(view(self.require_booking(booking_id).await?))
    }

    pub async fn complete_service(&self, owner_id: &str, booking_id: &str, now: DateTime<Utc>) -> AppResult<BookingView> {
        let (booking, shop) = self.owner_booking(owner_id, booking_id).await?;
        ensure_transition(booking.status, BookingStatus::AwaitingConfirmation)?;

        if !store::mark_service_done(self.db(), &booking.id, now).await? {
            return Err(stale_state());
        }

        self.notify(
            Notification::new(
                &booking.customer_id,
                NotificationKind::ServiceCompleted,
                "Please confirm your visit",
                format!("{} marked your service as done. Confirm to leave a review.", shop.name),
            )
            .with_data(serde_json::json!({ "booking_id": booking.id })),
        )
        .await;

        Ok(view(self.require_booking(booking_id).await?))
    }

    pub async fn confirm_completion(
        &self,
        customer_id: &str,
        booking_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<BookingView> {
        let booking = self.customer_booking(customer_id, booking_id).await?;
        ensure_transition(booking.status, BookingStatus::Completed)?;

        if !store::mark_completed(self.db(), &booking.id, false, now).await? {
            return Err(stale_state());
        }
        tracing::info!(booking_id, "Booking completed by customer");

        Ok(view(self.require_booking(booking_id).await?))
    }

    pub async fn customer_booking_view(&self, customer_id: &str, booking_id: &str) -> AppResult<BookingView> {
        Ok(view(self.customer_booking(customer_id, booking_id).await?))
    }

    pub async fn customer_bookings(&self, customer_id: &str) -> AppResult<Vec<BookingView>> {
        let bookings = store::customer_bookings(self.db(), customer_id).await?;
        Ok(bookings.into_iter().map(view).collect())
    }

    pub async fn shop_bookings(&self, owner_id: &str, shop_id: &str) -> AppResult<Vec<BookingView>> {
        self.owned_shop(owner_id, shop_id).await?;
        let bookings = store::shop_bookings(self.db(), shop_id).await?;
        Ok(bookings.into_iter().map(view).collect())
    }
}

/// The guarded update matched nothing: someone else moved the booking first.
pub(crate) fn stale_state() -> AppError {
    AppError::conflict(
        ConflictReason::InvalidState,
        "Booking changed state concurrently, reload and retry",
    )
}
