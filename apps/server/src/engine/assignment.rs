use std::collections::HashSet;

use chrono::{DateTime, Utc};

use super::{store, Engine};
use crate::error::{AppError, AppResult, ConflictReason};
use crate::models::Staff;

/// A booking waiting for its staff member.
pub struct BookingDraft<'a> {
    pub id: &'a str,
    pub customer_id: &'a str,
    pub shop_id: &'a str,
    pub service_id: &'a str,
    pub booking_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_price: i64,
    pub order_id: &'a str,
    pub now: DateTime<Utc>,
}

impl BookingDraft<'_> {
    fn with_staff<'b>(&'b self, staff_id: &'b str) -> store::NewBooking<'b> {
        store::NewBooking {
            id: self.id,
            customer_id: self.customer_id,
            shop_id: self.shop_id,
            service_id: self.service_id,
            staff_id,
            booking_time: self.booking_time,
            end_time: self.end_time,
            total_price: self.total_price,
            order_id: self.order_id,
            now: self.now,
        }
    }
}

/// First candidate, in the given order, that is not busy.
pub fn pick_first_free<'s>(candidates: &'s [Staff], busy: &HashSet<String>) -> Option<&'s Staff> {
    candidates.iter().find(|s| !busy.contains(&s.id))
}

impl Engine {
    /// Resolve the staff member for a draft and persist it in one step.
    /// Returns the assigned staff id.
    pub(crate) async fn assign_and_insert(
        &self,
        draft: &BookingDraft<'_>,
        preferred_staff: Option<&str>,
    ) -> AppResult<String> {
        match preferred_staff {
            Some(staff_id) => self.insert_with_staff(draft, staff_id).await,
            None => self.insert_first_fit(draft).await,
        }
    }

    async fn insert_with_staff(&self, draft: &BookingDraft<'_>, staff_id: &str) -> AppResult<String> {
        let staff = store::staff(self.db(), staff_id)
            .await?
            .filter(|s| s.shop_id == draft.shop_id)
            .ok_or_else(|| AppError::not_found("Staff not found in this shop"))?;

        if !staff.is_active {
            return Err(AppError::conflict(
                ConflictReason::StaffInactive,
                format!("{} is not taking bookings", staff.name),
            ));
        }

        let new_booking = draft.with_staff(&staff.id);
        if !store::insert_if_free(self.db(), &new_booking).await? {
            return Err(AppError::conflict(
                ConflictReason::StaffBusy,
                format!("{} is already booked at this time", staff.name),
            ));
        }

        tracing::info!(booking_id = draft.id, staff_id = %staff.id, "Booking created with requested staff");
        Ok(staff.id)
    }

    async fn insert_first_fit(&self, draft: &BookingDraft<'_>) -> AppResult<String> {
        let candidates = store::active_staff(self.db(), draft.shop_id).await?;
        if candidates.is_empty() {
            return Err(AppError::not_found("This shop has no active staff"));
        }

        let mut busy =
            store::busy_staff(self.db(), draft.shop_id, draft.booking_time, draft.end_time).await?;

        // A candidate can be taken between the read and the insert; the
        // insert re-checks, so move on to the next one.
        while let Some(staff) = pick_first_free(&candidates, &busy) {
            if store::insert_if_free(self.db(), &draft.with_staff(&staff.id)).await? {
                tracing::info!(booking_id = draft.id, staff_id = %staff.id, "Booking auto-assigned");
                return Ok(staff.id.clone());
            }
            tracing::debug!(staff_id = %staff.id, "Staff taken concurrently, trying next");
            busy.insert(staff.id.clone());
        }

        Err(AppError::conflict(
            ConflictReason::FullyBooked,
            "All staff are booked at this time",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn staff(id: &str) -> Staff {
        Staff {
            id: id.into(),
            shop_id: "shop".into(),
            name: id.to_uppercase(),
            is_active: true,
            created_at: Utc.with_ymd_and_hms(2029, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_first_fit_keeps_order() {
        let candidates = vec![staff("a"), staff("b"), staff("c")];
        let busy: HashSet<String> = ["a".to_string()].into();
        assert_eq!(pick_first_free(&candidates, &busy).unwrap().id, "b");
    }

    #[test]
    fn test_first_fit_none_when_all_busy() {
        let candidates = vec![staff("a"), staff("b")];
        let busy: HashSet<String> = ["a".to_string(), "b".to_string()].into();
        assert!(pick_first_free(&candidates, &busy).is_none());
        assert!(pick_first_free(&[], &HashSet::new()).is_none());
    }
}
