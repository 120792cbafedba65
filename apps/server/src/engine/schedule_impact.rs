use chrono::{DateTime, Datelike, Duration, FixedOffset, Utc};
use serde::Serialize;

use super::{slots, store, Engine};
use crate::error::{AppError, AppResult, ConflictReason};
use crate::models::*;
use crate::notifier::{Notification, NotificationKind};

/// How far ahead a schedule change is checked against bookings.
pub const HORIZON_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    DayClosed,
    OutsideHours,
}

/// An upcoming booking the proposed schedule would no longer cover.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleConflict {
    pub booking_id: String,
    pub customer_id: String,
    pub staff_id: String,
    pub status: BookingStatus,
    pub booking_time: DateTime<Utc>,
    pub local_day: DayOfWeek,
    pub local_time: String,
    pub reason: ConflictKind,
}

pub fn find_conflicts(
    bookings: &[Booking],
    proposed: &WeeklySchedule,
    offset: FixedOffset,
) -> Vec<ScheduleConflict> {
    bookings
        .iter()
        .filter_map(|b| {
            let local = b.booking_time.with_timezone(&offset);
            let day = DayOfWeek::from(local.weekday());
            let time = local.time();

            let reason = match proposed.day(day).window() {
                None => ConflictKind::DayClosed,
                Some((open, close)) if time < open || time >= close => ConflictKind::OutsideHours,
                Some(_) => return None,
            };

            Some(ScheduleConflict {
                booking_id: b.id.clone(),
                customer_id: b.customer_id.clone(),
                staff_id: b.staff_id.clone(),
                status: b.status,
                booking_time: b.booking_time,
                local_day: day,
                local_time: slots::format_hhmm(time),
                reason,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleChange {
    pub shop_id: String,
    pub schedule: WeeklySchedule,
    /// Bookings left outside the new hours by a forced update.
    pub unresolved: Vec<ScheduleConflict>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AffectedBooking {
    pub booking_id: String,
    pub customer_id: String,
    pub status: BookingStatus,
    pub booking_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl From<&Booking> for AffectedBooking {
    fn from(b: &Booking) -> Self {
        Self {
            booking_id: b.id.clone(),
            customer_id: b.customer_id.clone(),
            status: b.status,
            booking_time: b.booking_time,
            end_time: b.end_time,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StaffImpact {
    pub staff_id: String,
    pub staff_name: String,
    pub is_active: bool,
    pub affected: Vec<AffectedBooking>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReassignFailure {
    pub booking_id: String,
    pub booking_time: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReassignReport {
    pub moved: Vec<String>,
    pub failed: Vec<ReassignFailure>,
}

impl Engine {
    pub async fn shop_schedule(&self, owner_id: &str, shop_id: &str) -> AppResult<Option<WeeklySchedule>> {
        self.owned_shop(owner_id, shop_id).await?;
        Ok(store::schedule(self.db(), shop_id).await?)
    }

    pub async fn preview_schedule_conflicts(
        &self,
        owner_id: &str,
        shop_id: &str,
        proposed: &WeeklySchedule,
        now: DateTime<Utc>,
    ) -> AppResult<Vec<ScheduleConflict>> {
        proposed.validate().map_err(AppError::InvalidInput)?;
        self.owned_shop(owner_id, shop_id).await?;

        let upcoming =
            store::upcoming_for_shop(self.db(), shop_id, now, now + Duration::days(HORIZON_DAYS)).await?;
        Ok(find_conflicts(&upcoming, proposed, self.settings().utc_offset))
    }

    /// Persist a new weekly schedule. With conflicts and no `force`, nothing
    /// is written and the conflicts come back as the error.
    ///
    /// The schedule is written before the conflicts are read, in one
    /// transaction, so the write lock is held across the check.
    pub async fn apply_schedule_change(
        &self,
        owner_id: &str,
        shop_id: &str,
        proposed: &WeeklySchedule,
        force: bool,
        now: DateTime<Utc>,
    ) -> AppResult<ScheduleChange> {
        proposed.validate().map_err(AppError::InvalidInput)?;
        self.owned_shop(owner_id, shop_id).await?;

        let mut tx = self.db().begin().await?;
        store::save_schedule(&mut tx, shop_id, proposed).await?;

        let upcoming =
            store::upcoming_for_shop(&mut *tx, shop_id, now, now + Duration::days(HORIZON_DAYS)).await?;
        let conflicts = find_conflicts(&upcoming, proposed, self.settings().utc_offset);
        if !conflicts.is_empty() && !force {
            tx.rollback().await?;
            return Err(AppError::ScheduleConflicts(conflicts));
        }
        tx.commit().await?;

        if conflicts.is_empty() {
            tracing::info!(shop_id, "Shop schedule updated");
        } else {
            tracing::warn!(
                shop_id,
                affected = conflicts.len(),
                "Shop schedule force-updated over existing bookings"
            );
        }

        Ok(ScheduleChange {
            shop_id: shop_id.to_string(),
            schedule: proposed.clone(),
            unresolved: conflicts,
        })
    }

    pub async fn staff_deactivation_impact(
        &self,
        owner_id: &str,
        staff_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<StaffImpact> {
        let staff = self.owned_staff(owner_id, staff_id).await?;
        let upcoming = store::upcoming_for_staff(self.db(), staff_id, now).await?;
        Ok(StaffImpact {
            staff_id: staff.id,
            staff_name: staff.name,
            is_active: staff.is_active,
            affected: upcoming.iter().map(AffectedBooking::from).collect(),
        })
    }

    /// Deactivation always proceeds; the returned impact lists the bookings
    /// that still need a new staff member.
    pub async fn deactivate_staff(&self, owner_id: &str, staff_id: &str, now: DateTime<Utc>) -> AppResult<StaffImpact> {
        self.owned_staff(owner_id, staff_id).await?;
        store::set_staff_active(self.db(), staff_id, false).await?;

        let impact = self.staff_deactivation_impact(owner_id, staff_id, now).await?;
        tracing::info!(staff_id, affected = impact.affected.len(), "Staff deactivated");
        Ok(impact)
    }

    pub async fn activate_staff(&self, owner_id: &str, staff_id: &str) -> AppResult<Staff> {
        self.owned_staff(owner_id, staff_id).await?;
        store::set_staff_active(self.db(), staff_id, true).await?;
        tracing::info!(staff_id, "Staff reactivated");

        store::staff(self.db(), staff_id)
            .await?
            .ok_or_else(|| AppError::not_found("Staff not found"))
    }

    /// Move every upcoming booking of `from_staff` that `to_staff` can take.
    pub async fn reassign_bookings(
        &self,
        owner_id: &str,
        from_staff: &str,
        to_staff: &str,
        now: DateTime<Utc>,
    ) -> AppResult<ReassignReport> {
        if from_staff == to_staff {
            return Err(AppError::invalid("Choose a different staff member"));
        }
        let source = self.owned_staff(owner_id, from_staff).await?;
        let target = store::staff(self.db(), to_staff)
            .await?
            .filter(|s| s.shop_id == source.shop_id)
            .ok_or_else(|| AppError::not_found("Target staff not found in this shop"))?;
        if !target.is_active {
            return Err(AppError::conflict(
                ConflictReason::StaffInactive,
                format!("{} is not taking bookings", target.name),
            ));
        }

        let mut report = ReassignReport::default();
        for booking in store::upcoming_for_staff(self.db(), from_staff, now).await? {
            match store::reassign_if_free(self.db(), &booking.id, from_staff, to_staff, now).await {
                Ok(true) => {
                    self.notify(
                        Notification::new(
                            &booking.customer_id,
                            NotificationKind::BookingStaffChanged,
                            "Your barber changed",
                            format!("{} will take care of your booking.", target.name),
                        )
                        .with_data(serde_json::json!({
                            "booking_id": booking.id,
                            "staff_id": target.id,
                        })),
                    )
                    .await;
                    report.moved.push(booking.id);
                }
                Ok(false) => report.failed.push(ReassignFailure {
                    booking_id: booking.id,
                    booking_time: booking.booking_time,
                    reason: ConflictReason::StaffBusy.as_str().to_string(),
                }),
                Err(e) => {
                    tracing::error!(booking_id = %booking.id, "Reassignment failed: {}", e);
                    report.failed.push(ReassignFailure {
                        booking_id: booking.id,
                        booking_time: booking.booking_time,
                        reason: "internal".to_string(),
                    });
                }
            }
        }

        tracing::info!(
            from_staff,
            to_staff,
            moved = report.moved.len(),
            failed = report.failed.len(),
            "Bookings reassigned"
        );
        Ok(report)
    }
}
