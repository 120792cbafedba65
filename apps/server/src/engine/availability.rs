use std::collections::HashSet;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use serde::Serialize;

use super::slots::{self, enumerate_slots, intervals_overlap};
use super::store::{self, Occupancy};
use super::Engine;
use crate::error::{AppError, AppResult};
use crate::models::DayOfWeek;

/// Grid of bookable start times.
pub const SLOT_INTERVAL_MINUTES: u32 = 60;
/// Slot length when no service is given.
pub const DEFAULT_DURATION_MINUTES: i64 = 60;

/// Hours assumed for shops that never configured a schedule.
pub fn default_hours() -> (NaiveTime, NaiveTime) {
    (
        NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
        NaiveTime::from_hms_opt(21, 0, 0).unwrap_or_default(),
    )
}

#[derive(Debug, Clone)]
pub struct Slot {
    pub label: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Slots where every active staff member already holds overlapping time.
/// Time held by inactive staff does not count; with no active staff every
/// slot is full.
pub fn fully_booked(slots: &[Slot], occupancy: &[Occupancy], active_staff: &HashSet<String>) -> Vec<String> {
    slots
        .iter()
        .filter(|slot| {
            let busy: HashSet<&str> = occupancy
                .iter()
                .filter(|o| active_staff.contains(&o.staff_id))
                .filter(|o| intervals_overlap(slot.start, slot.end, o.booking_time, o.end_time))
                .map(|o| o.staff_id.as_str())
                .collect();
            busy.len() >= active_staff.len()
        })
        .map(|slot| slot.label.clone())
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct DayAvailability {
    pub date: NaiveDate,
    pub is_open: bool,
    pub fully_booked_times: Vec<String>,
    pub total_staff: usize,
    /// The shop has no active staff, so nothing can be booked.
    pub no_staff: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StaffAvailability {
    pub unavailable_staff_ids: Vec<String>,
    pub available_staff_count: usize,
    pub total_staff: usize,
}

/// Either availability view, serialized as the bare inner object.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Availability {
    Staff(StaffAvailability),
    Day(DayAvailability),
}

impl Engine {
    /// Staff with time held in `[start, end)`.
    pub async fn unavailable_staff_at(
        &self,
        shop_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<HashSet<String>> {
        Ok(store::busy_staff(self.db(), shop_id, start, end).await?)
    }

    pub async fn staff_availability(
        &self,
        shop_id: &str,
        date: NaiveDate,
        time: NaiveTime,
        duration_minutes: i64,
    ) -> AppResult<StaffAvailability> {
        self.require_shop(shop_id).await?;
        let start = self.to_utc(date, time);
        let end = start + Duration::minutes(duration_minutes);

        let busy = self.unavailable_staff_at(shop_id, start, end).await?;
        let active = store::active_staff(self.db(), shop_id).await?;
        let busy_active = active.iter().filter(|s| busy.contains(&s.id)).count();

        let mut unavailable_staff_ids: Vec<String> = busy.into_iter().collect();
        unavailable_staff_ids.sort();

        Ok(StaffAvailability {
            unavailable_staff_ids,
            available_staff_count: active.len() - busy_active,
            total_staff: active.len(),
        })
    }

    pub async fn fully_booked_slots(
        &self,
        shop_id: &str,
        date: NaiveDate,
        duration_minutes: i64,
    ) -> AppResult<DayAvailability> {
        if duration_minutes <= 0 {
            return Err(AppError::invalid("Duration must be positive"));
        }
        self.require_shop(shop_id).await?;

        let window = match store::schedule(self.db(), shop_id).await? {
            Some(week) => week.day(DayOfWeek::from(date.weekday())).window(),
            None => Some(default_hours()),
        };

        let active: HashSet<String> = store::active_staff(self.db(), shop_id)
            .await?
            .into_iter()
            .map(|s| s.id)
            .collect();

        let Some((open, close)) = window else {
            return Ok(DayAvailability {
                date,
                is_open: false,
                fully_booked_times: Vec::new(),
                total_staff: active.len(),
                no_staff: active.is_empty(),
            });
        };

        let day_slots: Vec<Slot> = enumerate_slots(open, close, SLOT_INTERVAL_MINUTES)
            .map(|t| {
                let start = self.to_utc(date, t);
                Slot {
                    label: slots::format_hhmm(t),
                    start,
                    end: start + Duration::minutes(duration_minutes),
                }
            })
            .collect();

        let occupancy = match (day_slots.first(), day_slots.last()) {
            (Some(first), Some(last)) => store::occupancy(self.db(), shop_id, first.start, last.end).await?,
            _ => Vec::new(),
        };

        Ok(DayAvailability {
            date,
            is_open: true,
            fully_booked_times: fully_booked(&day_slots, &occupancy, &active),
            total_staff: active.len(),
            no_staff: active.is_empty(),
        })
    }
}
