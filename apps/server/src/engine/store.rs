//! SQL for the booking core. Every status change is guarded by the source
//! status, and every write that claims staff time carries its own overlap
//! check so the check and the write are one statement.

use std::collections::HashSet;

use chrono::{DateTime, NaiveTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::models::*;

// ── Reference data ──

pub async fn shop(db: &SqlitePool, id: &str) -> Result<Option<Shop>, sqlx::Error> {
    sqlx::query_as::<_, Shop>("SELECT * FROM shops WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
}

pub async fn service(db: &SqlitePool, id: &str) -> Result<Option<Service>, sqlx::Error> {
    sqlx::query_as::<_, Service>("SELECT * FROM services WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
}

pub async fn customer(db: &SqlitePool, id: &str) -> Result<Option<Customer>, sqlx::Error> {
    sqlx::query_as::<_, Customer>("SELECT * FROM customers WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
}

pub async fn staff(db: &SqlitePool, id: &str) -> Result<Option<Staff>, sqlx::Error> {
    sqlx::query_as::<_, Staff>("SELECT * FROM staff WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
}

/// Active staff of a shop in assignment order.
pub async fn active_staff(db: &SqlitePool, shop_id: &str) -> Result<Vec<Staff>, sqlx::Error> {
    sqlx::query_as::<_, Staff>(
        "SELECT * FROM staff WHERE shop_id = ? AND is_active = 1 ORDER BY created_at, id",
    )
    .bind(shop_id)
    .fetch_all(db)
    .await
}

pub async fn set_staff_active(db: &SqlitePool, id: &str, active: bool) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE staff SET is_active = ? WHERE id = ?")
        .bind(active)
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}

// ── Schedules ──

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    day_of_week: String,
    is_open: bool,
    open_time: Option<String>,
    close_time: Option<String>,
}

fn parse_hhmm(value: Option<&str>) -> Option<NaiveTime> {
    value.and_then(|v| NaiveTime::parse_from_str(v, hhmm::FORMAT).ok())
}

/// The shop's weekly schedule, or `None` if it was never configured.
pub async fn schedule(db: &SqlitePool, shop_id: &str) -> Result<Option<WeeklySchedule>, sqlx::Error> {
    let rows = sqlx::query_as::<_, ScheduleRow>(
        "SELECT day_of_week, is_open, open_time, close_time FROM shop_schedules WHERE shop_id = ?",
    )
    .bind(shop_id)
    .fetch_all(db)
    .await?;

    if rows.is_empty() {
        return Ok(None);
    }

    let mut week = WeeklySchedule::default();
    for row in rows {
        let Some(day) = DayOfWeek::parse(&row.day_of_week) else {
            tracing::warn!(shop_id, day = %row.day_of_week, "Unknown day in stored schedule");
            continue;
        };
        *week.day_mut(day) = DaySchedule {
            is_open: row.is_open,
            open_time: parse_hhmm(row.open_time.as_deref()),
            close_time: parse_hhmm(row.close_time.as_deref()),
        };
    }
    Ok(Some(week))
}

pub async fn save_schedule(
    tx: &mut Transaction<'_, Sqlite>,
    shop_id: &str,
    week: &WeeklySchedule,
) -> Result<(), sqlx::Error> {
    for day in DayOfWeek::ALL {
        let entry = week.day(day);
        sqlx::query(
            "INSERT INTO shop_schedules (shop_id, day_of_week, is_open, open_time, close_time)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(shop_id, day_of_week) DO UPDATE SET
                is_open = excluded.is_open,
                open_time = excluded.open_time,
                close_time = excluded.close_time",
        )
        .bind(shop_id)
        .bind(day.as_str())
        .bind(entry.is_open)
        .bind(entry.open_time.map(|t| t.format(hhmm::FORMAT).to_string()))
        .bind(entry.close_time.map(|t| t.format(hhmm::FORMAT).to_string()))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

// ── Booking reads ──

pub async fn booking(db: &SqlitePool, id: &str) -> Result<Option<Booking>, sqlx::Error> {
    sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await
}

pub async fn booking_by_order(db: &SqlitePool, order_id: &str) -> Result<Option<Booking>, sqlx::Error> {
    sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE order_id = ?")
        .bind(order_id)
        .fetch_optional(db)
        .await
}

pub async fn confirmed_by_qr(
    db: &SqlitePool,
    customer_id: &str,
    token: &str,
) -> Result<Option<Booking>, sqlx::Error> {
    sqlx::query_as::<_, Booking>(
        "SELECT * FROM bookings
         WHERE customer_id = ? AND qr_code_token = ? AND status = 'confirmed'",
    )
    .bind(customer_id)
    .bind(token)
    .fetch_optional(db)
    .await
}

pub async fn confirmed_by_pin(
    db: &SqlitePool,
    customer_id: &str,
    shop_id: &str,
    pin: &str,
) -> Result<Option<Booking>, sqlx::Error> {
    sqlx::query_as::<_, Booking>(
        "SELECT * FROM bookings
         WHERE customer_id = ? AND shop_id = ? AND check_in_code = ? AND status = 'confirmed'
         ORDER BY booking_time LIMIT 1",
    )
    .bind(customer_id)
    .bind(shop_id)
    .bind(pin)
    .fetch_optional(db)
    .await
}

pub async fn customer_bookings(db: &SqlitePool, customer_id: &str) -> Result<Vec<Booking>, sqlx::Error> {
    sqlx::query_as::<_, Booking>(
        "SELECT * FROM bookings WHERE customer_id = ? ORDER BY booking_time DESC",
    )
    .bind(customer_id)
    .fetch_all(db)
    .await
}

pub async fn shop_bookings(db: &SqlitePool, shop_id: &str) -> Result<Vec<Booking>, sqlx::Error> {
    sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE shop_id = ? ORDER BY booking_time")
        .bind(shop_id)
        .fetch_all(db)
        .await
}

/// Staff of the shop holding time that overlaps `[start, end)`.
pub async fn busy_staff(
    db: &SqlitePool,
    shop_id: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<HashSet<String>, sqlx::Error> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT staff_id FROM bookings
         WHERE shop_id = ? AND status NOT IN ('cancelled', 'no_show')
           AND booking_time < ? AND end_time > ?",
    )
    .bind(shop_id)
    .bind(end)
    .bind(start)
    .fetch_all(db)
    .await?;
    Ok(ids.into_iter().collect())
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Occupancy {
    pub staff_id: String,
    pub booking_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Staff time held in the shop that touches `[from, to)`.
pub async fn occupancy(
    db: &SqlitePool,
    shop_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<Occupancy>, sqlx::Error> {
    sqlx::query_as::<_, Occupancy>(
        "SELECT staff_id, booking_time, end_time FROM bookings
         WHERE shop_id = ? AND status NOT IN ('cancelled', 'no_show')
           AND booking_time < ? AND end_time > ?",
    )
    .bind(shop_id)
    .bind(to)
    .bind(from)
    .fetch_all(db)
    .await
}

/// Confirmed or unpaid bookings of the shop starting in `[from, to)`.
/// Takes any executor so a schedule change can read inside its own transaction.
pub async fn upcoming_for_shop<'e, E>(
    db: E,
    shop_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<Booking>, sqlx::Error>
where
    E: sqlx::SqliteExecutor<'e>,
{
    sqlx::query_as::<_, Booking>(
        "SELECT * FROM bookings
         WHERE shop_id = ? AND status IN ('confirmed', 'pending_payment')
           AND booking_time >= ? AND booking_time < ?
         ORDER BY booking_time",
    )
    .bind(shop_id)
    .bind(from)
    .bind(to)
    .fetch_all(db)
    .await
}

pub async fn upcoming_for_staff(
    db: &SqlitePool,
    staff_id: &str,
    from: DateTime<Utc>,
) -> Result<Vec<Booking>, sqlx::Error> {
    sqlx::query_as::<_, Booking>(
        "SELECT * FROM bookings
         WHERE staff_id = ? AND status IN ('confirmed', 'pending_payment')
           AND booking_time >= ?
         ORDER BY booking_time",
    )
    .bind(staff_id)
    .bind(from)
    .fetch_all(db)
    .await
}

// ── Automation selections ──

pub async fn stale_unpaid(db: &SqlitePool, created_before: DateTime<Utc>) -> Result<Vec<Booking>, sqlx::Error> {
    sqlx::query_as::<_, Booking>(
        "SELECT * FROM bookings
         WHERE status = 'pending_payment' AND payment_status = 'pending' AND created_at < ?",
    )
    .bind(created_before)
    .fetch_all(db)
    .await
}

pub async fn overdue_confirmed(db: &SqlitePool, starts_before: DateTime<Utc>) -> Result<Vec<Booking>, sqlx::Error> {
    sqlx::query_as::<_, Booking>(
        "SELECT * FROM bookings WHERE status = 'confirmed' AND booking_time < ?",
    )
    .bind(starts_before)
    .fetch_all(db)
    .await
}

pub async fn stale_awaiting(db: &SqlitePool, completed_before: DateTime<Utc>) -> Result<Vec<Booking>, sqlx::Error> {
    sqlx::query_as::<_, Booking>(
        "SELECT * FROM bookings
         WHERE status = 'awaiting_confirmation' AND service_completed_at < ?",
    )
    .bind(completed_before)
    .fetch_all(db)
    .await
}

pub async fn reminders_due(
    db: &SqlitePool,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<Booking>, sqlx::Error> {
    sqlx::query_as::<_, Booking>(
        "SELECT * FROM bookings
         WHERE status = 'confirmed' AND reminder_sent = 0
           AND booking_time >= ? AND booking_time <= ?",
    )
    .bind(from)
    .bind(to)
    .fetch_all(db)
    .await
}

// ── Guarded writes ──

pub struct NewBooking<'a> {
    pub id: &'a str,
    pub customer_id: &'a str,
    pub shop_id: &'a str,
    pub service_id: &'a str,
    pub staff_id: &'a str,
    pub booking_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_price: i64,
    pub order_id: &'a str,
    pub now: DateTime<Utc>,
}

/// Insert in `pending_payment` only if the staff member is active in the
/// shop and free for the whole interval. Returns whether a row was written.
pub async fn insert_if_free(db: &SqlitePool, b: &NewBooking<'_>) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO bookings
            (id, customer_id, shop_id, service_id, staff_id, booking_time, end_time,
             status, payment_status, total_price, order_id, created_at, updated_at)
         SELECT ?, ?, ?, ?, ?, ?, ?, 'pending_payment', 'pending', ?, ?, ?, ?
         WHERE EXISTS (SELECT 1 FROM staff WHERE id = ? AND shop_id = ? AND is_active = 1)
           AND NOT EXISTS (
               SELECT 1 FROM bookings
               WHERE staff_id = ? AND status NOT IN ('cancelled', 'no_show')
                 AND booking_time < ? AND end_time > ?
           )",
    )
    .bind(b.id)
    .bind(b.customer_id)
    .bind(b.shop_id)
    .bind(b.service_id)
    .bind(b.staff_id)
    .bind(b.booking_time)
    .bind(b.end_time)
    .bind(b.total_price)
    .bind(b.order_id)
    .bind(b.now)
    .bind(b.now)
    .bind(b.staff_id)
    .bind(b.shop_id)
    .bind(b.staff_id)
    .bind(b.end_time)
    .bind(b.booking_time)
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn delete_booking(db: &SqlitePool, id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM bookings WHERE id = ? AND status = 'pending_payment'")
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn attach_payment(
    db: &SqlitePool,
    id: &str,
    token: &str,
    redirect_url: &str,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE bookings SET payment_token = ?, payment_url = ?, updated_at = ? WHERE id = ?")
        .bind(token)
        .bind(redirect_url)
        .bind(now)
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn mark_paid(
    db: &SqlitePool,
    id: &str,
    pin: &str,
    qr_token: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE bookings
         SET status = 'confirmed', payment_status = 'paid', paid_at = ?,
             check_in_code = ?, qr_code_token = ?, updated_at = ?
         WHERE id = ? AND status = 'pending_payment'",
    )
    .bind(now)
    .bind(pin)
    .bind(qr_token)
    .bind(now)
    .bind(id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Unpaid booking closed by the gateway or the expiry sweep.
pub async fn close_unpaid(
    db: &SqlitePool,
    id: &str,
    payment_status: PaymentStatus,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE bookings SET status = 'cancelled', payment_status = ?, updated_at = ?
         WHERE id = ? AND status = 'pending_payment'",
    )
    .bind(payment_status)
    .bind(now)
    .bind(id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_checked_in(
    db: &SqlitePool,
    id: &str,
    method: CheckInMethod,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE bookings SET status = 'checked_in', checked_in_at = ?, check_in_method = ?, updated_at = ?
         WHERE id = ? AND status = 'confirmed'",
    )
    .bind(now)
    .bind(method)
    .bind(now)
    .bind(id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_no_show(db: &SqlitePool, id: &str, now: DateTime<Utc>) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE bookings SET status = 'no_show', updated_at = ? WHERE id = ? AND status = 'confirmed'",
    )
    .bind(now)
    .bind(id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_started(db: &SqlitePool, id: &str, now: DateTime<Utc>) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE bookings SET status = 'in_progress', service_started_at = ?, updated_at = ?
         WHERE id = ? AND status = 'checked_in'",
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_service_done(db: &SqlitePool, id: &str, now: DateTime<Utc>) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE bookings SET status = 'awaiting_confirmation', service_completed_at = ?, updated_at = ?
         WHERE id = ? AND status = 'in_progress'",
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_completed(
    db: &SqlitePool,
    id: &str,
    automatic: bool,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE bookings SET status = 'completed', customer_confirmed_at = ?, auto_confirmed = ?, updated_at = ?
         WHERE id = ? AND status = 'awaiting_confirmation'",
    )
    .bind(now)
    .bind(automatic)
    .bind(now)
    .bind(id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_reminded(db: &SqlitePool, id: &str, now: DateTime<Utc>) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE bookings SET reminder_sent = 1, updated_at = ?
         WHERE id = ? AND status = 'confirmed' AND reminder_sent = 0",
    )
    .bind(now)
    .bind(id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub struct Reschedule<'a> {
    pub id: &'a str,
    pub staff_id: &'a str,
    pub booking_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub pin: &'a str,
    pub qr_token: &'a str,
    pub reason: &'a str,
    pub now: DateTime<Utc>,
}

/// Move a confirmed, never-rescheduled booking if its staff member is free
/// at the new time. The original start is kept from the first move only.
pub async fn reschedule_if_free(db: &SqlitePool, r: &Reschedule<'_>) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE bookings
         SET original_booking_time = COALESCE(original_booking_time, booking_time),
             booking_time = ?, end_time = ?,
             reschedule_count = reschedule_count + 1, reschedule_reason = ?,
             check_in_code = ?, qr_code_token = ?, reminder_sent = 0, updated_at = ?
         WHERE id = ? AND status = 'confirmed' AND reschedule_count = 0
           AND NOT EXISTS (
               SELECT 1 FROM bookings other
               WHERE other.staff_id = ? AND other.id != ?
                 AND other.status NOT IN ('cancelled', 'no_show')
                 AND other.booking_time < ? AND other.end_time > ?
           )",
    )
    .bind(r.booking_time)
    .bind(r.end_time)
    .bind(r.reason)
    .bind(r.pin)
    .bind(r.qr_token)
    .bind(r.now)
    .bind(r.id)
    .bind(r.staff_id)
    .bind(r.id)
    .bind(r.end_time)
    .bind(r.booking_time)
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Move one upcoming booking to another active staff member of the same
/// shop, only if that member is free for the booking's interval.
pub async fn reassign_if_free(
    db: &SqlitePool,
    booking_id: &str,
    from_staff: &str,
    to_staff: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE bookings SET staff_id = ?, updated_at = ?
         WHERE id = ? AND staff_id = ? AND status IN ('confirmed', 'pending_payment')
           AND EXISTS (
               SELECT 1 FROM staff s
               WHERE s.id = ? AND s.is_active = 1 AND s.shop_id = bookings.shop_id
           )
           AND NOT EXISTS (
               SELECT 1 FROM bookings other
               WHERE other.staff_id = ? AND other.id != bookings.id
                 AND other.status NOT IN ('cancelled', 'no_show')
                 AND other.booking_time < bookings.end_time
                 AND other.end_time > bookings.booking_time
           )",
    )
    .bind(to_staff)
    .bind(now)
    .bind(booking_id)
    .bind(from_staff)
    .bind(to_staff)
    .bind(to_staff)
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}
