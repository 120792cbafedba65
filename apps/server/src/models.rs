use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

// ── Booking lifecycle ──

/// Lifecycle state of a booking. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum BookingStatus {
    PendingPayment,
    Confirmed,
    CheckedIn,
    InProgress,
    AwaitingConfirmation,
    Completed,
    Cancelled,
    NoShow,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::PendingPayment => "pending_payment",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::CheckedIn => "checked_in",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::AwaitingConfirmation => "awaiting_confirmation",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
        }
    }

    /// No outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Completed | BookingStatus::Cancelled | BookingStatus::NoShow
        )
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Expired,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CheckInMethod {
    QrCode,
    Pin,
}

// ── Database models ──

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Booking {
    pub id: String,
    pub customer_id: String,
    pub shop_id: String,
    pub service_id: String,
    pub staff_id: String,
    pub booking_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub total_price: i64,
    pub order_id: Option<String>,
    pub payment_token: Option<String>,
    pub payment_url: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub check_in_code: Option<String>,
    pub qr_code_token: Option<String>,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub check_in_method: Option<CheckInMethod>,
    pub service_started_at: Option<DateTime<Utc>>,
    pub service_completed_at: Option<DateTime<Utc>>,
    pub customer_confirmed_at: Option<DateTime<Utc>>,
    pub auto_confirmed: bool,
    pub original_booking_time: Option<DateTime<Utc>>,
    pub reschedule_count: i64,
    pub reschedule_reason: Option<String>,
    pub reminder_sent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Shop {
    pub id: String,
    pub owner_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Service {
    pub id: String,
    pub shop_id: String,
    pub name: String,
    pub price: i64,
    pub duration_minutes: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Staff {
    pub id: String,
    pub shop_id: String,
    pub name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Customer {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

// ── Weekly schedule ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl DayOfWeek {
    pub const ALL: [DayOfWeek; 7] = [
        DayOfWeek::Monday,
        DayOfWeek::Tuesday,
        DayOfWeek::Wednesday,
        DayOfWeek::Thursday,
        DayOfWeek::Friday,
        DayOfWeek::Saturday,
        DayOfWeek::Sunday,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DayOfWeek::Monday => "monday",
            DayOfWeek::Tuesday => "tuesday",
            DayOfWeek::Wednesday => "wednesday",
            DayOfWeek::Thursday => "thursday",
            DayOfWeek::Friday => "friday",
            DayOfWeek::Saturday => "saturday",
            DayOfWeek::Sunday => "sunday",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        DayOfWeek::ALL.into_iter().find(|d| d.as_str() == s)
    }
}

impl From<Weekday> for DayOfWeek {
    fn from(day: Weekday) -> Self {
        match day {
            Weekday::Mon => DayOfWeek::Monday,
            Weekday::Tue => DayOfWeek::Tuesday,
            Weekday::Wed => DayOfWeek::Wednesday,
            Weekday::Thu => DayOfWeek::Thursday,
            Weekday::Fri => DayOfWeek::Friday,
            Weekday::Sat => DayOfWeek::Saturday,
            Weekday::Sun => DayOfWeek::Sunday,
        }
    }
}

/// Opening hours for one day. Times are shop-local `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DaySchedule {
    pub is_open: bool,
    #[serde(default, with = "hhmm")]
    pub open_time: Option<NaiveTime>,
    #[serde(default, with = "hhmm")]
    pub close_time: Option<NaiveTime>,
}

impl DaySchedule {
    pub fn closed() -> Self {
        Self::default()
    }

    pub fn open(open_time: NaiveTime, close_time: NaiveTime) -> Self {
        Self {
            is_open: true,
            open_time: Some(open_time),
            close_time: Some(close_time),
        }
    }

    /// The open window, or `None` when the day is closed.
    pub fn window(&self) -> Option<(NaiveTime, NaiveTime)> {
        match (self.is_open, self.open_time, self.close_time) {
            (true, Some(open), Some(close)) => Some((open, close)),
            _ => None,
        }
    }
}

/// Fixed seven-day opening hours of a shop.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WeeklySchedule {
    #[serde(default)]
    pub monday: DaySchedule,
    #[serde(default)]
    pub tuesday: DaySchedule,
    #[serde(default)]
    pub wednesday: DaySchedule,
    #[serde(default)]
    pub thursday: DaySchedule,
    #[serde(default)]
    pub friday: DaySchedule,
    #[serde(default)]
    pub saturday: DaySchedule,
    #[serde(default)]
    pub sunday: DaySchedule,
}

impl WeeklySchedule {
    pub fn day(&self, day: DayOfWeek) -> &DaySchedule {
        match day {
            DayOfWeek::Monday => &self.monday,
            DayOfWeek::Tuesday => &self.tuesday,
            DayOfWeek::Wednesday => &self.wednesday,
            DayOfWeek::Thursday => &self.thursday,
            DayOfWeek::Friday => &self.friday,
            DayOfWeek::Saturday => &self.saturday,
            DayOfWeek::Sunday => &self.sunday,
        }
    }

    pub fn day_mut(&mut self, day: DayOfWeek) -> &mut DaySchedule {
        match day {
            DayOfWeek::Monday => &mut self.monday,
            DayOfWeek::Tuesday => &mut self.tuesday,
            DayOfWeek::Wednesday => &mut self.wednesday,
            DayOfWeek::Thursday => &mut self.thursday,
            DayOfWeek::Friday => &mut self.friday,
            DayOfWeek::Saturday => &mut self.saturday,
            DayOfWeek::Sunday => &mut self.sunday,
        }
    }

    /// Every day uses the same window.
    pub fn uniform(day: DaySchedule) -> Self {
        Self {
            monday: day,
            tuesday: day,
            wednesday: day,
            thursday: day,
            friday: day,
            saturday: day,
            sunday: day,
        }
    }

    /// Reject open days without both times or with `open >= close`.
    pub fn validate(&self) -> Result<(), String> {
        for day in DayOfWeek::ALL {
            let schedule = self.day(day);
            if !schedule.is_open {
                continue;
            }
            match (schedule.open_time, schedule.close_time) {
                (Some(open), Some(close)) if open < close => {}
                (Some(_), Some(_)) => {
                    return Err(format!("{}: open time must be before close time", day.as_str()))
                }
                _ => {
                    return Err(format!(
                        "{}: open days need both open_time and close_time",
                        day.as_str()
                    ))
                }
            }
        }
        Ok(())
    }
}

/// Serde for `Option<NaiveTime>` as `"HH:MM"`.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(value: &Option<NaiveTime>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(t) => s.serialize_str(&t.format(FORMAT).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveTime>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        match raw.as_deref() {
            None | Some("") => Ok(None),
            Some(s) => NaiveTime::parse_from_str(s, FORMAT)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

// ── API request/response types ──

#[derive(Debug, Deserialize)]
pub struct CreateBookingRequest {
    pub shop_id: String,
    pub service_id: String,
    pub staff_id: Option<String>,
    pub booking_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct QrCheckInRequest {
    pub qr_token: String,
}

#[derive(Debug, Deserialize)]
pub struct PinCheckInRequest {
    pub shop_id: String,
    pub pin: String,
}

#[derive(Debug, Deserialize)]
pub struct RescheduleRequest {
    pub new_booking_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub shop_id: String,
    /// Shop-local date, `YYYY-MM-DD`.
    pub date: String,
    /// Shop-local time, `HH:MM`. When present, report busy staff at that time.
    pub time: Option<String>,
    pub service_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleChangeRequest {
    pub schedule: WeeklySchedule,
    #[serde(default)]
    pub force_update: bool,
}

#[derive(Debug, Deserialize)]
pub struct ReassignRequest {
    pub new_staff_id: String,
}

/// Inbound payment-status notification from the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentNotification {
    pub order_id: String,
    pub transaction_status: String,
    pub fraud_status: Option<String>,
    pub status_code: Option<String>,
    pub gross_amount: Option<String>,
    pub signature_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentRedirect {
    pub token: String,
    pub redirect_url: String,
}

#[derive(Debug, Serialize)]
pub struct CreateBookingResponse {
    pub booking: BookingView,
    pub payment: PaymentRedirect,
}

/// What a caller may do next, derived only from the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BookingFlags {
    pub can_pay: bool,
    pub can_check_in: bool,
    pub can_start: bool,
    pub can_complete: bool,
    pub can_confirm: bool,
    pub can_review: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookingView {
    #[serde(flatten)]
    pub booking: Booking,
    #[serde(flatten)]
    pub flags: BookingFlags,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            kind: None,
            reason: None,
            details: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
            kind: None,
            reason: None,
            details: None,
        }
    }
}
