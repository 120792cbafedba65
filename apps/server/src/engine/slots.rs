use chrono::{DateTime, Duration, NaiveTime, Utc};

/// Bookable start times in `[open, close)`, `interval` minutes apart.
///
/// The sequence never wraps past midnight. A zero interval yields nothing.
#[derive(Debug, Clone)]
pub struct Slots {
    next: Option<NaiveTime>,
    close: NaiveTime,
    step: Duration,
}

impl Iterator for Slots {
    type Item = NaiveTime;

    fn next(&mut self) -> Option<NaiveTime> {
        let current = self.next?;
        if current >= self.close {
            self.next = None;
            return None;
        }
        let (following, wrapped) = current.overflowing_add_signed(self.step);
        self.next = if wrapped == 0 { Some(following) } else { None };
        Some(current)
    }
}

pub fn enumerate_slots(open: NaiveTime, close: NaiveTime, interval_minutes: u32) -> Slots {
    Slots {
        next: (interval_minutes > 0).then_some(open),
        close,
        step: Duration::minutes(i64::from(interval_minutes)),
    }
}

/// Half-open overlap: back-to-back intervals do not collide.
pub fn intervals_overlap<T: PartialOrd>(start_a: T, end_a: T, start_b: T, end_b: T) -> bool {
    start_a < end_b && start_b < end_a
}

pub fn end_time(start: DateTime<Utc>, duration_minutes: i64) -> DateTime<Utc> {
    start + Duration::minutes(duration_minutes)
}

pub fn format_hhmm(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}
