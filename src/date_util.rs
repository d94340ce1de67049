use chrono::{Datelike, Duration, NaiveDate, Weekday};

/// Number of calendar days in the inclusive range [start, end].
pub fn days_inclusive(start: NaiveDate, end: NaiveDate) -> i64 {
    (end - start).num_days() + 1
}

pub fn is_weekend(d: NaiveDate) -> bool {
    matches!(d.weekday(), Weekday::Sat | Weekday::Sun)
}

/// A school day is a weekday that is not listed as a holiday.
pub fn is_school_day(d: NaiveDate, holidays: &[NaiveDate]) -> bool {
    !is_weekend(d) && !holidays.contains(&d)
}

/// First school day in [start, end], if any.
pub fn first_school_day(start: NaiveDate, end: NaiveDate, holidays: &[NaiveDate]) -> Option<NaiveDate> {
    let mut d = start;
    while d <= end {
        if is_school_day(d, holidays) {
            return Some(d);
        }
        d += Duration::days(1);
    }
    None
}

/// Last school day in [start, end], if any.
pub fn last_school_day(start: NaiveDate, end: NaiveDate, holidays: &[NaiveDate]) -> Option<NaiveDate> {
    let mut d = end;
    while d >= start {
        if is_school_day(d, holidays) {
            return Some(d);
        }
        d -= Duration::days(1);
    }
    None
}

/// Count of school days in [start, end].
pub fn school_days_between(start: NaiveDate, end: NaiveDate, holidays: &[NaiveDate]) -> i64 {
    let mut count = 0;
    let mut d = start;
    while d <= end {
        if is_school_day(d, holidays) {
            count += 1;
        }
        d += Duration::days(1);
    }
    count
}
