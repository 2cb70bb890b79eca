//! Calendar math for schedules: period keys, anchors and occurrences.
//!
//! A period is one calendar day, ISO week or calendar month. Every period
//! holds exactly one anchor instant, so "fired for this key" and "fired for
//! this anchor" are the same thing.

use chrono::{Datelike, Days, NaiveDate, NaiveDateTime};

use crate::worker::descriptor::Schedule;

/// One firing of a schedule: the period it belongs to and its anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Occurrence {
    pub calendar_key: String,
    pub fire_at: NaiveDateTime,
}

impl Schedule {
    /// Calendar key of the period containing `date`.
    pub fn period_key(&self, date: NaiveDate) -> String {
        match self {
            Schedule::Daily { .. } => date.format("%Y-%m-%d").to_string(),
            Schedule::Weekly { .. } => {
                let week = date.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            Schedule::Monthly { .. } => date.format("%Y-%m").to_string(),
        }
    }

    /// Anchor instant of the period containing `date`.
    pub fn anchor_in_period(&self, date: NaiveDate) -> NaiveDateTime {
        let day = match *self {
            Schedule::Daily { .. } => date,
            Schedule::Weekly { weekday, .. } => {
                let offset = i64::from(weekday.num_days_from_monday())
                    - i64::from(date.weekday().num_days_from_monday());
                shift_days(date, offset)
            }
            Schedule::Monthly { day, .. } => {
                let clamped = day.clamp(1, last_day_of_month(date));
                date.with_day(clamped).unwrap_or(date)
            }
        };
        day.and_time(self.at())
    }

    /// The most recent occurrence whose anchor is at or before `now`.
    pub fn latest_occurrence(&self, now: NaiveDateTime) -> Occurrence {
        let today = now.date();
        let anchor = self.anchor_in_period(today);
        if anchor <= now {
            return Occurrence {
                calendar_key: self.period_key(today),
                fire_at: anchor,
            };
        }
        let previous = self.previous_period(today);
        Occurrence {
            calendar_key: self.period_key(previous),
            fire_at: self.anchor_in_period(previous),
        }
    }

    /// Occurrence of the period containing `now`, whether or not it has passed.
    pub fn current_occurrence(&self, now: NaiveDateTime) -> Occurrence {
        let today = now.date();
        Occurrence {
            calendar_key: self.period_key(today),
            fire_at: self.anchor_in_period(today),
        }
    }

    /// First anchor strictly after `now`.
    pub fn next_fire_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        let anchor = self.anchor_in_period(now.date());
        if anchor > now {
            return anchor;
        }
        self.anchor_in_period(self.next_period(now.date()))
    }

    /// Some date inside the period before the one containing `date`.
    fn previous_period(&self, date: NaiveDate) -> NaiveDate {
        match self {
            Schedule::Daily { .. } => shift_days(date, -1),
            Schedule::Weekly { .. } => shift_days(date, -7),
            Schedule::Monthly { .. } => shift_days(first_of_month(date), -1),
        }
    }

    /// Some date inside the period after the one containing `date`.
    fn next_period(&self, date: NaiveDate) -> NaiveDate {
        match self {
            Schedule::Daily { .. } => shift_days(date, 1),
            Schedule::Weekly { .. } => shift_days(date, 7),
            Schedule::Monthly { .. } => shift_days(first_of_month(date), 32),
        }
    }
}

fn shift_days(date: NaiveDate, days: i64) -> NaiveDate {
    let shifted = if days >= 0 {
        date.checked_add_days(Days::new(days.unsigned_abs()))
    } else {
        date.checked_sub_days(Days::new(days.unsigned_abs()))
    };
    shifted.unwrap_or(date)
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn last_day_of_month(date: NaiveDate) -> u32 {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}
