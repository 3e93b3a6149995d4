use chrono::NaiveDate;

/// Billing period immediately before (month, year), rolling over the year
/// boundary: January maps to December of the previous year.
pub fn previous_period(month: u32, year: i32) -> (u32, i32) {
    if month == 1 {
        (12, year - 1)
    } else {
        (month - 1, year)
    }
}

/// Calendar date for `day` of the billing period, e.g. the invoice due date.
pub fn period_date(month: u32, year: i32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
}

#[cfg(test)]
mod tests {
    use super::{period_date, previous_period};

    #[test]
    fn steps_back_one_month() {
        assert_eq!(previous_period(7, 2026), (6, 2026));
        assert_eq!(previous_period(2, 2026), (1, 2026));
        assert_eq!(previous_period(12, 2026), (11, 2026));
    }

    #[test]
    fn january_rolls_into_previous_year() {
        assert_eq!(previous_period(1, 2026), (12, 2025));
        assert_eq!(previous_period(1, 2000), (12, 1999));
    }

    #[test]
    fn builds_the_due_date() {
        let due = period_date(3, 2026, 5).expect("valid date");
        assert_eq!(due.to_string(), "2026-03-05");
        assert!(period_date(13, 2026, 5).is_none());
    }
}
