use chrono::{Duration, NaiveDate};

/// Cadence tiers: younger items are re-polled more often. Tier boundaries are
/// in whole days since publication.
pub const MIN_TIER: i32 = 1;
pub const MAX_TIER: i32 = 6;

pub fn tier_for_age(age_days: i64) -> i32 {
  if age_days <= 7 {
    1
  } else if age_days <= 30 {
    2
  } else if age_days <= 90 {
    3
  } else if age_days <= 180 {
    4
  } else if age_days <= 365 {
    5
  } else {
    6
  }
}

/// Re-poll interval for a tier. Unknown tiers fall back to the slowest
/// cadence so a corrupted record never floods the scheduler.
pub fn frequency_days(tier: i32) -> i64 {
  match tier {
    1 => 1,
    2 => 2,
    3 => 3,
    4 => 7,
    5 => 14,
    _ => 30,
  }
}

pub fn age_days(published_at: NaiveDate, on: NaiveDate) -> i64 {
  (on - published_at).num_days().max(0)
}

/// Invariant: next_track_date = last_tracked_date + frequency(tier).
pub fn next_track_date(last_tracked: NaiveDate, tier: i32) -> NaiveDate {
  last_tracked + Duration::days(frequency_days(tier))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
  }

  #[test]
  fn frequency_table_matches_fixed_cadences() {
    assert_eq!(frequency_days(1), 1);
    assert_eq!(frequency_days(2), 2);
    assert_eq!(frequency_days(3), 3);
    assert_eq!(frequency_days(4), 7);
    assert_eq!(frequency_days(5), 14);
    assert_eq!(frequency_days(6), 30);
  }

  #[test]
  fn tier_boundaries_are_inclusive_on_the_low_side() {
    assert_eq!(tier_for_age(0), 1);
    assert_eq!(tier_for_age(7), 1);
    assert_eq!(tier_for_age(8), 2);
    assert_eq!(tier_for_age(30), 2);
    assert_eq!(tier_for_age(31), 3);
    assert_eq!(tier_for_age(90), 3);
    assert_eq!(tier_for_age(91), 4);
    assert_eq!(tier_for_age(180), 4);
    assert_eq!(tier_for_age(181), 5);
    assert_eq!(tier_for_age(365), 5);
    assert_eq!(tier_for_age(366), 6);
    assert_eq!(tier_for_age(4000), 6);
  }

  #[test]
  fn age_days_floors_future_publish_dates_to_zero() {
    assert_eq!(age_days(d(2026, 3, 10), d(2026, 3, 8)), 0);
    assert_eq!(age_days(d(2026, 3, 1), d(2026, 3, 8)), 7);
  }

  #[test]
  fn age_is_monotonic_across_observation_dates() {
    let published = d(2026, 1, 15);
    let mut prev = age_days(published, d(2026, 1, 10));
    for offset in 0..60 {
      let obs = d(2026, 1, 10) + Duration::days(offset);
      let age = age_days(published, obs);
      assert!(age >= prev);
      prev = age;
    }
  }

  #[test]
  fn next_track_date_adds_tier_frequency() {
    assert_eq!(next_track_date(d(2026, 1, 1), 1), d(2026, 1, 2));
    assert_eq!(next_track_date(d(2026, 1, 1), 4), d(2026, 1, 8));
    assert_eq!(next_track_date(d(2026, 1, 1), 6), d(2026, 1, 31));
  }

  #[test]
  fn unknown_tier_defaults_to_monthly() {
    assert_eq!(frequency_days(0), 30);
    assert_eq!(frequency_days(99), 30);
  }
}
