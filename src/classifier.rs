use tracing::warn;

/// Upper bound of the DECIMAL(8,3) ratio column. Unclamped ratios have
/// overflowed the column in production, so the value saturates instead.
pub const MAX_STORED_RATIO: f64 = 99_999.999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceCategory {
  Viral,
  Outperforming,
  OnTrack,
  Underperforming,
  Poor,
}

impl PerformanceCategory {
  pub fn as_str(&self) -> &'static str {
    match self {
      PerformanceCategory::Viral => "viral",
      PerformanceCategory::Outperforming => "outperforming",
      PerformanceCategory::OnTrack => "on_track",
      PerformanceCategory::Underperforming => "underperforming",
      PerformanceCategory::Poor => "poor",
    }
  }
}

/// Thresholds applied in order; "viral" is strictly greater than 3.0, the
/// rest are inclusive lower bounds.
pub fn categorize(ratio: f64) -> PerformanceCategory {
  if ratio > 3.0 {
    PerformanceCategory::Viral
  } else if ratio >= 1.5 {
    PerformanceCategory::Outperforming
  } else if ratio >= 0.5 {
    PerformanceCategory::OnTrack
  } else if ratio >= 0.2 {
    PerformanceCategory::Underperforming
  } else {
    PerformanceCategory::Poor
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceScore {
  pub ratio: f64,
  pub category: PerformanceCategory,
}

/// Current metric against the expected value (global p50 at the item's age
/// multiplied by the group multiplier). `None` means "no score yet": excluded
/// item, missing envelope entry, or a non-positive expectation. Never an
/// error.
pub fn score_item(
  metric: i64,
  envelope_p50_at_age: Option<f64>,
  group_multiplier: f64,
  is_excluded: bool,
) -> Option<PerformanceScore> {
  if is_excluded {
    return None;
  }

  let p50 = envelope_p50_at_age?;
  let expected = p50 * group_multiplier;
  if expected <= 0.0 {
    return None;
  }

  let raw = (metric as f64) / expected;
  let ratio = clamp_ratio(raw);
  Some(PerformanceScore {
    ratio,
    category: categorize(ratio),
  })
}

pub fn clamp_ratio(raw: f64) -> f64 {
  if !raw.is_finite() || raw > MAX_STORED_RATIO {
    warn!(raw, clamped = MAX_STORED_RATIO, "performance ratio clamped to storage maximum");
    return MAX_STORED_RATIO;
  }
  if raw < 0.0 {
    return 0.0;
  }
  raw
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ratio_exactly_three_is_outperforming_not_viral() {
    assert_eq!(categorize(3.0), PerformanceCategory::Outperforming);
    assert_eq!(categorize(3.0001), PerformanceCategory::Viral);
  }

  #[test]
  fn ratio_exactly_one_point_five_is_outperforming() {
    assert_eq!(categorize(1.5), PerformanceCategory::Outperforming);
    assert_eq!(categorize(1.4999), PerformanceCategory::OnTrack);
  }

  #[test]
  fn remaining_thresholds_are_inclusive_lower_bounds() {
    assert_eq!(categorize(0.5), PerformanceCategory::OnTrack);
    assert_eq!(categorize(0.2), PerformanceCategory::Underperforming);
    assert_eq!(categorize(0.1999), PerformanceCategory::Poor);
    assert_eq!(categorize(0.0), PerformanceCategory::Poor);
  }

  #[test]
  fn scenario_group_multiplier_scales_expected() {
    // Envelope p50 at age 7 is 1000, multiplier 2.0, metric 2100:
    // expected 2000, ratio 1.05, on_track.
    let score = score_item(2100, Some(1000.0), 2.0, false).unwrap();
    assert!((score.ratio - 1.05).abs() < 1e-9);
    assert_eq!(score.category, PerformanceCategory::OnTrack);
  }

  #[test]
  fn excluded_items_never_score() {
    assert!(score_item(2100, Some(1000.0), 2.0, true).is_none());
  }

  #[test]
  fn missing_envelope_entry_means_no_score_yet() {
    assert!(score_item(2100, None, 1.0, false).is_none());
  }

  #[test]
  fn non_positive_expected_means_no_score_yet() {
    assert!(score_item(2100, Some(0.0), 1.0, false).is_none());
    assert!(score_item(2100, Some(1000.0), 0.0, false).is_none());
  }

  #[test]
  fn oversized_ratio_clamps_to_storage_maximum() {
    let score = score_item(i64::MAX, Some(0.001), 1.0, false).unwrap();
    assert_eq!(score.ratio, MAX_STORED_RATIO);
    assert_eq!(score.category, PerformanceCategory::Viral);
  }

  #[test]
  fn clamp_ratio_handles_non_finite_input() {
    assert_eq!(clamp_ratio(f64::INFINITY), MAX_STORED_RATIO);
    assert_eq!(clamp_ratio(f64::NAN), MAX_STORED_RATIO);
    assert_eq!(clamp_ratio(-1.0), 0.0);
    assert_eq!(clamp_ratio(1.25), 1.25);
  }

  #[test]
  fn category_names_match_stored_labels() {
    assert_eq!(PerformanceCategory::OnTrack.as_str(), "on_track");
    assert_eq!(PerformanceCategory::Viral.as_str(), "viral");
  }
}
