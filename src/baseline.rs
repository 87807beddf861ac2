use std::collections::BTreeMap;

/// Age at which channels are compared against the global curve.
pub const REFERENCE_AGE_DAYS: i32 = 7;
/// Envelope is only maintained for the first ten years of an item's life.
pub const MAX_AGE_DAYS: i32 = 3650;
/// Ages with fewer samples than this are omitted from the envelope entirely.
pub const MIN_ENVELOPE_SAMPLES: usize = 10;
/// Groups with fewer reference-age samples fall back to a neutral multiplier.
pub const MIN_GROUP_SAMPLES: usize = 3;
/// Centered smoothing window: +/- 3 days, a 7-day moving average.
pub const SMOOTHING_RADIUS_DAYS: i32 = 3;
/// Peer-rolling strategy looks at up to this many prior items, unbounded by
/// date. Windowed variants (30 days, 1 year) systematically failed for groups
/// with sparse publishing cadence and were retired.
pub const ROLLING_PEER_COUNT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvelopePoint {
  pub age_days: i32,
  pub p10: f64,
  pub p25: f64,
  pub p50: f64,
  pub p75: f64,
  pub p90: f64,
  pub sample_count: i64,
}

/// Sort-and-index percentile with linear interpolation between adjacent
/// ranks (index = q * (n - 1)). Input must be sorted ascending and non-empty.
fn percentile_sorted(sorted: &[f64], q: f64) -> f64 {
  let n = sorted.len();
  if n == 1 {
    return sorted[0];
  }
  let idx = q * ((n - 1) as f64);
  let lo = idx.floor() as usize;
  let hi = idx.ceil() as usize;
  if lo == hi {
    return sorted[lo];
  }
  let frac = idx - (lo as f64);
  sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Global expected-value curve: per-age percentile bands over non-excluded
/// snapshot metrics, thin ages dropped, then a centered 7-day moving average
/// over each retained percentile series. Window membership is by age
/// distance, so omitted ages contribute nothing rather than zeros.
pub fn compute_envelope(samples: &[(i32, i64)]) -> Vec<EnvelopePoint> {
  let mut by_age: BTreeMap<i32, Vec<f64>> = BTreeMap::new();
  for (age, metric) in samples {
    if *age < 0 || *age > MAX_AGE_DAYS {
      continue;
    }
    by_age.entry(*age).or_default().push(*metric as f64);
  }

  let mut raw: Vec<EnvelopePoint> = Vec::new();
  for (age, mut values) in by_age {
    if values.len() < MIN_ENVELOPE_SAMPLES {
      continue;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    raw.push(EnvelopePoint {
      age_days: age,
      p10: percentile_sorted(&values, 0.10),
      p25: percentile_sorted(&values, 0.25),
      p50: percentile_sorted(&values, 0.50),
      p75: percentile_sorted(&values, 0.75),
      p90: percentile_sorted(&values, 0.90),
      sample_count: values.len() as i64,
    });
  }

  smooth_envelope(&raw)
}

fn smooth_envelope(raw: &[EnvelopePoint]) -> Vec<EnvelopePoint> {
  let mut out = Vec::with_capacity(raw.len());
  for point in raw {
    let mut p10 = 0.0;
    let mut p25 = 0.0;
    let mut p50 = 0.0;
    let mut p75 = 0.0;
    let mut p90 = 0.0;
    let mut n = 0usize;
    for other in raw {
      if (other.age_days - point.age_days).abs() <= SMOOTHING_RADIUS_DAYS {
        p10 += other.p10;
        p25 += other.p25;
        p50 += other.p50;
        p75 += other.p75;
        p90 += other.p90;
        n += 1;
      }
    }
    let n = n as f64;
    out.push(EnvelopePoint {
      age_days: point.age_days,
      p10: p10 / n,
      p25: p25 / n,
      p50: p50 / n,
      p75: p75 / n,
      p90: p90 / n,
      sample_count: point.sample_count,
    });
  }
  out
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupBaseline {
  pub group_id: String,
  pub reference_metric: f64,
  pub multiplier: f64,
  pub sample_count: i64,
  pub confidence: f64,
}

/// Channel-relative multiplier against the global curve at the reference age.
/// Thin groups are treated as average rather than scored on noise.
pub fn compute_group_baseline(
  group_id: &str,
  reference_metrics: &[f64],
  envelope_p50_at_reference: f64,
) -> GroupBaseline {
  let sample_count = reference_metrics.len();
  let confidence = ((sample_count as f64) / 20.0).min(1.0);

  if sample_count < MIN_GROUP_SAMPLES || envelope_p50_at_reference <= 0.0 {
    return GroupBaseline {
      group_id: group_id.to_string(),
      reference_metric: 0.0,
      multiplier: 1.0,
      sample_count: sample_count as i64,
      confidence,
    };
  }

  let reference_metric =
    reference_metrics.iter().sum::<f64>() / (sample_count as f64);
  GroupBaseline {
    group_id: group_id.to_string(),
    reference_metric,
    multiplier: reference_metric / envelope_p50_at_reference,
    sample_count: sample_count as i64,
    confidence,
  }
}

/// Peer baseline: mean metric of up to the 10 most recent prior items in the
/// same group. `prior_metrics_newest_first` must be ordered newest first and
/// contain only items published before the item being scored. `None` means the
/// item is the group's first and gets ratio 1.0 by definition, never computed.
pub fn rolling_peer_baseline(prior_metrics_newest_first: &[i64]) -> Option<f64> {
  if prior_metrics_newest_first.is_empty() {
    return None;
  }
  let taken: Vec<f64> = prior_metrics_newest_first
    .iter()
    .take(ROLLING_PEER_COUNT)
    .map(|m| *m as f64)
    .collect();
  Some(taken.iter().sum::<f64>() / (taken.len() as f64))
}

/// Ratio under the peer-rolling strategy. First item in a group is neutral.
pub fn peer_ratio(metric: i64, prior_metrics_newest_first: &[i64]) -> f64 {
  match rolling_peer_baseline(prior_metrics_newest_first) {
    Some(baseline) if baseline > 0.0 => (metric as f64) / baseline,
    Some(_) => 1.0,
    None => 1.0,
  }
}

/// Two baseline policies for the same problem: global-normalized (percentile
/// envelope x group multiplier) and peer-normalized (rolling average of the
/// group's own recent items). Selected per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BaselineStrategy {
  #[default]
  GlobalEnvelope,
  PeerRolling,
}

impl BaselineStrategy {
  pub fn from_env() -> Self {
    match std::env::var("BASELINE_STRATEGY").as_deref() {
      Ok("peer_rolling") => BaselineStrategy::PeerRolling,
      _ => BaselineStrategy::GlobalEnvelope,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      BaselineStrategy::GlobalEnvelope => "global_envelope",
      BaselineStrategy::PeerRolling => "peer_rolling",
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn flat_samples(age: i32, count: usize, metric: i64) -> Vec<(i32, i64)> {
    (0..count).map(|_| (age, metric)).collect()
  }

  #[test]
  fn percentile_interpolates_between_ranks() {
    let values = vec![10.0, 20.0, 30.0, 40.0, 50.0];
    assert_eq!(percentile_sorted(&values, 0.50), 30.0);
    assert_eq!(percentile_sorted(&values, 0.25), 20.0);
    // q=0.10 over 5 values: index 0.4 -> 10 + 0.4 * 10.
    assert!((percentile_sorted(&values, 0.10) - 14.0).abs() < 1e-9);
    assert!((percentile_sorted(&values, 0.90) - 46.0).abs() < 1e-9);
  }

  #[test]
  fn thin_ages_are_omitted_not_zeroed() {
    let mut samples = flat_samples(3, 10, 500);
    samples.extend(flat_samples(4, 9, 900));
    let envelope = compute_envelope(&samples);
    assert_eq!(envelope.len(), 1);
    assert_eq!(envelope[0].age_days, 3);
    assert_eq!(envelope[0].sample_count, 10);
  }

  #[test]
  fn ages_outside_tracked_range_are_ignored() {
    let mut samples = flat_samples(-1, 20, 100);
    samples.extend(flat_samples(MAX_AGE_DAYS + 1, 20, 100));
    samples.extend(flat_samples(10, 20, 100));
    let envelope = compute_envelope(&samples);
    assert_eq!(envelope.len(), 1);
    assert_eq!(envelope[0].age_days, 10);
  }

  #[test]
  fn percentile_bands_stay_ordered_after_smoothing() {
    let mut samples = Vec::new();
    for age in 0..14 {
      for i in 0..40 {
        // Spread of values per age, with a noisy bump every third day.
        let bump = if age % 3 == 0 { 400 } else { 0 };
        samples.push((age, 100 + (i * 25) + bump));
      }
    }
    let envelope = compute_envelope(&samples);
    assert_eq!(envelope.len(), 14);
    for point in envelope {
      assert!(point.p10 <= point.p25);
      assert!(point.p25 <= point.p50);
      assert!(point.p50 <= point.p75);
      assert!(point.p75 <= point.p90);
    }
  }

  #[test]
  fn smoothing_dampens_single_day_spikes() {
    let mut samples = Vec::new();
    for age in 0..7 {
      let metric = if age == 3 { 10_000 } else { 1000 };
      samples.extend(flat_samples(age, 12, metric));
    }
    let envelope = compute_envelope(&samples);
    let day3 = envelope.iter().find(|p| p.age_days == 3).unwrap();
    // 7-day centered window over a single spike: (6*1000 + 10000) / 7.
    assert!((day3.p50 - (16_000.0 / 7.0)).abs() < 1e-6);
  }

  #[test]
  fn smoothing_window_is_by_age_distance_not_position() {
    // Ages 0 and 10 both retained; they are farther than the radius apart,
    // so each smooths only with itself.
    let mut samples = flat_samples(0, 10, 100);
    samples.extend(flat_samples(10, 10, 900));
    let envelope = compute_envelope(&samples);
    assert_eq!(envelope[0].p50, 100.0);
    assert_eq!(envelope[1].p50, 900.0);
  }

  #[test]
  fn envelope_recompute_is_idempotent_on_unchanged_input() {
    let mut samples = Vec::new();
    for age in 0..30 {
      for i in 0..15 {
        samples.push((age, 50 + age as i64 * 7 + i * 3));
      }
    }
    let first = compute_envelope(&samples);
    let second = compute_envelope(&samples);
    assert_eq!(first, second);
  }

  #[test]
  fn group_baseline_divides_by_reference_p50() {
    let metrics = vec![1800.0, 2000.0, 2200.0];
    let baseline = compute_group_baseline("ch-1", &metrics, 1000.0);
    assert!((baseline.multiplier - 2.0).abs() < 1e-9);
    assert_eq!(baseline.sample_count, 3);
    assert!((baseline.confidence - 0.15).abs() < 1e-9);
  }

  #[test]
  fn thin_groups_fall_back_to_neutral_multiplier() {
    let baseline = compute_group_baseline("ch-2", &[5000.0, 4000.0], 1000.0);
    assert_eq!(baseline.multiplier, 1.0);
    assert_eq!(baseline.sample_count, 2);
  }

  #[test]
  fn confidence_saturates_at_twenty_samples() {
    let metrics: Vec<f64> = (0..25).map(|i| 1000.0 + i as f64).collect();
    let baseline = compute_group_baseline("ch-3", &metrics, 1000.0);
    assert_eq!(baseline.confidence, 1.0);
  }

  #[test]
  fn rolling_baseline_takes_at_most_ten_newest_priors() {
    // 12 priors; only the first 10 (newest) count.
    let priors: Vec<i64> = vec![100; 10]
      .into_iter()
      .chain(vec![9_999_999; 2])
      .collect();
    let baseline = rolling_peer_baseline(&priors).unwrap();
    assert_eq!(baseline, 100.0);
  }

  #[test]
  fn rolling_baseline_uses_all_priors_when_fewer_than_ten() {
    let baseline = rolling_peer_baseline(&[300, 100]).unwrap();
    assert_eq!(baseline, 200.0);
  }

  #[test]
  fn first_item_in_group_gets_neutral_ratio() {
    assert!(rolling_peer_baseline(&[]).is_none());
    assert_eq!(peer_ratio(12345, &[]), 1.0);
  }

  #[test]
  fn peer_ratio_divides_by_rolling_average() {
    assert!((peer_ratio(300, &[100, 200]) - 2.0).abs() < 1e-9);
  }

  #[test]
  fn peer_ratio_is_neutral_when_priors_all_zero() {
    assert_eq!(peer_ratio(500, &[0, 0, 0]), 1.0);
  }

  #[test]
  fn strategy_labels_are_stable() {
    assert_eq!(BaselineStrategy::GlobalEnvelope.as_str(), "global_envelope");
    assert_eq!(BaselineStrategy::PeerRolling.as_str(), "peer_rolling");
    assert_eq!(BaselineStrategy::default(), BaselineStrategy::GlobalEnvelope);
  }
}
