use std::collections::HashMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::MySqlPool;
use tracing::info;

use crate::baseline::{
  compute_envelope, compute_group_baseline, peer_ratio, BaselineStrategy, REFERENCE_AGE_DAYS,
  ROLLING_PEER_COUNT,
};
use crate::classifier::{categorize, clamp_ratio, score_item};
use crate::db;
use crate::error::TrackError;

/// Rows written per statement; keeps transactions short and locks bounded.
pub const CHUNK_SIZE: usize = 1000;

/// A `running` guard row older than this is treated as a crashed run.
pub const RUN_STALE_MINUTES: i64 = 30;

pub const RUN_ENVELOPE_FULL: &str = "envelope_full";
pub const RUN_GROUP_BASELINE_FULL: &str = "group_baseline_full";
pub const RUN_SCORE_FULL: &str = "score_full";

/// Batch jobs report partial completion instead of throwing; callers resume
/// on the next trigger.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BatchProgress {
  pub processed: i64,
  pub remaining: i64,
}

fn stale_after() -> Duration {
  Duration::minutes(RUN_STALE_MINUTES)
}

/// A failed pass is the caller's signal; a failed guard release only surfaces
/// when the pass itself succeeded.
fn settle_guarded<T>(
  pass: Result<T, TrackError>,
  release: Result<(), TrackError>,
) -> Result<T, TrackError> {
  match pass {
    Ok(value) => release.map(|()| value),
    Err(err) => Err(err),
  }
}

/// Full rebuild of the global envelope from all non-excluded snapshots.
/// Upserts are keyed by age, then ages that fell below the sample threshold
/// are deleted, so re-running on unchanged snapshots is a no-op.
pub async fn run_envelope_recompute(
  pool: &MySqlPool,
  now: DateTime<Utc>,
) -> Result<BatchProgress, TrackError> {
  if !db::try_begin_run(pool, RUN_ENVELOPE_FULL, now, stale_after()).await? {
    return Err(TrackError::ConcurrentRun {
      kind: RUN_ENVELOPE_FULL.to_string(),
    });
  }

  let result = envelope_pass(pool, now).await;

  // Release the guard even when the pass aborted; a crashed release is
  // covered by the stale threshold.
  let release = db::finish_run(pool, RUN_ENVELOPE_FULL, Utc::now()).await;
  settle_guarded(result, release)
}

async fn envelope_pass(
  pool: &MySqlPool,
  now: DateTime<Utc>,
) -> Result<BatchProgress, TrackError> {
  let samples = db::fetch_envelope_samples(pool).await?;
  let envelope = compute_envelope(&samples);

  // The stored stamp is TIMESTAMP(3); truncate so the retained-row match in
  // the delete below compares equal.
  let stamp = Utc
    .timestamp_millis_opt(now.timestamp_millis())
    .single()
    .unwrap_or(now);

  let mut processed: i64 = 0;
  for chunk in envelope.chunks(CHUNK_SIZE) {
    db::upsert_envelope_points(pool, chunk, stamp).await?;
    processed += chunk.len() as i64;
    info!(processed, total = envelope.len(), "envelope recompute progress");
  }
  let dropped = db::delete_stale_envelope_points(pool, stamp).await?;
  if dropped > 0 {
    info!(dropped, "removed envelope ages below sample threshold");
  }

  Ok(BatchProgress {
    processed,
    remaining: 0,
  })
}

/// Recomputes channel multipliers against the envelope's reference age.
/// Incremental mode restricts input to groups with snapshot activity in the
/// last `INCREMENTAL_ACTIVITY_DAYS`. A missing reference curve aborts before
/// any write: every relative score depends on it.
pub async fn run_group_baseline_recompute(
  pool: &MySqlPool,
  now: DateTime<Utc>,
  incremental: bool,
) -> Result<BatchProgress, TrackError> {
  if !incremental {
    if !db::try_begin_run(pool, RUN_GROUP_BASELINE_FULL, now, stale_after()).await? {
      return Err(TrackError::ConcurrentRun {
        kind: RUN_GROUP_BASELINE_FULL.to_string(),
      });
    }
  }

  let result = group_baseline_pass(pool, now, incremental).await;

  if incremental {
    return result;
  }
  let release = db::finish_run(pool, RUN_GROUP_BASELINE_FULL, Utc::now()).await;
  settle_guarded(result, release)
}

async fn group_baseline_pass(
  pool: &MySqlPool,
  now: DateTime<Utc>,
  incremental: bool,
) -> Result<BatchProgress, TrackError> {
  let reference_p50 = db::fetch_envelope_p50_at(pool, REFERENCE_AGE_DAYS)
    .await?
    .ok_or(TrackError::MissingReferenceCurve {
      age_days: REFERENCE_AGE_DAYS,
    })?;

  let touched_since = incremental.then(|| db::incremental_since(now.date_naive()));
  let rows = db::fetch_reference_metrics_by_group(pool, REFERENCE_AGE_DAYS, touched_since).await?;

  let mut by_group: HashMap<String, Vec<f64>> = HashMap::new();
  for (group_id, metric) in rows {
    by_group.entry(group_id).or_default().push(metric);
  }

  let mut baselines: Vec<_> = by_group
    .into_iter()
    .map(|(group_id, metrics)| compute_group_baseline(&group_id, &metrics, reference_p50))
    .collect();
  baselines.sort_by(|a, b| a.group_id.cmp(&b.group_id));

  let mut processed: i64 = 0;
  for chunk in baselines.chunks(CHUNK_SIZE) {
    db::upsert_group_baselines(pool, chunk).await?;
    processed += chunk.len() as i64;
    info!(processed, total = baselines.len(), "group baseline recompute progress");
  }

  Ok(BatchProgress {
    processed,
    remaining: 0,
  })
}

/// Rescores items under the configured baseline strategy. Full mode walks the
/// whole population behind the run guard; incremental mode only touches items
/// with recent snapshot activity and runs unguarded (it is cheap and
/// idempotent). Each chunk commits independently, so interrupting between
/// chunks leaves consistent state and the next trigger resumes the rest.
pub async fn run_score_recompute(
  pool: &MySqlPool,
  now: DateTime<Utc>,
  incremental: bool,
  strategy: BaselineStrategy,
) -> Result<BatchProgress, TrackError> {
  if !incremental {
    if !db::try_begin_run(pool, RUN_SCORE_FULL, now, stale_after()).await? {
      return Err(TrackError::ConcurrentRun {
        kind: RUN_SCORE_FULL.to_string(),
      });
    }
  }

  let result = score_pass(pool, now, incremental, strategy).await;

  if incremental {
    return result;
  }
  let release = db::finish_run(pool, RUN_SCORE_FULL, Utc::now()).await;
  settle_guarded(result, release)
}

async fn score_pass(
  pool: &MySqlPool,
  now: DateTime<Utc>,
  incremental: bool,
  strategy: BaselineStrategy,
) -> Result<BatchProgress, TrackError> {
  let today = now.date_naive();
  let touched_since = incremental.then(|| db::incremental_since(today));

  let total = db::count_score_candidates(pool, touched_since).await?;

  let p50_by_age = match strategy {
    BaselineStrategy::GlobalEnvelope => db::fetch_envelope_p50_map(pool).await?,
    BaselineStrategy::PeerRolling => HashMap::new(),
  };
  let multipliers = match strategy {
    BaselineStrategy::GlobalEnvelope => db::fetch_group_multipliers(pool).await?,
    BaselineStrategy::PeerRolling => HashMap::new(),
  };

  let mut processed: i64 = 0;
  let mut cursor = String::new();
  loop {
    let page = db::fetch_score_candidates_page(
      pool,
      today,
      touched_since,
      &cursor,
      CHUNK_SIZE as i64,
    )
    .await?;
    if page.is_empty() {
      break;
    }

    for candidate in &page {
      let score = match strategy {
        BaselineStrategy::GlobalEnvelope => {
          let age = i32::try_from(candidate.age_days).unwrap_or(i32::MAX);
          let p50 = p50_by_age.get(&age).copied();
          // Groups without a baseline row are treated as average.
          let multiplier = multipliers.get(&candidate.group_id).copied().unwrap_or(1.0);
          score_item(candidate.current_metric, p50, multiplier, candidate.is_excluded)
            .map(|s| (s.ratio, s.category))
        }
        BaselineStrategy::PeerRolling => {
          if candidate.is_excluded {
            None
          } else {
            let priors = db::fetch_prior_group_metrics(
              pool,
              &candidate.group_id,
              candidate.published_at,
              ROLLING_PEER_COUNT as i64,
            )
            .await?;
            let ratio = clamp_ratio(peer_ratio(candidate.current_metric, &priors));
            Some((ratio, categorize(ratio)))
          }
        }
      };

      db::update_item_score(
        pool,
        &candidate.item_id,
        score.map(|(ratio, category)| (ratio, category.as_str())),
      )
      .await?;
    }

    processed += page.len() as i64;
    cursor = page
      .last()
      .map(|c| c.item_id.clone())
      .unwrap_or_default();
    info!(processed, total, "score recompute progress");
  }

  Ok(BatchProgress {
    processed,
    remaining: (total - processed).max(0),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn chunk_size_is_within_the_bounded_transaction_window() {
    assert!((500..=10_000).contains(&CHUNK_SIZE));
  }

  #[test]
  fn run_kinds_are_distinct_guard_keys() {
    let kinds = [RUN_ENVELOPE_FULL, RUN_GROUP_BASELINE_FULL, RUN_SCORE_FULL];
    for (i, a) in kinds.iter().enumerate() {
      for b in kinds.iter().skip(i + 1) {
        assert_ne!(a, b);
      }
    }
  }

  #[test]
  fn pass_failure_is_returned_even_when_guard_release_also_fails() {
    let pass: Result<BatchProgress, TrackError> = Err(TrackError::MissingReferenceCurve {
      age_days: REFERENCE_AGE_DAYS,
    });
    let release = Err(TrackError::Config("pool unavailable".to_string()));
    match settle_guarded(pass, release) {
      Err(TrackError::MissingReferenceCurve { age_days }) => {
        assert_eq!(age_days, REFERENCE_AGE_DAYS);
      }
      other => panic!("expected the pass error, got {other:?}"),
    }
  }

  #[test]
  fn failed_guard_release_surfaces_after_a_successful_pass() {
    let pass: Result<BatchProgress, TrackError> = Ok(BatchProgress {
      processed: 5,
      remaining: 0,
    });
    let release = Err(TrackError::Config("pool unavailable".to_string()));
    assert!(matches!(settle_guarded(pass, release), Err(TrackError::Config(_))));
  }

  #[test]
  fn settle_passes_progress_through_when_both_sides_succeed() {
    let pass: Result<BatchProgress, TrackError> = Ok(BatchProgress {
      processed: 5,
      remaining: 2,
    });
    let progress = settle_guarded(pass, Ok(())).unwrap();
    assert_eq!(progress.processed, 5);
    assert_eq!(progress.remaining, 2);
  }

  #[test]
  fn batch_progress_serializes_for_job_responses() {
    let progress = BatchProgress {
      processed: 120,
      remaining: 40,
    };
    let value = serde_json::to_value(progress).unwrap();
    assert_eq!(value["processed"], 120);
    assert_eq!(value["remaining"], 40);
  }
}
