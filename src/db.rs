use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::{mysql::MySqlPoolOptions, MySqlPool};
use tokio::sync::OnceCell;

use crate::baseline::{EnvelopePoint, GroupBaseline};
use crate::error::TrackError;
use crate::tiering::{frequency_days, next_track_date, tier_for_age};

static POOL: OnceCell<MySqlPool> = OnceCell::const_new();

pub const DEFAULT_DAILY_QUOTA_UNITS: i64 = 10_000;

/// Underlying storage caps a single retrieval at this many rows, so every
/// batch read goes through the paginated contract.
pub const MAX_PAGE_ROWS: i64 = 1000;

async fn ensure_schema(pool: &MySqlPool) -> Result<(), TrackError> {
  // Keep schema creation idempotent; bins may race on cold start.
  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS tracked_items (
        item_id VARCHAR(128) PRIMARY KEY,
        group_id VARCHAR(128) NOT NULL,
        published_at TIMESTAMP(3) NOT NULL,
        duration_secs INT NULL,
        title VARCHAR(512) NOT NULL DEFAULT '',
        tags_text TEXT NULL,
        current_metric BIGINT NOT NULL DEFAULT 0,
        is_excluded TINYINT NOT NULL DEFAULT 0,
        ratio DECIMAL(8,3) NULL,
        category VARCHAR(16) NULL,
        created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
        updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
        KEY idx_tracked_items_group (group_id, published_at),
        KEY idx_tracked_items_excluded (is_excluded)
      );
    "#,
  )
  .execute(pool)
  .await?;

  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS snapshots (
        item_id VARCHAR(128) NOT NULL,
        observation_date DATE NOT NULL,
        metric_value BIGINT NOT NULL,
        days_since_published INT NOT NULL,
        derived_rate DOUBLE NOT NULL,
        created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
        PRIMARY KEY (item_id, observation_date),
        KEY idx_snapshots_age (days_since_published),
        KEY idx_snapshots_observed (observation_date)
      );
    "#,
  )
  .execute(pool)
  .await?;

  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS priority_records (
        item_id VARCHAR(128) PRIMARY KEY,
        tier TINYINT NOT NULL,
        frequency_days INT NOT NULL,
        last_tracked_date DATE NULL,
        next_track_date DATE NULL,
        updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
        KEY idx_priority_due (tier, next_track_date, last_tracked_date)
      );
    "#,
  )
  .execute(pool)
  .await?;

  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS quota_days (
        usage_date DATE PRIMARY KEY,
        used_units BIGINT NOT NULL DEFAULT 0,
        limit_units BIGINT NOT NULL,
        updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3)
      );
    "#,
  )
  .execute(pool)
  .await?;

  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS quota_call_log (
        id BIGINT PRIMARY KEY AUTO_INCREMENT,
        usage_date DATE NOT NULL,
        operation_type VARCHAR(64) NOT NULL,
        unit_cost BIGINT NOT NULL,
        description VARCHAR(255) NOT NULL DEFAULT '',
        job_id VARCHAR(128) NOT NULL DEFAULT '',
        created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
        KEY idx_quota_call_log_day (usage_date, created_at)
      );
    "#,
  )
  .execute(pool)
  .await?;

  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS envelope_points (
        age_days INT PRIMARY KEY,
        p10 DOUBLE NOT NULL,
        p25 DOUBLE NOT NULL,
        p50 DOUBLE NOT NULL,
        p75 DOUBLE NOT NULL,
        p90 DOUBLE NOT NULL,
        sample_count BIGINT NOT NULL,
        recomputed_at TIMESTAMP(3) NOT NULL
      );
    "#,
  )
  .execute(pool)
  .await?;

  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS group_baselines (
        group_id VARCHAR(128) PRIMARY KEY,
        reference_metric DOUBLE NOT NULL,
        multiplier DOUBLE NOT NULL,
        sample_count BIGINT NOT NULL,
        confidence DOUBLE NOT NULL,
        updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3)
      );
    "#,
  )
  .execute(pool)
  .await?;

  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS recompute_runs (
        run_kind VARCHAR(64) PRIMARY KEY,
        status VARCHAR(16) NOT NULL DEFAULT 'idle',
        started_at TIMESTAMP(3) NULL,
        finished_at TIMESTAMP(3) NULL
      );
    "#,
  )
  .execute(pool)
  .await?;

  Ok(())
}

pub async fn get_pool() -> Result<&'static MySqlPool, TrackError> {
  POOL
    .get_or_try_init(|| async {
      let url = std::env::var("TIDB_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .map_err(|_| {
          TrackError::Config("Missing TIDB_DATABASE_URL (or DATABASE_URL)".to_string())
        })?;

      let pool = MySqlPoolOptions::new().max_connections(5).connect(&url).await?;

      ensure_schema(&pool).await?;
      Ok::<_, TrackError>(pool)
    })
    .await
}

pub fn daily_quota_limit() -> i64 {
  std::env::var("QUOTA_DAILY_LIMIT")
    .ok()
    .and_then(|v| v.parse::<i64>().ok())
    .filter(|v| *v > 0)
    .unwrap_or(DEFAULT_DAILY_QUOTA_UNITS)
}

#[derive(Debug, Clone)]
pub struct NewTrackedItem {
  pub item_id: String,
  pub group_id: String,
  pub published_at: DateTime<Utc>,
  pub duration_secs: Option<i64>,
  pub title: String,
  pub tags_text: Option<String>,
}

/// Registers or corrects an item and keeps its priority record in step.
/// Tier is recomputed from the current age; an already-polled item keeps its
/// cadence anchor (`next = last_tracked + frequency`), a never-polled item
/// stays immediately eligible (`next_track_date IS NULL`).
pub async fn upsert_tracked_item(
  pool: &MySqlPool,
  item: &NewTrackedItem,
  is_excluded: bool,
  today: NaiveDate,
) -> Result<(), TrackError> {
  let mut tx = pool.begin().await?;

  sqlx::query(
    r#"
      INSERT INTO tracked_items
        (item_id, group_id, published_at, duration_secs, title, tags_text, is_excluded)
      VALUES
        (?, ?, ?, ?, ?, ?, ?)
      ON DUPLICATE KEY UPDATE
        group_id = VALUES(group_id),
        published_at = VALUES(published_at),
        duration_secs = VALUES(duration_secs),
        title = VALUES(title),
        tags_text = VALUES(tags_text),
        is_excluded = VALUES(is_excluded),
        updated_at = CURRENT_TIMESTAMP(3);
    "#,
  )
  .bind(&item.item_id)
  .bind(&item.group_id)
  .bind(item.published_at)
  .bind(item.duration_secs)
  .bind(&item.title)
  .bind(item.tags_text.as_deref())
  .bind(if is_excluded { 1 } else { 0 })
  .execute(&mut *tx)
  .await?;

  let age = crate::tiering::age_days(item.published_at.date_naive(), today);
  let tier = tier_for_age(age);
  let freq = frequency_days(tier);

  sqlx::query(
    r#"
      INSERT INTO priority_records (item_id, tier, frequency_days, last_tracked_date, next_track_date)
      VALUES (?, ?, ?, NULL, NULL)
      ON DUPLICATE KEY UPDATE
        tier = VALUES(tier),
        frequency_days = VALUES(frequency_days),
        next_track_date = IF(
          last_tracked_date IS NULL,
          NULL,
          DATE_ADD(last_tracked_date, INTERVAL ? DAY)
        );
    "#,
  )
  .bind(&item.item_id)
  .bind(tier)
  .bind(freq)
  .bind(freq)
  .execute(&mut *tx)
  .await?;

  tx.commit().await?;
  Ok(())
}

/// One polled observation. Snapshot upsert and priority-record update share
/// a transaction; the snapshot is only ever revised for the same observation
/// day. Returns false for unknown items (nothing written).
pub async fn record_poll_result(
  pool: &MySqlPool,
  item_id: &str,
  observation_date: NaiveDate,
  metric_value: i64,
) -> Result<bool, TrackError> {
  let mut tx = pool.begin().await?;

  let row = sqlx::query_as::<_, (DateTime<Utc>,)>(
    r#"
      SELECT published_at
      FROM tracked_items
      WHERE item_id = ?
      LIMIT 1;
    "#,
  )
  .bind(item_id)
  .fetch_optional(&mut *tx)
  .await?;

  let Some((published_at,)) = row else {
    tx.rollback().await?;
    return Ok(false);
  };

  let age = crate::tiering::age_days(published_at.date_naive(), observation_date);
  let derived_rate = (metric_value as f64) / (age.max(1) as f64);

  sqlx::query(
    r#"
      INSERT INTO snapshots
        (item_id, observation_date, metric_value, days_since_published, derived_rate)
      VALUES
        (?, ?, ?, ?, ?)
      ON DUPLICATE KEY UPDATE
        metric_value = VALUES(metric_value),
        derived_rate = VALUES(derived_rate);
    "#,
  )
  .bind(item_id)
  .bind(observation_date)
  .bind(metric_value)
  .bind(age)
  .bind(derived_rate)
  .execute(&mut *tx)
  .await?;

  sqlx::query(
    r#"
      UPDATE tracked_items
      SET current_metric = ?
      WHERE item_id = ?;
    "#,
  )
  .bind(metric_value)
  .bind(item_id)
  .execute(&mut *tx)
  .await?;

  let tier = tier_for_age(age);
  let next = next_track_date(observation_date, tier);

  sqlx::query(
    r#"
      INSERT INTO priority_records (item_id, tier, frequency_days, last_tracked_date, next_track_date)
      VALUES (?, ?, ?, ?, ?)
      ON DUPLICATE KEY UPDATE
        tier = VALUES(tier),
        frequency_days = VALUES(frequency_days),
        last_tracked_date = VALUES(last_tracked_date),
        next_track_date = VALUES(next_track_date);
    "#,
  )
  .bind(item_id)
  .bind(tier)
  .bind(frequency_days(tier))
  .bind(observation_date)
  .bind(next)
  .execute(&mut *tx)
  .await?;

  tx.commit().await?;
  Ok(true)
}

pub async fn fetch_quota_used(pool: &MySqlPool, usage_date: NaiveDate) -> Result<i64, TrackError> {
  // A missing day row is implicitly zero usage.
  let used = sqlx::query_scalar::<_, i64>(
    r#"
      SELECT used_units
      FROM quota_days
      WHERE usage_date = ?
      LIMIT 1;
    "#,
  )
  .bind(usage_date)
  .fetch_optional(pool)
  .await?
  .unwrap_or(0);

  Ok(used)
}

/// Read-only budget check; no side effect.
pub async fn check_quota_available(
  pool: &MySqlPool,
  usage_date: NaiveDate,
  estimated_cost: i64,
) -> Result<bool, TrackError> {
  let used = fetch_quota_used(pool, usage_date).await?;
  Ok(used + estimated_cost <= daily_quota_limit())
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaConsume {
  pub used_units: i64,
  pub remaining_units: i64,
}

/// Pure admission arithmetic for a quota spend: the returned `used_units` is
/// exactly the prior counter plus the appended call-log cost, so the day
/// counter and the audit log stay in lockstep.
fn consume_outcome(used: i64, unit_cost: i64, limit: i64) -> Result<QuotaConsume, TrackError> {
  if used + unit_cost > limit {
    return Err(TrackError::QuotaExceeded {
      needed: unit_cost,
      available: (limit - used).max(0),
    });
  }
  Ok(QuotaConsume {
    used_units: used + unit_cost,
    remaining_units: (limit - used - unit_cost).max(0),
  })
}

/// Atomically increments the day counter and appends the audit row. Concurrent
/// pollers serialize on the day-row lock, so units are never double-counted
/// and `used_units == SUM(call_log.unit_cost)` holds per date.
pub async fn record_quota_call(
  pool: &MySqlPool,
  usage_date: NaiveDate,
  operation_type: &str,
  unit_cost: i64,
  description: &str,
  job_id: &str,
) -> Result<QuotaConsume, TrackError> {
  let limit = daily_quota_limit();
  let mut tx = pool.begin().await?;

  sqlx::query(
    r#"
      INSERT INTO quota_days (usage_date, used_units, limit_units)
      VALUES (?, 0, ?)
      ON DUPLICATE KEY UPDATE limit_units = VALUES(limit_units);
    "#,
  )
  .bind(usage_date)
  .bind(limit)
  .execute(&mut *tx)
  .await?;

  let used: i64 = sqlx::query_scalar(
    r#"
      SELECT used_units
      FROM quota_days
      WHERE usage_date = ?
      FOR UPDATE;
    "#,
  )
  .bind(usage_date)
  .fetch_one(&mut *tx)
  .await?;

  let outcome = match consume_outcome(used, unit_cost, limit) {
    Ok(outcome) => outcome,
    Err(err) => {
      tx.rollback().await?;
      return Err(err);
    }
  };

  sqlx::query(
    r#"
      UPDATE quota_days
      SET used_units = used_units + ?
      WHERE usage_date = ?;
    "#,
  )
  .bind(unit_cost)
  .bind(usage_date)
  .execute(&mut *tx)
  .await?;

  sqlx::query(
    r#"
      INSERT INTO quota_call_log (usage_date, operation_type, unit_cost, description, job_id)
      VALUES (?, ?, ?, ?, ?);
    "#,
  )
  .bind(usage_date)
  .bind(operation_type)
  .bind(unit_cost)
  .bind(description)
  .bind(job_id)
  .execute(&mut *tx)
  .await?;

  tx.commit().await?;

  Ok(outcome)
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DueItem {
  pub item_id: String,
  pub tier: i32,
  pub age_days: i64,
}

fn clamp_page_limit(limit: i64) -> i64 {
  limit.clamp(1, MAX_PAGE_ROWS)
}

pub async fn count_due_items(
  pool: &MySqlPool,
  tier: Option<i32>,
  today: NaiveDate,
) -> Result<i64, TrackError> {
  let count = match tier {
    Some(tier) => {
      sqlx::query_scalar::<_, i64>(
        r#"
          SELECT COUNT(*)
          FROM priority_records
          WHERE tier = ?
            AND (next_track_date IS NULL OR next_track_date <= ?);
        "#,
      )
      .bind(tier)
      .bind(today)
      .fetch_one(pool)
      .await?
    }
    None => {
      sqlx::query_scalar::<_, i64>(
        r#"
          SELECT COUNT(*)
          FROM priority_records
          WHERE next_track_date IS NULL OR next_track_date <= ?;
        "#,
      )
      .bind(today)
      .fetch_one(pool)
      .await?
    }
  };

  Ok(count)
}

/// One page of due items for a tier. Fairness order: never-polled items win,
/// then least-recently-tracked, newer publish dates break remaining ties.
pub async fn fetch_due_batch_page(
  pool: &MySqlPool,
  tier: i32,
  today: NaiveDate,
  offset: i64,
  limit: i64,
) -> Result<Vec<DueItem>, TrackError> {
  let limit = clamp_page_limit(limit);

  let rows = sqlx::query_as::<_, (String, i32, i64)>(
    r#"
      SELECT p.item_id, p.tier, GREATEST(DATEDIFF(?, DATE(t.published_at)), 0) AS age_days
      FROM priority_records p
      JOIN tracked_items t ON t.item_id = p.item_id
      WHERE p.tier = ?
        AND (p.next_track_date IS NULL OR p.next_track_date <= ?)
      ORDER BY (p.last_tracked_date IS NULL) DESC,
               p.last_tracked_date ASC,
               t.published_at DESC,
               p.item_id ASC
      LIMIT ? OFFSET ?;
    "#,
  )
  .bind(today)
  .bind(tier)
  .bind(today)
  .bind(limit)
  .bind(offset)
  .fetch_all(pool)
  .await?;

  Ok(
    rows
      .into_iter()
      .map(|(item_id, tier, age_days)| DueItem {
        item_id,
        tier,
        age_days,
      })
      .collect(),
  )
}

/// Tier-agnostic paginated view for downstream callers capped by page size.
/// Callers loop until an empty page.
pub async fn fetch_due_batch_page_all(
  pool: &MySqlPool,
  today: NaiveDate,
  offset: i64,
  limit: i64,
) -> Result<(Vec<DueItem>, i64), TrackError> {
  let limit = clamp_page_limit(limit);

  let rows = sqlx::query_as::<_, (String, i32, i64)>(
    r#"
      SELECT p.item_id, p.tier, GREATEST(DATEDIFF(?, DATE(t.published_at)), 0) AS age_days
      FROM priority_records p
      JOIN tracked_items t ON t.item_id = p.item_id
      WHERE p.next_track_date IS NULL OR p.next_track_date <= ?
      ORDER BY p.tier ASC,
               (p.last_tracked_date IS NULL) DESC,
               p.last_tracked_date ASC,
               t.published_at DESC,
               p.item_id ASC
      LIMIT ? OFFSET ?;
    "#,
  )
  .bind(today)
  .bind(today)
  .bind(limit)
  .bind(offset)
  .fetch_all(pool)
  .await?;

  let total = count_due_items(pool, None, today).await?;

  Ok((
    rows
      .into_iter()
      .map(|(item_id, tier, age_days)| DueItem {
        item_id,
        tier,
        age_days,
      })
      .collect(),
    total,
  ))
}

/// (age_days, metric_value) pairs feeding the global curve; excluded items
/// contribute nothing.
pub async fn fetch_envelope_samples(pool: &MySqlPool) -> Result<Vec<(i32, i64)>, TrackError> {
  let rows = sqlx::query_as::<_, (i32, i64)>(
    r#"
      SELECT s.days_since_published, s.metric_value
      FROM snapshots s
      JOIN tracked_items t ON t.item_id = s.item_id
      WHERE t.is_excluded = 0
        AND s.days_since_published BETWEEN 0 AND 3650;
    "#,
  )
  .fetch_all(pool)
  .await?;

  Ok(rows)
}

pub async fn upsert_envelope_points(
  pool: &MySqlPool,
  points: &[EnvelopePoint],
  recomputed_at: DateTime<Utc>,
) -> Result<(), TrackError> {
  if points.is_empty() {
    return Ok(());
  }

  let mut qb = sqlx::QueryBuilder::<sqlx::MySql>::new(
    "INSERT INTO envelope_points (age_days, p10, p25, p50, p75, p90, sample_count, recomputed_at) ",
  );
  qb.push_values(points, |mut b, p| {
    b.push_bind(p.age_days)
      .push_bind(p.p10)
      .push_bind(p.p25)
      .push_bind(p.p50)
      .push_bind(p.p75)
      .push_bind(p.p90)
      .push_bind(p.sample_count)
      .push_bind(recomputed_at);
  });
  qb.push(
    r#"
      ON DUPLICATE KEY UPDATE
        p10 = VALUES(p10),
        p25 = VALUES(p25),
        p50 = VALUES(p50),
        p75 = VALUES(p75),
        p90 = VALUES(p90),
        sample_count = VALUES(sample_count),
        recomputed_at = VALUES(recomputed_at);
    "#,
  );

  qb.build().execute(pool).await?;
  Ok(())
}

/// Removes every age the latest pass did not upsert, so ages that fell below
/// the sample threshold are omitted rather than left stale. Matching on the
/// run stamp itself keeps this correct even when a replayed trigger carries
/// an earlier timestamp than the previous recompute.
pub async fn delete_stale_envelope_points(
  pool: &MySqlPool,
  recomputed_at: DateTime<Utc>,
) -> Result<u64, TrackError> {
  let result = sqlx::query(
    r#"
      DELETE FROM envelope_points
      WHERE recomputed_at <> ?;
    "#,
  )
  .bind(recomputed_at)
  .execute(pool)
  .await?;

  Ok(result.rows_affected())
}

pub async fn fetch_envelope_p50_at(
  pool: &MySqlPool,
  age_days: i32,
) -> Result<Option<f64>, TrackError> {
  let p50 = sqlx::query_scalar::<_, f64>(
    r#"
      SELECT p50
      FROM envelope_points
      WHERE age_days = ?
      LIMIT 1;
    "#,
  )
  .bind(age_days)
  .fetch_optional(pool)
  .await?;

  Ok(p50)
}

pub async fn fetch_envelope_p50_map(pool: &MySqlPool) -> Result<HashMap<i32, f64>, TrackError> {
  let rows = sqlx::query_as::<_, (i32, f64)>(
    r#"
      SELECT age_days, p50
      FROM envelope_points;
    "#,
  )
  .fetch_all(pool)
  .await?;

  Ok(rows.into_iter().collect())
}

/// Per-group metric samples at the reference age. Incremental mode restricts
/// to groups with snapshot activity since the given date.
pub async fn fetch_reference_metrics_by_group(
  pool: &MySqlPool,
  reference_age_days: i32,
  touched_since: Option<NaiveDate>,
) -> Result<Vec<(String, f64)>, TrackError> {
  let rows = match touched_since {
    Some(since) => {
      sqlx::query_as::<_, (String, f64)>(
        r#"
          SELECT t.group_id, CAST(s.metric_value AS DOUBLE) AS metric
          FROM snapshots s
          JOIN tracked_items t ON t.item_id = s.item_id
          WHERE t.is_excluded = 0
            AND s.days_since_published = ?
            AND t.group_id IN (
              SELECT DISTINCT t2.group_id
              FROM snapshots s2
              JOIN tracked_items t2 ON t2.item_id = s2.item_id
              WHERE s2.observation_date >= ?
            );
        "#,
      )
      .bind(reference_age_days)
      .bind(since)
      .fetch_all(pool)
      .await?
    }
    None => {
      sqlx::query_as::<_, (String, f64)>(
        r#"
          SELECT t.group_id, CAST(s.metric_value AS DOUBLE) AS metric
          FROM snapshots s
          JOIN tracked_items t ON t.item_id = s.item_id
          WHERE t.is_excluded = 0
            AND s.days_since_published = ?;
        "#,
      )
      .bind(reference_age_days)
      .fetch_all(pool)
      .await?
    }
  };

  Ok(rows)
}

pub async fn upsert_group_baselines(
  pool: &MySqlPool,
  baselines: &[GroupBaseline],
) -> Result<(), TrackError> {
  if baselines.is_empty() {
    return Ok(());
  }

  let mut qb = sqlx::QueryBuilder::<sqlx::MySql>::new(
    "INSERT INTO group_baselines (group_id, reference_metric, multiplier, sample_count, confidence) ",
  );
  qb.push_values(baselines, |mut b, g| {
    b.push_bind(&g.group_id)
      .push_bind(g.reference_metric)
      .push_bind(g.multiplier)
      .push_bind(g.sample_count)
      .push_bind(g.confidence);
  });
  qb.push(
    r#"
      ON DUPLICATE KEY UPDATE
        reference_metric = VALUES(reference_metric),
        multiplier = VALUES(multiplier),
        sample_count = VALUES(sample_count),
        confidence = VALUES(confidence),
        updated_at = CURRENT_TIMESTAMP(3);
    "#,
  );

  qb.build().execute(pool).await?;
  Ok(())
}

pub async fn fetch_group_multipliers(pool: &MySqlPool) -> Result<HashMap<String, f64>, TrackError> {
  let rows = sqlx::query_as::<_, (String, f64)>(
    r#"
      SELECT group_id, multiplier
      FROM group_baselines;
    "#,
  )
  .fetch_all(pool)
  .await?;

  Ok(rows.into_iter().collect())
}

#[derive(Debug, Clone)]
pub struct ScoreCandidate {
  pub item_id: String,
  pub group_id: String,
  pub published_at: DateTime<Utc>,
  pub current_metric: i64,
  pub age_days: i64,
  pub is_excluded: bool,
}

/// Keyset-paginated candidates for a score pass. Incremental mode restricts to
/// items with snapshot activity since the given date.
pub async fn fetch_score_candidates_page(
  pool: &MySqlPool,
  today: NaiveDate,
  touched_since: Option<NaiveDate>,
  after_item_id: &str,
  limit: i64,
) -> Result<Vec<ScoreCandidate>, TrackError> {
  let limit = clamp_page_limit(limit);

  let rows = match touched_since {
    Some(since) => {
      sqlx::query_as::<_, (String, String, DateTime<Utc>, i64, i64, i32)>(
        r#"
          SELECT t.item_id, t.group_id, t.published_at, t.current_metric,
                 GREATEST(DATEDIFF(?, DATE(t.published_at)), 0) AS age_days,
                 t.is_excluded
          FROM tracked_items t
          WHERE t.item_id > ?
            AND t.item_id IN (
              SELECT DISTINCT s.item_id
              FROM snapshots s
              WHERE s.observation_date >= ?
            )
          ORDER BY t.item_id ASC
          LIMIT ?;
        "#,
      )
      .bind(today)
      .bind(after_item_id)
      .bind(since)
      .bind(limit)
      .fetch_all(pool)
      .await?
    }
    None => {
      sqlx::query_as::<_, (String, String, DateTime<Utc>, i64, i64, i32)>(
        r#"
          SELECT t.item_id, t.group_id, t.published_at, t.current_metric,
                 GREATEST(DATEDIFF(?, DATE(t.published_at)), 0) AS age_days,
                 t.is_excluded
          FROM tracked_items t
          WHERE t.item_id > ?
          ORDER BY t.item_id ASC
          LIMIT ?;
        "#,
      )
      .bind(today)
      .bind(after_item_id)
      .bind(limit)
      .fetch_all(pool)
      .await?
    }
  };

  Ok(
    rows
      .into_iter()
      .map(
        |(item_id, group_id, published_at, current_metric, age_days, is_excluded)| ScoreCandidate {
          item_id,
          group_id,
          published_at,
          current_metric,
          age_days,
          is_excluded: is_excluded != 0,
        },
      )
      .collect(),
  )
}

pub async fn count_score_candidates(
  pool: &MySqlPool,
  touched_since: Option<NaiveDate>,
) -> Result<i64, TrackError> {
  let count = match touched_since {
    Some(since) => {
      sqlx::query_scalar::<_, i64>(
        r#"
          SELECT COUNT(*)
          FROM tracked_items t
          WHERE t.item_id IN (
            SELECT DISTINCT s.item_id
            FROM snapshots s
            WHERE s.observation_date >= ?
          );
        "#,
      )
      .bind(since)
      .fetch_one(pool)
      .await?
    }
    None => {
      sqlx::query_scalar::<_, i64>(
        r#"
          SELECT COUNT(*)
          FROM tracked_items;
        "#,
      )
      .fetch_one(pool)
      .await?
    }
  };

  Ok(count)
}

/// Metrics of the newest prior non-excluded items in the same group, newest
/// first, for the peer-rolling baseline.
pub async fn fetch_prior_group_metrics(
  pool: &MySqlPool,
  group_id: &str,
  published_before: DateTime<Utc>,
  limit: i64,
) -> Result<Vec<i64>, TrackError> {
  let rows = sqlx::query_as::<_, (i64,)>(
    r#"
      SELECT current_metric
      FROM tracked_items
      WHERE group_id = ?
        AND published_at < ?
        AND is_excluded = 0
      ORDER BY published_at DESC
      LIMIT ?;
    "#,
  )
  .bind(group_id)
  .bind(published_before)
  .bind(limit.clamp(1, MAX_PAGE_ROWS))
  .fetch_all(pool)
  .await?;

  Ok(rows.into_iter().map(|(m,)| m).collect())
}

/// Score upsert keyed by item; NULL clears the score ("no score yet").
pub async fn update_item_score(
  pool: &MySqlPool,
  item_id: &str,
  score: Option<(f64, &str)>,
) -> Result<(), TrackError> {
  let (ratio, category) = match score {
    Some((ratio, category)) => (Some(ratio), Some(category)),
    None => (None, None),
  };

  sqlx::query(
    r#"
      UPDATE tracked_items
      SET ratio = ?, category = ?
      WHERE item_id = ?;
    "#,
  )
  .bind(ratio)
  .bind(category)
  .bind(item_id)
  .execute(pool)
  .await?;

  Ok(())
}

/// Claims the in-progress slot for a run kind. A `running` row older than the
/// stale threshold is treated as a crashed run and reclaimed.
pub async fn try_begin_run(
  pool: &MySqlPool,
  run_kind: &str,
  now: DateTime<Utc>,
  stale_after: chrono::Duration,
) -> Result<bool, TrackError> {
  let mut tx = pool.begin().await?;

  sqlx::query(
    r#"
      INSERT INTO recompute_runs (run_kind, status)
      VALUES (?, 'idle')
      ON DUPLICATE KEY UPDATE run_kind = run_kind;
    "#,
  )
  .bind(run_kind)
  .execute(&mut *tx)
  .await?;

  let (status, started_at): (String, Option<DateTime<Utc>>) = sqlx::query_as(
    r#"
      SELECT status, started_at
      FROM recompute_runs
      WHERE run_kind = ?
      FOR UPDATE;
    "#,
  )
  .bind(run_kind)
  .fetch_one(&mut *tx)
  .await?;

  let live = status == "running"
    && started_at.is_some_and(|t| now.signed_duration_since(t) < stale_after);
  if live {
    tx.rollback().await?;
    return Ok(false);
  }

  sqlx::query(
    r#"
      UPDATE recompute_runs
      SET status = 'running', started_at = ?, finished_at = NULL
      WHERE run_kind = ?;
    "#,
  )
  .bind(now)
  .bind(run_kind)
  .execute(&mut *tx)
  .await?;

  tx.commit().await?;
  Ok(true)
}

pub async fn finish_run(
  pool: &MySqlPool,
  run_kind: &str,
  now: DateTime<Utc>,
) -> Result<(), TrackError> {
  sqlx::query(
    r#"
      UPDATE recompute_runs
      SET status = 'idle', finished_at = ?
      WHERE run_kind = ?;
    "#,
  )
  .bind(now)
  .bind(run_kind)
  .execute(pool)
  .await?;

  Ok(())
}

/// Items/groups count as "touched" when they have snapshot activity within
/// this many days; used by incremental recomputes.
pub const INCREMENTAL_ACTIVITY_DAYS: i64 = 2;

pub fn incremental_since(today: NaiveDate) -> NaiveDate {
  today - Duration::days(INCREMENTAL_ACTIVITY_DAYS)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn clamp_page_limit_enforces_storage_cap() {
    assert_eq!(clamp_page_limit(0), 1);
    assert_eq!(clamp_page_limit(-5), 1);
    assert_eq!(clamp_page_limit(500), 500);
    assert_eq!(clamp_page_limit(5000), MAX_PAGE_ROWS);
  }

  #[test]
  fn incremental_since_looks_back_two_days() {
    let today = NaiveDate::from_ymd_opt(2026, 5, 10).unwrap();
    assert_eq!(incremental_since(today), NaiveDate::from_ymd_opt(2026, 5, 8).unwrap());
  }

  #[test]
  fn consume_keeps_counter_equal_to_appended_cost() {
    let outcome = consume_outcome(9_950, 50, 10_000).unwrap();
    assert_eq!(outcome.used_units, 10_000);
    assert_eq!(outcome.remaining_units, 0);
  }

  #[test]
  fn consume_rejects_a_spend_past_the_limit() {
    match consume_outcome(9_990, 50, 10_000) {
      Err(TrackError::QuotaExceeded { needed, available }) => {
        assert_eq!(needed, 50);
        assert_eq!(available, 10);
      }
      other => panic!("expected quota rejection, got {other:?}"),
    }
  }

  #[test]
  fn consume_reports_zero_available_when_already_past_a_lowered_limit() {
    // The env-configured limit can shrink between days; a counter above it
    // must not report negative headroom.
    match consume_outcome(10_500, 1, 10_000) {
      Err(TrackError::QuotaExceeded { available, .. }) => assert_eq!(available, 0),
      other => panic!("expected quota rejection, got {other:?}"),
    }
  }
}
