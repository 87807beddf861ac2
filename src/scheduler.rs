use chrono::NaiveDate;
use sqlx::MySqlPool;
use tracing::info;

use crate::cost::{estimate_poll_cost, OperationType};
use crate::db::{
  check_quota_available, count_due_items, fetch_due_batch_page, record_quota_call, DueItem,
  MAX_PAGE_ROWS,
};
use crate::error::TrackError;
use crate::tiering::{MAX_TIER, MIN_TIER};

/// Share of the cycle budget granted to each tier, percent, tiers 1..6.
pub const DEFAULT_TIER_ALLOCATION_PCT: [i64; 6] = [25, 20, 20, 15, 15, 5];

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  /// Total item budget for one cycle.
  pub budget: i64,
  pub tier_allocation_pct: [i64; 6],
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      budget: 10_000,
      tier_allocation_pct: DEFAULT_TIER_ALLOCATION_PCT,
    }
  }
}

impl SchedulerConfig {
  pub fn with_budget(budget: i64) -> Self {
    Self {
      budget: budget.max(0),
      ..Self::default()
    }
  }

  /// Hard per-tier cap: floor(budget * pct / 100). The scheduler never
  /// returns more than this many items for a tier in one cycle.
  pub fn tier_limit(&self, tier: i32) -> i64 {
    if !(MIN_TIER..=MAX_TIER).contains(&tier) {
      return 0;
    }
    let pct = self.tier_allocation_pct[(tier - 1) as usize];
    (self.budget * pct) / 100
  }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TierSelection {
  pub tier: i32,
  pub limit: i64,
  pub selected: i64,
  pub cost_units: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CycleOutcome {
  pub items: Vec<DueItem>,
  pub tiers: Vec<TierSelection>,
  pub quota_spent: i64,
  /// True when the ledger ran out mid-cycle and remaining tiers were
  /// deferred to the next cycle.
  pub deferred: bool,
}

/// One scheduling cycle: walk tiers in priority order, page through eligible
/// items up to each tier's cap, and reserve quota for the batch. Insufficient
/// budget stops selection of further tiers; already-selected tiers stand.
/// Selection order within a tier is deterministic (never-polled first, then
/// least-recently-tracked, then newest).
pub async fn run_scheduling_cycle(
  pool: &MySqlPool,
  today: NaiveDate,
  config: &SchedulerConfig,
  job_id: &str,
) -> Result<CycleOutcome, TrackError> {
  let mut outcome = CycleOutcome {
    items: Vec::new(),
    tiers: Vec::new(),
    quota_spent: 0,
    deferred: false,
  };

  for tier in MIN_TIER..=MAX_TIER {
    let limit = config.tier_limit(tier);
    if limit == 0 {
      continue;
    }

    let rows = collect_tier_batch(pool, tier, today, limit).await?;
    if rows.is_empty() {
      continue;
    }

    let cost = estimate_poll_cost(rows.len() as i64);
    if !check_quota_available(pool, today, cost).await? {
      info!(tier, cost, "quota exhausted; deferring remaining tiers");
      outcome.deferred = true;
      break;
    }

    let description = format!("tier {} poll batch ({} items)", tier, rows.len());
    match record_quota_call(
      pool,
      today,
      OperationType::VideosList.as_str(),
      cost,
      &description,
      job_id,
    )
    .await
    {
      Ok(_) => {}
      // A concurrent poller can win the remaining budget between the check
      // and the reservation; that is a deferral, not a failure.
      Err(TrackError::QuotaExceeded { .. }) => {
        outcome.deferred = true;
        break;
      }
      Err(err) => return Err(err),
    }

    outcome.quota_spent += cost;
    outcome.tiers.push(TierSelection {
      tier,
      limit,
      selected: rows.len() as i64,
      cost_units: cost,
    });
    outcome.items.extend(rows);
  }

  Ok(outcome)
}

/// Pages through a tier's eligible items up to the tier cap. The storage
/// layer caps one read at `MAX_PAGE_ROWS`, so the loop keeps requesting pages
/// until the cap is hit or a page comes back short.
async fn collect_tier_batch(
  pool: &MySqlPool,
  tier: i32,
  today: NaiveDate,
  tier_limit: i64,
) -> Result<Vec<DueItem>, TrackError> {
  let mut out: Vec<DueItem> = Vec::new();

  loop {
    let Some((offset, page_limit)) = next_page_request(out.len() as i64, tier_limit) else {
      break;
    };

    let page = fetch_due_batch_page(pool, tier, today, offset, page_limit).await?;
    let short_page = (page.len() as i64) < page_limit;
    out.extend(page);
    if short_page {
      break;
    }
  }

  Ok(out)
}

/// Next (offset, limit) to request, or None once the tier cap is reached.
fn next_page_request(selected_so_far: i64, tier_limit: i64) -> Option<(i64, i64)> {
  let remaining = tier_limit - selected_so_far;
  if remaining <= 0 {
    return None;
  }
  Some((selected_so_far, remaining.min(MAX_PAGE_ROWS)))
}

/// Count of due items per tier; used by operator tooling.
pub async fn due_counts_by_tier(
  pool: &MySqlPool,
  today: NaiveDate,
) -> Result<Vec<(i32, i64)>, TrackError> {
  let mut out = Vec::with_capacity(6);
  for tier in MIN_TIER..=MAX_TIER {
    let count = count_due_items(pool, Some(tier), today).await?;
    out.push((tier, count));
  }
  Ok(out)
}
