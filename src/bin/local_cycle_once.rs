use chrono::{NaiveDate, Utc};
use vercel_runtime::Error;

use viewtrack_rust::db::{fetch_quota_used, get_pool};
use viewtrack_rust::scheduler::{due_counts_by_tier, run_scheduling_cycle, SchedulerConfig};

fn validate_database_url() -> Result<(), Error> {
  let url = std::env::var("TIDB_DATABASE_URL")
    .or_else(|_| std::env::var("DATABASE_URL"))
    .unwrap_or_default();
  let trimmed = url.trim();
  if trimmed.is_empty() {
    return Err(Box::new(std::io::Error::other(
      "Missing TIDB_DATABASE_URL (or DATABASE_URL)",
    )) as Error);
  }
  if !trimmed.contains("://") {
    return Err(Box::new(std::io::Error::other(
      "Invalid TIDB_DATABASE_URL/DATABASE_URL (expected URL scheme like mysql://...)",
    )) as Error);
  }
  Ok(())
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
  args
    .iter()
    .position(|a| a == flag)
    .and_then(|idx| args.get(idx + 1))
    .cloned()
}

fn parse_dt(input: &str) -> Option<NaiveDate> {
  NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d").ok()
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .init();

  validate_database_url()?;
  let args: Vec<String> = std::env::args().collect();

  let budget = parse_flag_value(&args, "--budget")
    .and_then(|v| v.parse::<i64>().ok())
    .unwrap_or(10_000);
  let today = parse_flag_value(&args, "--date")
    .and_then(|v| parse_dt(&v))
    .unwrap_or_else(|| Utc::now().date_naive());
  let dry_run = args.iter().any(|a| a == "--dry-run");

  let pool = get_pool().await?;

  let counts = due_counts_by_tier(pool, today).await.map_err(|e| Box::new(e) as Error)?;
  for (tier, count) in &counts {
    println!("due tier={tier} count={count}");
  }

  let used_before = fetch_quota_used(pool, today).await.map_err(|e| Box::new(e) as Error)?;
  println!("quota_used_before={used_before}");

  if dry_run {
    println!("dry_run=true (no selection recorded)");
    return Ok(());
  }

  let config = SchedulerConfig::with_budget(budget);
  let job_id = format!("local-cycle-{}", Utc::now().timestamp_millis());
  let outcome = run_scheduling_cycle(pool, today, &config, &job_id)
    .await
    .map_err(|e| Box::new(e) as Error)?;

  for selection in &outcome.tiers {
    println!(
      "tier={} limit={} selected={} cost_units={}",
      selection.tier, selection.limit, selection.selected, selection.cost_units
    );
  }
  println!(
    "job_id={} selected_total={} quota_spent={} deferred={}",
    job_id,
    outcome.items.len(),
    outcome.quota_spent,
    outcome.deferred
  );

  let used_after = fetch_quota_used(pool, today).await.map_err(|e| Box::new(e) as Error)?;
  println!("quota_used_after={used_after}");

  Ok(())
}
