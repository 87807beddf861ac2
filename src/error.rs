use thiserror::Error;

/// Failure taxonomy for the tracking subsystem. Quota exhaustion and
/// concurrent-run conflicts are retryable by the caller; a missing reference
/// curve aborts the whole baseline cycle before any write.
#[derive(Debug, Error)]
pub enum TrackError {
  #[error("quota exceeded: need {needed} units, {available} available")]
  QuotaExceeded { needed: i64, available: i64 },

  #[error("recompute '{kind}' already running")]
  ConcurrentRun { kind: String },

  #[error("global envelope has no entry at reference age {age_days}")]
  MissingReferenceCurve { age_days: i32 },

  #[error("{0}")]
  Config(String),

  #[error(transparent)]
  Db(#[from] sqlx::Error),
}

impl TrackError {
  /// HTTP status for the bin boundary. Deferral-class errors map to statuses
  /// the job runner treats as "retry later", not as hard failures.
  pub fn status_code(&self) -> u16 {
    match self {
      TrackError::QuotaExceeded { .. } => 429,
      TrackError::ConcurrentRun { .. } => 409,
      TrackError::MissingReferenceCurve { .. } => 422,
      TrackError::Config(_) => 501,
      TrackError::Db(_) => 500,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn concurrent_run_maps_to_conflict_status() {
    let err = TrackError::ConcurrentRun {
      kind: "envelope_full".to_string(),
    };
    assert_eq!(err.status_code(), 409);
  }

  #[test]
  fn quota_exceeded_maps_to_rate_limit_status() {
    let err = TrackError::QuotaExceeded {
      needed: 50,
      available: 3,
    };
    assert_eq!(err.status_code(), 429);
  }
}
