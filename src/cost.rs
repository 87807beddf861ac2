/// Metrics-API operations the subsystem spends quota units on. Each operation
/// has a fixed per-call unit cost set by the upstream API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationType {
  /// Batched metric read; accepts up to `ITEMS_PER_LIST_CALL` ids per call.
  VideosList,
  /// Single-item metadata refresh (duration, title corrections).
  VideoDetails,
}

pub const ITEMS_PER_LIST_CALL: i64 = 50;

impl OperationType {
  pub fn unit_cost(&self) -> i64 {
    match self {
      OperationType::VideosList => 1,
      OperationType::VideoDetails => 1,
    }
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      OperationType::VideosList => "videos.list",
      OperationType::VideoDetails => "video.details",
    }
  }
}

/// Units needed to poll `item_count` items via batched list calls.
pub fn estimate_poll_cost(item_count: i64) -> i64 {
  if item_count <= 0 {
    return 0;
  }
  let calls = (item_count + ITEMS_PER_LIST_CALL - 1) / ITEMS_PER_LIST_CALL;
  calls * OperationType::VideosList.unit_cost()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn estimate_poll_cost_rounds_calls_up() {
    assert_eq!(estimate_poll_cost(0), 0);
    assert_eq!(estimate_poll_cost(1), 1);
    assert_eq!(estimate_poll_cost(50), 1);
    assert_eq!(estimate_poll_cost(51), 2);
    assert_eq!(estimate_poll_cost(2500), 50);
  }

  #[test]
  fn estimate_poll_cost_ignores_negative_counts() {
    assert_eq!(estimate_poll_cost(-5), 0);
  }

  #[test]
  fn operation_names_are_stable_ledger_keys() {
    assert_eq!(OperationType::VideosList.as_str(), "videos.list");
    assert_eq!(OperationType::VideoDetails.as_str(), "video.details");
  }
}
