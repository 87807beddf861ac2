/// Short-form detection. Excluded items are removed from all statistical
/// computation, both as contributors and as consumers. The heuristic has known
/// false-positive/negative risk, so it stays a configurable policy rather than
/// a fixed rule.
#[derive(Debug, Clone)]
pub struct ExclusionPolicy {
  pub max_duration_secs: i64,
  pub markers: Vec<String>,
}

impl Default for ExclusionPolicy {
  fn default() -> Self {
    Self {
      max_duration_secs: 121,
      markers: vec![
        "#shorts".to_string(),
        "#short".to_string(),
        "#youtubeshorts".to_string(),
      ],
    }
  }
}

impl ExclusionPolicy {
  /// True when the item should be excluded: duration at or under the
  /// threshold, or any marker hashtag present in the text fields.
  pub fn is_excluded(&self, duration_secs: Option<i64>, text_fields: &[&str]) -> bool {
    if duration_secs.is_some_and(|secs| secs <= self.max_duration_secs) {
      return true;
    }

    for field in text_fields {
      let lower = field.to_lowercase();
      if self.markers.iter().any(|m| lower.contains(m.as_str())) {
        return true;
      }
    }

    false
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn duration_at_threshold_is_excluded() {
    let policy = ExclusionPolicy::default();
    assert!(policy.is_excluded(Some(121), &[]));
    assert!(policy.is_excluded(Some(30), &[]));
    assert!(!policy.is_excluded(Some(122), &[]));
  }

  #[test]
  fn marker_hashtag_in_any_text_field_excludes() {
    let policy = ExclusionPolicy::default();
    assert!(policy.is_excluded(None, &["My clip #Shorts", ""]));
    assert!(policy.is_excluded(Some(600), &["title", "desc with #YouTubeShorts"]));
    assert!(!policy.is_excluded(Some(600), &["a plain long-form title"]));
  }

  #[test]
  fn missing_duration_alone_does_not_exclude() {
    let policy = ExclusionPolicy::default();
    assert!(!policy.is_excluded(None, &["no markers here"]));
  }

  #[test]
  fn custom_policy_overrides_threshold_and_markers() {
    let policy = ExclusionPolicy {
      max_duration_secs: 60,
      markers: vec!["#clip".to_string()],
    };
    assert!(!policy.is_excluded(Some(90), &["#shorts"]));
    assert!(policy.is_excluded(Some(90), &["a #clip tag"]));
  }
}
