use bytes::Bytes;
use chrono::{TimeZone, Utc};
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use viewtrack_rust::db::{get_pool, upsert_tracked_item, NewTrackedItem};
use viewtrack_rust::error::TrackError;
use viewtrack_rust::exclusion::ExclusionPolicy;

fn bearer_token(header_value: Option<&str>) -> Option<&str> {
  let value = header_value?;
  value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Result<Response<ResponseBody>, Error> {
  Ok(
    Response::builder()
      .status(status)
      .header("content-type", "application/json; charset=utf-8")
      .body(ResponseBody::from(value))?,
  )
}

fn has_tidb_url() -> bool {
  std::env::var("TIDB_DATABASE_URL")
    .or_else(|_| std::env::var("DATABASE_URL"))
    .map(|v| !v.is_empty())
    .unwrap_or(false)
}

fn track_error_response(err: TrackError) -> Result<Response<ResponseBody>, Error> {
  let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
  json_response(
    status,
    serde_json::json!({"ok": false, "error": err.to_string()}),
  )
}

#[derive(Deserialize)]
struct RegisterItem {
  item_id: String,
  group_id: String,
  published_at_ms: i64,
  duration_secs: Option<i64>,
  title: Option<String>,
  tags_text: Option<String>,
}

#[derive(Deserialize)]
struct RegisterRequest {
  now_ms: i64,
  items: Vec<RegisterItem>,
}

async fn handle_register(
  method: &Method,
  headers: &HeaderMap,
  body: Bytes,
) -> Result<Response<ResponseBody>, Error> {
  if method != Method::POST {
    return json_response(
      StatusCode::METHOD_NOT_ALLOWED,
      serde_json::json!({"ok": false, "error": "method_not_allowed"}),
    );
  }

  let expected = std::env::var("RUST_INTERNAL_TOKEN").unwrap_or_default();
  let provided = bearer_token(headers.get("authorization").and_then(|v| v.to_str().ok())).unwrap_or("");

  if expected.is_empty() || provided != expected {
    return json_response(
      StatusCode::UNAUTHORIZED,
      serde_json::json!({"ok": false, "error": "unauthorized"}),
    );
  }

  if !has_tidb_url() {
    return json_response(
      StatusCode::NOT_IMPLEMENTED,
      serde_json::json!({"ok": false, "error": "not_configured", "message": "Missing TIDB_DATABASE_URL (or DATABASE_URL)"}),
    );
  }

  let parsed: RegisterRequest = serde_json::from_slice(&body).map_err(|e| -> Error {
    Box::new(std::io::Error::other(format!("invalid json body: {e}")))
  })?;

  if parsed.now_ms <= 0 {
    return json_response(
      StatusCode::BAD_REQUEST,
      serde_json::json!({"ok": false, "error": "bad_request", "message": "now_ms is required"}),
    );
  }

  let now = Utc
    .timestamp_millis_opt(parsed.now_ms)
    .single()
    .unwrap_or_else(Utc::now);
  let today = now.date_naive();
  let policy = ExclusionPolicy::default();

  let pool = match get_pool().await {
    Ok(pool) => pool,
    Err(err) => return track_error_response(err),
  };

  let mut registered = 0usize;
  let mut excluded = 0usize;
  let mut skipped = 0usize;
  for entry in &parsed.items {
    let Some(published_at) = Utc.timestamp_millis_opt(entry.published_at_ms).single() else {
      skipped += 1;
      continue;
    };
    if entry.item_id.is_empty() || entry.group_id.is_empty() {
      skipped += 1;
      continue;
    }

    let title = entry.title.clone().unwrap_or_default();
    let is_excluded = policy.is_excluded(
      entry.duration_secs,
      &[title.as_str(), entry.tags_text.as_deref().unwrap_or("")],
    );

    let item = NewTrackedItem {
      item_id: entry.item_id.clone(),
      group_id: entry.group_id.clone(),
      published_at,
      duration_secs: entry.duration_secs,
      title,
      tags_text: entry.tags_text.clone(),
    };

    if let Err(err) = upsert_tracked_item(pool, &item, is_excluded, today).await {
      return track_error_response(err);
    }
    registered += 1;
    if is_excluded {
      excluded += 1;
    }
  }

  json_response(
    StatusCode::OK,
    serde_json::json!({
      "ok": true,
      "registered": registered,
      "excluded": excluded,
      "skipped": skipped
    }),
  )
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let bytes = req.into_body().collect().await?.to_bytes();
  handle_register(&method, &headers, bytes).await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  run(service_fn(handler)).await
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn returns_unauthorized_when_missing_internal_token() {
    std::env::set_var("RUST_INTERNAL_TOKEN", "secret");

    let headers = HeaderMap::new();
    let response = handle_register(&Method::POST, &headers, Bytes::new())
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
  }

  #[test]
  fn register_payload_accepts_optional_metadata() {
    let raw = r#"{"now_ms": 1700000000000, "items": [
      {"item_id": "vid-1", "group_id": "ch-1", "published_at_ms": 1690000000000,
       "duration_secs": 95, "title": "clip #shorts"},
      {"item_id": "vid-2", "group_id": "ch-1", "published_at_ms": 1690000000000}
    ]}"#;
    let parsed: RegisterRequest = serde_json::from_str(raw).unwrap();
    assert_eq!(parsed.items.len(), 2);
    assert_eq!(parsed.items[0].duration_secs, Some(95));
    assert!(parsed.items[1].title.is_none());
  }
}
