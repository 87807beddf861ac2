use bytes::Bytes;
use chrono::{NaiveDate, TimeZone, Utc};
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use viewtrack_rust::db::{get_pool, record_poll_result};
use viewtrack_rust::error::TrackError;

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
struct Observation {
  item_id: String,
  metric_value: i64,
  /// Defaults to the request's day when omitted (same-day poll).
  observation_date: Option<NaiveDate>,
}

#[derive(Deserialize)]
struct PollResultsRequest {
  now_ms: i64,
  observations: Vec<Observation>,
}

async fn handle_results(
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

  let parsed: PollResultsRequest = serde_json::from_slice(&body).map_err(|e| -> Error {
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

  let pool = match get_pool().await {
    Ok(pool) => pool,
    Err(err) => return track_error_response(err),
  };

  let mut written = 0usize;
  let mut skipped = 0usize;
  for obs in &parsed.observations {
    if obs.metric_value < 0 {
      skipped += 1;
      continue;
    }
    let observation_date = obs.observation_date.unwrap_or(today);
    match record_poll_result(pool, &obs.item_id, observation_date, obs.metric_value).await {
      Ok(true) => written += 1,
      Ok(false) => skipped += 1,
      Err(err) => return track_error_response(err),
    }
  }

  json_response(
    StatusCode::OK,
    serde_json::json!({
      "ok": true,
      "written": written,
      "skipped": skipped
    }),
  )
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let bytes = req.into_body().collect().await?.to_bytes();
  handle_results(&method, &headers, bytes).await
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
    let response = handle_results(&Method::POST, &headers, Bytes::new())
      .await
      .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
  }

  #[test]
  fn observation_dates_parse_from_iso_days() {
    let raw = r#"{"now_ms": 1700000000000, "observations": [
      {"item_id": "vid-1", "metric_value": 120, "observation_date": "2026-03-01"},
      {"item_id": "vid-2", "metric_value": 45}
    ]}"#;
    let parsed: PollResultsRequest = serde_json::from_str(raw).unwrap();
    assert_eq!(parsed.observations.len(), 2);
    assert_eq!(
      parsed.observations[0].observation_date,
      Some(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap())
    );
    assert!(parsed.observations[1].observation_date.is_none());
  }
}
