use hyper::{HeaderMap, Method, StatusCode};
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use viewtrack_rust::db::{fetch_due_batch_page_all, get_pool, MAX_PAGE_ROWS};
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

fn query_value<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
  let query = query?;
  for part in query.split('&') {
    let (k, v) = part.split_once('=')?;
    if k == key {
      return Some(v);
    }
  }
  None
}

fn query_i64(query: Option<&str>, key: &str, default: i64) -> i64 {
  query_value(query, key)
    .and_then(|v| v.parse::<i64>().ok())
    .unwrap_or(default)
}

fn track_error_response(err: TrackError) -> Result<Response<ResponseBody>, Error> {
  let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
  json_response(
    status,
    serde_json::json!({"ok": false, "error": err.to_string()}),
  )
}

/// Paginated view of today's due items for downstream callers whose reads are
/// capped at `MAX_PAGE_ROWS`. Loop with increasing offset until an empty
/// `rows` comes back.
async fn handle_batch_page(
  method: &Method,
  headers: &HeaderMap,
  query: Option<&str>,
) -> Result<Response<ResponseBody>, Error> {
  if method != Method::GET {
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

  let offset = query_i64(query, "offset", 0).max(0);
  let limit = query_i64(query, "limit", MAX_PAGE_ROWS);
  let today = chrono::Utc::now().date_naive();

  let pool = match get_pool().await {
    Ok(pool) => pool,
    Err(err) => return track_error_response(err),
  };

  let (rows, total_count) = match fetch_due_batch_page_all(pool, today, offset, limit).await {
    Ok(page) => page,
    Err(err) => return track_error_response(err),
  };

  json_response(
    StatusCode::OK,
    serde_json::json!({
      "ok": true,
      "offset": offset,
      "returned": rows.len(),
      "total_count": total_count,
      "rows": rows
    }),
  )
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let query = req.uri().query().map(|q| q.to_string());
  handle_batch_page(&method, &headers, query.as_deref()).await
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
    let response = handle_batch_page(&Method::GET, &headers, None).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
  }

  #[tokio::test]
  async fn rejects_non_get_methods() {
    let headers = HeaderMap::new();
    let response = handle_batch_page(&Method::POST, &headers, None).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
  }

  #[test]
  fn pagination_params_parse_with_defaults() {
    assert_eq!(query_i64(Some("offset=200&limit=50"), "offset", 0), 200);
    assert_eq!(query_i64(Some("offset=200&limit=50"), "limit", 1000), 50);
    assert_eq!(query_i64(Some("offset=abc"), "offset", 0), 0);
    assert_eq!(query_i64(None, "limit", 1000), 1000);
  }
}
