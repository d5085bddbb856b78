//! PostgREST client.
//!
//! Requests go to `{url}/rest/v1/{table}` with the service role key sent as
//! both the `apikey` header and a bearer token. Filters use PostgREST's
//! `column=operator.value` query syntax.

use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::json;
use std::time::Duration;
use tracing::{error, warn};

use crate::config::DatabaseConfig;
use crate::errors::{SubkeeperError, SubkeeperResult};

use super::{format_timestamp, Subscription, SUBSCRIPTION_SELECT};

/// Thin client over the PostgREST endpoint.
#[derive(Clone)]
pub struct RestClient {
    http: Client,
    base_url: String,
    service_role_key: String,
    subscriptions_table: String,
    usage_table: String,
    plans_table: String,
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .field("subscriptions_table", &self.subscriptions_table)
            .field("usage_table", &self.usage_table)
            .field("plans_table", &self.plans_table)
            .finish_non_exhaustive()
    }
}

impl RestClient {
    /// Build a client from validated configuration.
    pub fn new(config: &DatabaseConfig) -> SubkeeperResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("subkeeper/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SubkeeperError::ConfigError(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            service_role_key: config.service_role_key.clone(),
            subscriptions_table: config.subscriptions_table.clone(),
            usage_table: config.usage_table.clone(),
            plans_table: config.plans_table.clone(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn request(&self, method: Method, url: String) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.service_role_key)
            .bearer_auth(&self.service_role_key)
    }

    /// Turn a non-2xx response into an `ApiError` carrying the body text.
    async fn check(resp: Response, operation: &str) -> SubkeeperResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let message = resp.text().await.unwrap_or_default();
        error!(
            operation = operation,
            status = status.as_u16(),
            "Database request failed: {message}"
        );
        Err(SubkeeperError::ApiError {
            status: status.as_u16(),
            message,
        })
    }

    async fn read_rows(resp: Response) -> SubkeeperResult<Vec<Subscription>> {
        resp.json::<Vec<Subscription>>()
            .await
            .map_err(|e| SubkeeperError::DecodeError(format!("subscription rows: {e}")))
    }

    async fn fetch_subscriptions(
        &self,
        filters: &[(&str, String)],
        after: Option<&str>,
        limit: u32,
    ) -> SubkeeperResult<Vec<Subscription>> {
        let mut req = self
            .request(Method::GET, self.table_url(&self.subscriptions_table))
            .query(&[
                ("select", SUBSCRIPTION_SELECT.to_string()),
                ("order", "id.asc".to_string()),
                ("limit", limit.to_string()),
            ])
            .query(filters);

        if let Some(last_id) = after {
            req = req.query(&[("id", format!("gt.{last_id}"))]);
        }

        let resp = Self::check(req.send().await?, "select subscriptions").await?;
        Self::read_rows(resp).await
    }

    pub(crate) async fn pending_plan_changes(
        &self,
        after: Option<&str>,
        limit: u32,
    ) -> SubkeeperResult<Vec<Subscription>> {
        self.fetch_subscriptions(
            &[("pending_plan_code", "not.is.null".to_string())],
            after,
            limit,
        )
        .await
    }

    pub(crate) async fn expiry_candidates(
        &self,
        now: DateTime<Utc>,
        after: Option<&str>,
        limit: u32,
    ) -> SubkeeperResult<Vec<Subscription>> {
        self.fetch_subscriptions(
            &[
                ("is_active", "is.true".to_string()),
                ("expires_at", format!("lte.{}", format_timestamp(now))),
            ],
            after,
            limit,
        )
        .await
    }

    /// PATCH the subscriptions matching `filters`; returns the number of rows updated.
    async fn update_subscriptions(
        &self,
        filters: &[(&str, String)],
        body: serde_json::Value,
        operation: &str,
    ) -> SubkeeperResult<usize> {
        let req = self
            .request(Method::PATCH, self.table_url(&self.subscriptions_table))
            .query(filters)
            .query(&[("select", "id")])
            .header("Prefer", "return=representation")
            .json(&body);

        let resp = Self::check(req.send().await?, operation).await?;
        let rows: Vec<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| SubkeeperError::DecodeError(format!("{operation}: {e}")))?;

        Ok(rows.len())
    }

    pub(crate) async fn apply_plan_change(
        &self,
        id: &str,
        expected_pending: &str,
        new_plan: Option<&str>,
        now: DateTime<Utc>,
    ) -> SubkeeperResult<bool> {
        let mut body = json!({
            "pending_plan_code": null,
            "pending_starts_at": null,
            "updated_at": format_timestamp(now),
        });
        if let Some(plan) = new_plan {
            body["plan_code"] = json!(plan);
        }

        let updated = self
            .update_subscriptions(
                &[
                    ("id", format!("eq.{id}")),
                    ("pending_plan_code", format!("eq.{expected_pending}")),
                ],
                body,
                "apply plan change",
            )
            .await?;

        Ok(updated > 0)
    }

    pub(crate) async fn deactivate_subscription(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> SubkeeperResult<bool> {
        let updated = self
            .update_subscriptions(
                &[("id", format!("eq.{id}")), ("is_active", "is.true".to_string())],
                json!({
                    "is_active": false,
                    "status": "expired",
                    "updated_at": format_timestamp(now),
                }),
                "deactivate subscription",
            )
            .await?;

        Ok(updated > 0)
    }

    pub(crate) async fn count_usage_before(&self, cutoff: NaiveDate) -> SubkeeperResult<u64> {
        let req = self
            .request(Method::GET, self.table_url(&self.usage_table))
            .query(&[
                ("select", "usage_date".to_string()),
                ("usage_date", format!("lt.{cutoff}")),
                ("limit", "1".to_string()),
            ])
            .header("Prefer", "count=exact");

        let resp = Self::check(req.send().await?, "count usage").await?;
        Ok(total_from_headers(&resp, "count usage"))
    }

    pub(crate) async fn purge_usage_before(&self, cutoff: NaiveDate) -> SubkeeperResult<u64> {
        let req = self
            .request(Method::DELETE, self.table_url(&self.usage_table))
            .query(&[("usage_date", format!("lt.{cutoff}"))])
            .header("Prefer", "return=minimal, count=exact");

        let resp = Self::check(req.send().await?, "purge usage").await?;
        Ok(total_from_headers(&resp, "purge usage"))
    }

    pub(crate) async fn plan_grace_days(&self, plan_code: &str) -> SubkeeperResult<Option<i64>> {
        let req = self
            .request(Method::GET, self.table_url(&self.plans_table))
            .query(&[
                ("select", "*".to_string()),
                ("plan_code", format!("eq.{plan_code}")),
                ("limit", "1".to_string()),
            ]);

        let resp = req.send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            warn!(
                table = %self.plans_table,
                "Plans table not found; using default grace days"
            );
            return Ok(None);
        }

        let resp = Self::check(resp, "select plan").await?;
        let rows: Vec<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| SubkeeperError::DecodeError(format!("plan rows: {e}")))?;

        Ok(rows
            .first()
            .and_then(|row| row.get("grace_days"))
            .and_then(grace_days_value))
    }

    pub(crate) async fn call_function(&self, name: &str) -> SubkeeperResult<serde_json::Value> {
        let req = self
            .request(Method::POST, format!("{}/rest/v1/rpc/{}", self.base_url, name))
            .json(&json!({}));

        let resp = Self::check(req.send().await?, "call function").await?;
        let body = resp.text().await?;

        // Functions returning void answer with an empty body.
        if body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }

        serde_json::from_str(&body)
            .map_err(|e| SubkeeperError::DecodeError(format!("function {name}: {e}")))
    }
}

/// Grace days may be stored as an integer, a float or numeric text.
fn grace_days_value(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Read the total from a `Content-Range` header such as `0-24/3573` or `*/12`.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.parse().ok()
}

fn total_from_headers(resp: &Response, operation: &str) -> u64 {
    let header = resp
        .headers()
        .get("content-range")
        .and_then(|v| v.to_str().ok());

    match header.and_then(parse_content_range_total) {
        Some(total) => total,
        None => {
            warn!(
                operation = operation,
                header = header.unwrap_or("<missing>"),
                "Response carried no row count; reporting 0"
            );
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_totals() {
        assert_eq!(parse_content_range_total("0-24/3573"), Some(3573));
        assert_eq!(parse_content_range_total("*/12"), Some(12));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-9/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn grace_days_accepts_loose_types() {
        assert_eq!(grace_days_value(&json!(3)), Some(3));
        assert_eq!(grace_days_value(&json!(2.0)), Some(2));
        assert_eq!(grace_days_value(&json!(" 5 ")), Some(5));
        assert_eq!(grace_days_value(&json!("soon")), None);
        assert_eq!(grace_days_value(&json!(null)), None);
    }

    #[test]
    fn debug_output_hides_key() {
        let config = DatabaseConfig {
            url: "https://project.supabase.co/".to_string(),
            service_role_key: "super-secret".to_string(),
            ..DatabaseConfig::default()
        };
        let client = RestClient::new(&config).unwrap();
        let rendered = format!("{client:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("https://project.supabase.co"));
    }
}
