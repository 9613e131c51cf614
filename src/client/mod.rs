//! HTTP platform client with rate limiting
//!
//! This module wraps all network round trips against the reservation
//! platform:
//! - polling traffic (venues, slots, summaries) goes through a governor
//!   rate limiter and a bounded retry loop with exponential backoff
//! - order submission bypasses the limiter and never retries internally;
//!   retry-on-rate-limit belongs to the account failover router
//!
//! Sessions are passed per call. The client itself is account-agnostic so
//! one instance can serve every account a job rotates through.

use chrono::NaiveDate;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, COOKIE, ORIGIN, REFERER, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::time::Duration;

use crate::config::{ClientConfig, Config, EndpointSet};
use crate::credentials::AccountSession;
use crate::models::{extract_first_list, RawSlot, Slot, Target};
use crate::protocol::EncodedOrder;
use crate::utils::error::{ApiError, BookingError};

/// A venue as returned by the discovery listing
#[derive(Debug, Clone)]
pub struct VenueSummary {
    pub id: String,
    pub name: String,
    pub address: Option<String>,
}

/// A bookable field type inside a venue
#[derive(Debug, Clone)]
pub struct FieldTypeInfo {
    pub id: String,
    pub name: String,
}

/// Platform HTTP client
pub struct PlatformClient {
    http: Client,
    base_url: String,
    endpoints: EndpointSet,
    user_agent: String,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    max_retries: u32,
    base_delay_ms: u64,
    order_timeout: Duration,
}

impl PlatformClient {
    /// Create a client from configuration
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Http` if the underlying HTTP client cannot be built
    pub fn new(config: &Config) -> Result<Self, ApiError> {
        Self::build(config, config.platform.base_url.clone())
    }

    /// Create a client pointed at a custom base URL (mock servers in tests)
    pub fn with_base_url(config: &Config, base_url: &str) -> Result<Self, ApiError> {
        Self::build(config, base_url.to_string())
    }

    fn build(config: &Config, base_url: String) -> Result<Self, ApiError> {
        let client_cfg: &ClientConfig = &config.client;
        let http = Client::builder()
            .timeout(client_cfg.request_timeout())
            .gzip(true)
            .build()?;

        let rate = NonZeroU32::new(client_cfg.rate_limit)
            .unwrap_or_else(|| NonZeroU32::new(1).expect("1 is non-zero"));
        let rate_limiter = RateLimiter::direct(Quota::per_second(rate));

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            endpoints: config.platform.endpoints.clone(),
            user_agent: config.platform.user_agent.clone(),
            rate_limiter,
            max_retries: client_cfg.max_retries,
            base_delay_ms: client_cfg.base_delay_ms,
            order_timeout: client_cfg.order_timeout(),
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    /// Standard browser-shaped headers plus the account's credentials
    fn headers(&self, account: Option<&AccountSession>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(ua) = HeaderValue::from_str(&self.user_agent) {
            headers.insert(USER_AGENT, ua);
        }
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/plain, */*"),
        );
        if let Ok(origin) = HeaderValue::from_str(&self.base_url) {
            headers.insert(ORIGIN, origin);
        }
        if let Ok(referer) = HeaderValue::from_str(&format!("{}/pc/", self.base_url)) {
            headers.insert(REFERER, referer);
        }

        if let Some(account) = account {
            if let Some(cookie) = &account.session_cookie {
                if let Ok(value) = HeaderValue::from_str(cookie) {
                    headers.insert(COOKIE, value);
                }
            }
            if let Some(token) = &account.token {
                if let Ok(value) = HeaderValue::from_str(token) {
                    headers.insert(reqwest::header::AUTHORIZATION, value);
                }
            }
        }

        headers
    }

    /// Determine if a status code should trigger a retry
    ///
    /// Retry on 429 and transient 5xx; everything else surfaces immediately.
    fn should_retry(status: u16) -> bool {
        matches!(status, 429 | 500 | 502 | 503 | 504)
    }

    fn map_status(status: StatusCode) -> Option<ApiError> {
        match status.as_u16() {
            200..=299 => None,
            401 | 403 => Some(ApiError::AuthExpired),
            429 => Some(ApiError::RateLimited),
            code => Some(ApiError::ServerError(code)),
        }
    }

    /// Rate-limited POST with retry for query traffic
    async fn post_query(
        &self,
        path: &str,
        body: &Value,
        account: Option<&AccountSession>,
    ) -> Result<Value, ApiError> {
        self.rate_limiter.until_ready().await;

        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.base_delay_ms * 2_u64.pow(attempt - 1);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let result = self
                .http
                .post(self.url(path))
                .headers(self.headers(account))
                .json(body)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    match Self::map_status(status) {
                        None => return Self::decode_json(response).await,
                        Some(ApiError::ServerError(code)) if Self::should_retry(code) => {
                            last_error = Some(ApiError::ServerError(code));
                        }
                        Some(ApiError::RateLimited) => {
                            last_error = Some(ApiError::RateLimited);
                        }
                        Some(err) => return Err(err),
                    }
                }
                Err(e) if e.is_timeout() => last_error = Some(ApiError::Timeout),
                Err(e) => last_error = Some(ApiError::Http(e)),
            }
        }

        Err(last_error.unwrap_or(ApiError::MaxRetriesExceeded))
    }

    async fn decode_json(response: Response) -> Result<Value, ApiError> {
        response
            .json::<Value>()
            .await
            .map_err(|e| ApiError::Decode(format!("response is not JSON: {e}")))
    }

    // -------------------- session --------------------

    /// Fetch the current-user profile; doubles as the keep-alive ping
    pub async fn current_user(&self, account: &AccountSession) -> Result<Value, ApiError> {
        self.rate_limiter.until_ready().await;

        let response = self
            .http
            .get(self.url(&self.endpoints.current_user))
            .headers(self.headers(Some(account)))
            .send()
            .await?;

        match Self::map_status(response.status()) {
            None => Self::decode_json(response).await,
            Some(err) => Err(err),
        }
    }

    // -------------------- discovery --------------------

    /// List venues, optionally filtered by a name keyword
    pub async fn list_venues(
        &self,
        keyword: Option<&str>,
        page: u32,
        size: u32,
        account: &AccountSession,
    ) -> Result<Vec<VenueSummary>, ApiError> {
        let mut body = json!({"pageSize": size, "pageNum": page, "flag": 0});
        if let Some(keyword) = keyword {
            body["venueName"] = json!(keyword);
        }

        let payload = self
            .post_query(&self.endpoints.list_venues, &body, Some(account))
            .await?;

        let items = extract_first_list(&payload).cloned().unwrap_or_default();
        let venues = items
            .iter()
            .filter_map(|item| {
                let id = loose_string(item, &["id", "venueId", "uuid", "bizId"])?;
                let name = loose_string(item, &["venueName", "name", "title"])?;
                Some(VenueSummary {
                    id,
                    name,
                    address: loose_string(item, &["address", "addr"]),
                })
            })
            .collect();
        Ok(venues)
    }

    /// Find the first venue whose name contains `keyword`
    pub async fn find_venue(
        &self,
        keyword: &str,
        account: &AccountSession,
    ) -> Result<Option<VenueSummary>, ApiError> {
        for page in 1..=3 {
            let venues = self.list_venues(Some(keyword), page, 50, account).await?;
            if venues.is_empty() {
                break;
            }
            if let Some(venue) = venues.into_iter().find(|v| v.name.contains(keyword)) {
                return Ok(Some(venue));
            }
        }
        Ok(None)
    }

    /// Fetch a venue's detail document
    pub async fn venue_detail(
        &self,
        venue_id: &str,
        account: &AccountSession,
    ) -> Result<Value, ApiError> {
        let payload = self
            .post_query(
                &self.endpoints.venue_detail,
                &json!({"id": venue_id}),
                Some(account),
            )
            .await?;
        match payload.get("data") {
            Some(Value::Object(_)) => Ok(payload["data"].clone()),
            _ => Ok(payload),
        }
    }

    /// Extract the field types offered by a venue detail document
    pub fn field_types(venue_detail: &Value) -> Vec<FieldTypeInfo> {
        const LIST_KEYS: &[&str] = &[
            "fieldTypeList",
            "fieldTypes",
            "bizFieldTypeList",
            "data",
            "motionTypes",
        ];

        let items = LIST_KEYS
            .iter()
            .find_map(|k| venue_detail.get(*k).and_then(Value::as_array));

        items
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let id = loose_string(item, &["id", "fieldTypeId", "code", "motionId"])?;
                        let name =
                            loose_string(item, &["fieldTypeName", "name", "title", "motionName"])?;
                        Some(FieldTypeInfo { id, name })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolve a keyword pair into a concrete target
    pub async fn resolve_target(
        &self,
        venue_keyword: &str,
        field_type_keyword: Option<&str>,
        account: &AccountSession,
    ) -> Result<Target, BookingError> {
        let venue = self
            .find_venue(venue_keyword, account)
            .await?
            .ok_or_else(|| BookingError::Config(format!("venue not found: {venue_keyword}")))?;

        let detail = self.venue_detail(&venue.id, account).await?;
        let field_types = Self::field_types(&detail);
        let field_type = match field_type_keyword {
            Some(keyword) => field_types.iter().find(|f| f.name.contains(keyword)),
            None => field_types.first(),
        }
        .ok_or_else(|| {
            BookingError::Config(format!(
                "no field type matching {:?} at {}",
                field_type_keyword, venue.name
            ))
        })?;

        Ok(Target {
            venue_id: venue.id,
            field_type_id: field_type.id.clone(),
            venue_name: Some(venue.name),
            field_type_name: Some(field_type.name.clone()),
        })
    }

    // -------------------- slots --------------------

    /// Dates the platform currently sells for this target, with their
    /// per-date tokens when present
    pub async fn available_dates(
        &self,
        target: &Target,
        account: &AccountSession,
    ) -> Result<Vec<(NaiveDate, Option<String>)>, ApiError> {
        // Wire quirk: this endpoint spells the parameter "feildType".
        let body = json!({"id": target.venue_id, "feildType": target.field_type_id});
        let payload = self
            .post_query(&self.endpoints.field_reserve, &body, Some(account))
            .await?;

        let items = extract_first_list(&payload).cloned().unwrap_or_default();
        let mut dates = Vec::new();
        for item in &items {
            let Some(raw_date) = loose_string(item, &["date", "scheduleDate", "day"]) else {
                continue;
            };
            let Ok(date) = NaiveDate::parse_from_str(&raw_date, "%Y-%m-%d") else {
                continue;
            };
            let token = loose_string(item, &["dateId", "dateToken", "token"]);
            dates.push((date, token));
        }
        dates.sort_by_key(|(date, _)| *date);
        dates.dedup_by_key(|(date, _)| *date);
        Ok(dates)
    }

    /// One network round trip for one date's raw slot records.
    ///
    /// Transport failures are an error; an empty list means the platform
    /// confirmed there is nothing on sale.
    pub async fn day_slots(
        &self,
        target: &Target,
        date: NaiveDate,
        date_token: Option<&str>,
        account: &AccountSession,
    ) -> Result<Vec<Slot>, BookingError> {
        let mut body = json!({
            "venueId": target.venue_id,
            "fieldType": target.field_type_id,
            "date": date.format("%Y-%m-%d").to_string(),
        });
        if let Some(token) = date_token {
            body["dateId"] = json!(token);
        }

        let payload = self
            .post_query(&self.endpoints.field_situation, &body, Some(account))
            .await?;

        let items = extract_first_list(&payload).cloned().unwrap_or_default();
        let mut slots = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let raw: RawSlot = serde_json::from_value(item.clone())
                .map_err(|e| ApiError::Decode(format!("slot record {index}: {e}")))?;
            slots.push(Slot::from_raw(&raw, date, index)?);
        }
        Ok(slots)
    }

    /// Cheap per-date reservation summary used as a change detector
    pub async fn reserve_summary(
        &self,
        target: &Target,
        date: NaiveDate,
        account: &AccountSession,
    ) -> Result<Value, ApiError> {
        let body = json!({
            "id": target.venue_id,
            "feildType": target.field_type_id,
            "date": date.format("%Y-%m-%d").to_string(),
        });
        self.post_query(&self.endpoints.field_reserve, &body, Some(account))
            .await
    }

    // -------------------- orders --------------------

    /// Submit an encrypted order.
    ///
    /// No limiter and no retry here: this path is raced against other
    /// clients, and rotation decisions belong to the failover router.
    /// Returns the HTTP status and raw body for classification.
    pub async fn submit_order(
        &self,
        encoded: &EncodedOrder,
        account: &AccountSession,
    ) -> Result<(u16, String), ApiError> {
        let mut headers = self.headers(Some(account));
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json;charset=UTF-8"),
        );
        if let Ok(sid) = HeaderValue::from_str(&encoded.sid) {
            headers.insert("sid", sid);
        }
        if let Ok(tim) = HeaderValue::from_str(&encoded.tim) {
            headers.insert("tim", tim);
        }

        let response = self
            .http
            .post(self.url(&self.endpoints.order_confirm))
            .headers(headers)
            .timeout(self.order_timeout)
            .body(encoded.body.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ApiError::Timeout
                } else {
                    ApiError::Http(e)
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Decode(format!("order response body: {e}")))?;
        Ok((status, body))
    }

    /// Fallback simple-submit path for slots exposing a direct order id
    pub async fn submit_simple(
        &self,
        order_id: &str,
        account: &AccountSession,
    ) -> Result<Value, ApiError> {
        let response = self
            .http
            .post(self.url(&self.endpoints.order_submit))
            .headers(self.headers(Some(account)))
            .timeout(self.order_timeout)
            .form(&[("orderId", order_id)])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ApiError::Timeout
                } else {
                    ApiError::Http(e)
                }
            })?;

        match Self::map_status(response.status()) {
            None => Self::decode_json(response).await,
            Some(err) => Err(err),
        }
    }
}

/// Read the first present key from a loosely-typed JSON object as a string
fn loose_string(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match value.get(*k) {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry() {
        assert!(PlatformClient::should_retry(429));
        assert!(PlatformClient::should_retry(500));
        assert!(PlatformClient::should_retry(503));

        assert!(!PlatformClient::should_retry(400));
        assert!(!PlatformClient::should_retry(401));
        assert!(!PlatformClient::should_retry(404));
        assert!(!PlatformClient::should_retry(200));
    }

    #[test]
    fn test_map_status() {
        assert!(PlatformClient::map_status(StatusCode::OK).is_none());
        assert!(matches!(
            PlatformClient::map_status(StatusCode::UNAUTHORIZED),
            Some(ApiError::AuthExpired)
        ));
        assert!(matches!(
            PlatformClient::map_status(StatusCode::TOO_MANY_REQUESTS),
            Some(ApiError::RateLimited)
        ));
        assert!(matches!(
            PlatformClient::map_status(StatusCode::BAD_GATEWAY),
            Some(ApiError::ServerError(502))
        ));
    }

    #[test]
    fn test_url_joining() {
        let config = Config::default();
        let client = PlatformClient::with_base_url(&config, "http://localhost:8080/").unwrap();
        assert_eq!(client.url("/a/b"), "http://localhost:8080/a/b");
        assert_eq!(client.url("https://other.example/x"), "https://other.example/x");
    }

    #[test]
    fn test_headers_include_account_credentials() {
        let config = Config::default();
        let client = PlatformClient::new(&config).unwrap();

        let mut account = AccountSession::new("alice", "alice@example.com");
        account.session_cookie = Some("JSESSIONID=abc".into());
        account.token = Some("Bearer t0k3n".into());

        let headers = client.headers(Some(&account));
        assert_eq!(headers.get(COOKIE).unwrap(), "JSESSIONID=abc");
        assert_eq!(
            headers.get(reqwest::header::AUTHORIZATION).unwrap(),
            "Bearer t0k3n"
        );
        assert!(headers.contains_key(USER_AGENT));
        assert!(headers.contains_key(REFERER));
    }

    #[test]
    fn test_field_types_extraction() {
        let detail = serde_json::json!({
            "venueName": "气膜体育中心",
            "fieldTypeList": [
                {"id": "f-1", "fieldTypeName": "羽毛球"},
                {"id": "f-2", "name": "篮球"},
                {"bogus": true}
            ]
        });
        let types = PlatformClient::field_types(&detail);
        assert_eq!(types.len(), 2);
        assert_eq!(types[0].name, "羽毛球");
        assert_eq!(types[1].id, "f-2");
    }

    #[test]
    fn test_loose_string() {
        let v = serde_json::json!({"a": "", "b": 7, "c": "x"});
        assert_eq!(loose_string(&v, &["a", "b"]), Some("7".into()));
        assert_eq!(loose_string(&v, &["a", "c"]), Some("x".into()));
        assert_eq!(loose_string(&v, &["missing"]), None);
    }
}
