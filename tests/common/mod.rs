//! Shared helpers for integration tests

use chrono::{Duration, NaiveDate, NaiveTime, Utc};
use courtside::config::Config;
use courtside::credentials::AccountSession;
use courtside::models::{Slot, Target};

/// Config tuned for tests: fast retries, no real backoff
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.client.base_delay_ms = 1;
    config.client.request_timeout_secs = 5;
    config.client.order_timeout_secs = 5;
    config.client.rate_limit = 1000;
    config
}

pub fn test_target() -> Target {
    Target {
        venue_id: "venue-1".into(),
        field_type_id: "field-1".into(),
        venue_name: Some("Test Gym".into()),
        field_type_name: Some("Badminton".into()),
    }
}

pub fn test_account(nickname: &str) -> AccountSession {
    let mut account = AccountSession::new(nickname, format!("{nickname}@example.com"));
    account.session_cookie = Some(format!("JSESSIONID={nickname}-cookie"));
    account.expires_at = Some(Utc::now() + Duration::hours(4));
    account
}

pub fn test_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 14).unwrap()
}

pub fn test_slot(date: NaiveDate, hour: u32, sub_site: &str, remain: u32, sign: &str) -> Slot {
    Slot {
        date,
        start: NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
        end: NaiveTime::from_hms_opt((hour + 1) % 24, 0, 0).unwrap(),
        slot_id: format!("{sub_site}-{hour}"),
        sub_site_id: sub_site.to_string(),
        sub_site_name: format!("site {sub_site}"),
        sign: (!sign.is_empty()).then(|| sign.to_string()),
        remain: Some(remain),
        price: Some(40.0),
        available: remain > 0,
        order_id: None,
    }
}
