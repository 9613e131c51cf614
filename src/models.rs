// Core data structures for the courtside booking core

use chrono::{NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::Preset;
use crate::utils::error::ParseError;

/// The resource being booked: one venue + field-type pair.
///
/// Immutable once resolved for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub venue_id: String,
    pub field_type_id: String,
    pub venue_name: Option<String>,
    pub field_type_name: Option<String>,
}

impl Target {
    pub fn new(venue_id: impl Into<String>, field_type_id: impl Into<String>) -> Self {
        Self {
            venue_id: venue_id.into(),
            field_type_id: field_type_id.into(),
            venue_name: None,
            field_type_name: None,
        }
    }

    pub fn from_preset(preset: &Preset) -> Self {
        Self {
            venue_id: preset.venue_id.clone(),
            field_type_id: preset.field_type_id.clone(),
            venue_name: Some(preset.venue_name.clone()),
            field_type_name: Some(preset.field_type_name.clone()),
        }
    }

    /// Human-readable label for logs
    pub fn label(&self) -> String {
        match (&self.venue_name, &self.field_type_name) {
            (Some(v), Some(f)) => format!("{v} / {f}"),
            _ => format!("{} / {}", self.venue_id, self.field_type_id),
        }
    }
}

/// Raw per-sub-site slot record as the platform returns it.
///
/// The upstream API is loosely typed: field names vary between deployments
/// and numbers arrive as strings. This struct is the permissive serde
/// target; [`Slot::from_raw`] is the strict boundary that fails closed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSlot {
    #[serde(alias = "detailId", alias = "timeId", alias = "siteId")]
    pub id: Option<Value>,

    #[serde(
        alias = "startTime",
        alias = "beginTime",
        alias = "startHour",
        alias = "timeStart"
    )]
    pub start: Option<Value>,

    #[serde(
        alias = "endTime",
        alias = "finishTime",
        alias = "endHour",
        alias = "timeEnd"
    )]
    pub end: Option<Value>,

    #[serde(alias = "left", alias = "availableNumber")]
    pub remain: Option<Value>,

    #[serde(alias = "amount")]
    pub price: Option<Value>,

    #[serde(alias = "isFull")]
    pub is_full: Option<Value>,

    pub status: Option<Value>,

    #[serde(alias = "subSiteId")]
    pub sub_site_id: Option<Value>,

    #[serde(alias = "subSitename", alias = "subSiteName")]
    pub sub_site_name: Option<String>,

    pub sign: Option<String>,

    #[serde(alias = "orderId")]
    pub order_id: Option<Value>,
}

/// One concrete orderable time window at one sub-site
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub slot_id: String,
    pub sub_site_id: String,
    pub sub_site_name: String,

    /// Server-issued authorization token scoped to this exact sub-site and
    /// window. Short-lived; always re-fetched immediately before submission.
    pub sign: Option<String>,

    pub remain: Option<u32>,
    pub price: Option<f64>,
    pub available: bool,

    /// Direct order id, when the platform exposes the simple-submit path
    pub order_id: Option<String>,
}

impl Slot {
    /// Parse a raw upstream record into a typed slot.
    ///
    /// Fails closed: records whose time labels cannot be normalized are a
    /// [`ParseError`], not a silently defaulted slot. `index` is the
    /// record's position in the response, used to decode positional
    /// `slot-N` labels.
    pub fn from_raw(raw: &RawSlot, date: NaiveDate, index: usize) -> Result<Self, ParseError> {
        let start_label = value_string(&raw.start).ok_or(ParseError::MissingField("startTime"))?;
        let start = normalize_time_label(&start_label, index)?;
        let end = match value_string(&raw.end) {
            Some(label) => normalize_time_label(&label, index + 1)?,
            // One-hour slots are the platform norm; the end label is
            // sometimes simply absent.
            None => plus_one_hour(start),
        };

        let remain = value_u32(&raw.remain);
        let is_full = match &raw.is_full {
            Some(Value::String(s)) if s.chars().all(|c| c.is_ascii_digit()) => s != "0",
            Some(v) => value_bool(v),
            None => false,
        };
        let available = value_bool_opt(&raw.status)
            || remain.map(|r| r > 0).unwrap_or(false)
            || !is_full && raw.is_full.is_some();

        let sub_site_id = value_string(&raw.sub_site_id).unwrap_or_default();
        let slot_id = value_string(&raw.id)
            .unwrap_or_else(|| format!("{}:{}-{}", date, start.format("%H:%M"), end.format("%H:%M")));

        Ok(Self {
            date,
            start,
            end,
            slot_id,
            sub_site_name: raw.sub_site_name.clone().unwrap_or_default(),
            sub_site_id,
            sign: raw.sign.clone().filter(|s| !s.is_empty()),
            remain,
            price: value_f64(&raw.price),
            available,
            order_id: value_string(&raw.order_id),
        })
    }

    /// Whether this slot can be targeted by an order right now
    pub fn is_bookable(&self) -> bool {
        self.available && self.remain.map(|r| r > 0).unwrap_or(true) && self.sign.is_some()
    }

    /// `HH:MM-HH:MM` label used in the order payload
    pub fn schedule_time(&self) -> String {
        format!(
            "{}-{}",
            self.start.format("%H:%M"),
            self.end.format("%H:%M")
        )
    }

    pub fn start_hour(&self) -> u8 {
        self.start.hour() as u8
    }
}

/// Aggregation of same-time-window slots across sub-sites
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,

    /// Number of distinct sub-sites offering this window
    pub site_count: u32,

    /// Sub-sites with remaining capacity
    pub available_count: u32,

    /// Sum of remaining capacity across sub-sites
    pub total_remain: u32,

    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
}

impl AvailabilityWindow {
    pub fn is_available(&self) -> bool {
        self.available_count > 0
    }

    pub fn start_hour(&self) -> u8 {
        self.start.hour() as u8
    }
}

/// Group slots by `(date, start, end)` into availability windows.
///
/// Windows with zero available sub-sites are retained, marked unavailable;
/// display callers may filter them out.
pub fn aggregate(slots: &[Slot]) -> Vec<AvailabilityWindow> {
    let mut grouped: BTreeMap<(NaiveDate, NaiveTime, NaiveTime), AvailabilityWindow> =
        BTreeMap::new();

    for slot in slots {
        let window = grouped
            .entry((slot.date, slot.start, slot.end))
            .or_insert_with(|| AvailabilityWindow {
                date: slot.date,
                start: slot.start,
                end: slot.end,
                site_count: 0,
                available_count: 0,
                total_remain: 0,
                min_price: None,
                max_price: None,
            });

        window.site_count += 1;
        let remain = slot.remain.unwrap_or(if slot.available { 1 } else { 0 });
        if remain > 0 {
            window.available_count += 1;
            window.total_remain += remain;
        }
        if let Some(price) = slot.price {
            window.min_price = Some(window.min_price.map_or(price, |p: f64| p.min(price)));
            window.max_price = Some(window.max_price.map_or(price, |p: f64| p.max(price)));
        }
    }

    grouped.into_values().collect()
}

/// Outcome of one order submission attempt, consumed by the failover router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// Order accepted; carries the platform's order identifier
    Success { order_id: String },

    /// Platform throttled this account; rotate and reissue
    RateLimited,

    /// Sign rejected or capacity consumed; re-poll before retrying
    SlotGone,

    /// Session cookie/token rejected; re-login before retrying
    AuthExpired,

    /// Anything else; a booking-level failure for this account
    Fatal(String),
}

impl SubmissionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Decoded platform response to an order submission
#[derive(Debug, Clone)]
pub struct OrderResponse {
    pub code: Option<i64>,
    pub msg: String,
    pub order_id: Option<String>,
}

/// Normalize the platform's three observed time label formats to a time:
/// `HH:MM`, bare `HHMM` digit strings, and positional `slot-N` labels where
/// slot 0 is 07:00.
pub fn normalize_time_label(label: &str, index: usize) -> Result<NaiveTime, ParseError> {
    let text = label.trim();

    if let Some(suffix) = text.strip_prefix("slot-") {
        if suffix.chars().all(|c| c.is_ascii_digit()) && !suffix.is_empty() {
            let hour = (7 + suffix.parse::<u32>().unwrap_or(index as u32)) % 24;
            return NaiveTime::from_hms_opt(hour, 0, 0)
                .ok_or_else(|| ParseError::InvalidTimeLabel(label.to_string()));
        }
        return Err(ParseError::InvalidTimeLabel(label.to_string()));
    }

    if text.len() == 4 && text.chars().all(|c| c.is_ascii_digit()) {
        let hour: u32 = text[..2].parse().unwrap_or(99);
        let minute: u32 = text[2..].parse().unwrap_or(99);
        return NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or_else(|| ParseError::InvalidTimeLabel(label.to_string()));
    }

    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() >= 2 {
        let hour: u32 = parts[0]
            .parse()
            .map_err(|_| ParseError::InvalidTimeLabel(label.to_string()))?;
        let minute: u32 = parts[1]
            .parse()
            .map_err(|_| ParseError::InvalidTimeLabel(label.to_string()))?;
        return NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or_else(|| ParseError::InvalidTimeLabel(label.to_string()));
    }

    // Bare hour, e.g. "18"
    if text.chars().all(|c| c.is_ascii_digit()) && !text.is_empty() {
        let hour: u32 = text
            .parse()
            .map_err(|_| ParseError::InvalidTimeLabel(label.to_string()))?;
        return NaiveTime::from_hms_opt(hour, 0, 0)
            .ok_or_else(|| ParseError::InvalidTimeLabel(label.to_string()));
    }

    Err(ParseError::InvalidTimeLabel(label.to_string()))
}

fn plus_one_hour(t: NaiveTime) -> NaiveTime {
    NaiveTime::from_hms_opt((t.hour() + 1) % 24, t.minute(), 0).unwrap_or(t)
}

/// Pull the first embedded list out of the platform's envelope-happy JSON.
///
/// Responses wrap payloads in any of several list keys; some deployments
/// nest them one level deeper.
pub fn extract_first_list(payload: &Value) -> Option<&Vec<Value>> {
    const LIST_KEYS: &[&str] = &[
        "data", "list", "rows", "records", "items", "content", "results", "result",
    ];

    match payload {
        Value::Array(items) => Some(items),
        Value::Object(map) => {
            for key in LIST_KEYS {
                if let Some(inner) = map.get(*key) {
                    if let Some(list) = extract_first_list(inner) {
                        return Some(list);
                    }
                }
            }
            map.values().find_map(|v| match v {
                Value::Array(items) => Some(items),
                _ => None,
            })
        }
        _ => None,
    }
}

fn value_string(value: &Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn value_u32(value: &Option<Value>) -> Option<u32> {
    match value {
        Some(Value::Number(n)) => n.as_u64().map(|v| v as u32),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_f64(value: &Option<Value>) -> Option<f64> {
    match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|v| v > 0.0).unwrap_or(false),
        Value::String(s) => matches!(
            s.to_lowercase().as_str(),
            "1" | "true" | "y" | "yes" | "available" | "idle"
        ),
        _ => false,
    }
}

fn value_bool_opt(value: &Option<Value>) -> bool {
    value.as_ref().map(value_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 14).unwrap()
    }

    fn raw(json: serde_json::Value) -> RawSlot {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_normalize_colon_label() {
        assert_eq!(
            normalize_time_label("18:00", 0).unwrap(),
            NaiveTime::from_hms_opt(18, 0, 0).unwrap()
        );
        assert_eq!(
            normalize_time_label("8:30", 0).unwrap(),
            NaiveTime::from_hms_opt(8, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_normalize_digit_label() {
        assert_eq!(
            normalize_time_label("0730", 0).unwrap(),
            NaiveTime::from_hms_opt(7, 30, 0).unwrap()
        );
        assert_eq!(
            normalize_time_label("21", 0).unwrap(),
            NaiveTime::from_hms_opt(21, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_normalize_positional_label() {
        // slot-0 is 07:00, slot-11 is 18:00
        assert_eq!(
            normalize_time_label("slot-0", 0).unwrap(),
            NaiveTime::from_hms_opt(7, 0, 0).unwrap()
        );
        assert_eq!(
            normalize_time_label("slot-11", 11).unwrap(),
            NaiveTime::from_hms_opt(18, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize_time_label("whenever", 0).is_err());
        assert!(normalize_time_label("25:00", 0).is_err());
        assert!(normalize_time_label("slot-x", 0).is_err());
    }

    #[test]
    fn test_slot_from_raw_fails_closed_without_start() {
        let record = raw(serde_json::json!({"remain": 3}));
        let err = Slot::from_raw(&record, sample_date(), 0).unwrap_err();
        assert!(matches!(err, ParseError::MissingField(_)));
    }

    #[test]
    fn test_slot_from_raw_with_string_numbers() {
        let record = raw(serde_json::json!({
            "startTime": "18:00",
            "endTime": "19:00",
            "remain": "2",
            "price": "40.0",
            "subSiteId": "s-7",
            "sign": "abc123",
            "isFull": "0"
        }));
        let slot = Slot::from_raw(&record, sample_date(), 0).unwrap();
        assert_eq!(slot.remain, Some(2));
        assert_eq!(slot.price, Some(40.0));
        assert!(slot.available);
        assert!(slot.is_bookable());
        assert_eq!(slot.schedule_time(), "18:00-19:00");
    }

    #[test]
    fn test_slot_without_sign_is_not_bookable() {
        let record = raw(serde_json::json!({
            "startTime": "18:00",
            "endTime": "19:00",
            "remain": 1
        }));
        let slot = Slot::from_raw(&record, sample_date(), 0).unwrap();
        assert!(slot.available);
        assert!(!slot.is_bookable());
    }

    #[test]
    fn test_missing_end_defaults_to_one_hour() {
        let record = raw(serde_json::json!({"startTime": "20:00", "remain": 1}));
        let slot = Slot::from_raw(&record, sample_date(), 0).unwrap();
        assert_eq!(slot.end, NaiveTime::from_hms_opt(21, 0, 0).unwrap());
    }

    #[test]
    fn test_aggregate_merges_sub_sites() {
        let a = raw(serde_json::json!({
            "startTime": "18:00", "endTime": "19:00",
            "remain": 2, "subSiteId": "s-1", "price": 30.0, "sign": "x"
        }));
        let b = raw(serde_json::json!({
            "startTime": "18:00", "endTime": "19:00",
            "remain": 1, "subSiteId": "s-2", "price": 50.0, "sign": "y"
        }));
        let slots = vec![
            Slot::from_raw(&a, sample_date(), 0).unwrap(),
            Slot::from_raw(&b, sample_date(), 0).unwrap(),
        ];

        let windows = aggregate(&slots);
        assert_eq!(windows.len(), 1);
        let window = &windows[0];
        assert_eq!(window.site_count, 2);
        assert_eq!(window.available_count, 2);
        assert_eq!(window.total_remain, 3);
        assert_eq!(window.min_price, Some(30.0));
        assert_eq!(window.max_price, Some(50.0));
    }

    #[test]
    fn test_aggregate_retains_full_windows() {
        let full = raw(serde_json::json!({
            "startTime": "10:00", "endTime": "11:00",
            "remain": 0, "subSiteId": "s-1", "isFull": "1"
        }));
        let slots = vec![Slot::from_raw(&full, sample_date(), 0).unwrap()];

        let windows = aggregate(&slots);
        assert_eq!(windows.len(), 1);
        assert!(!windows[0].is_available());
        assert_eq!(windows[0].site_count, 1);
    }

    #[test]
    fn test_aggregate_separates_distinct_windows() {
        let a = raw(serde_json::json!({
            "startTime": "18:00", "endTime": "19:00", "remain": 1, "subSiteId": "s-1"
        }));
        let b = raw(serde_json::json!({
            "startTime": "19:00", "endTime": "20:00", "remain": 1, "subSiteId": "s-1"
        }));
        let slots = vec![
            Slot::from_raw(&a, sample_date(), 0).unwrap(),
            Slot::from_raw(&b, sample_date(), 0).unwrap(),
        ];
        assert_eq!(aggregate(&slots).len(), 2);
    }

    #[test]
    fn test_extract_first_list_prefers_known_keys() {
        let payload = serde_json::json!({"meta": 1, "data": {"rows": [1, 2, 3]}});
        let list = extract_first_list(&payload).unwrap();
        assert_eq!(list.len(), 3);

        let bare = serde_json::json!([1, 2]);
        assert_eq!(extract_first_list(&bare).unwrap().len(), 2);

        let none = serde_json::json!({"count": 0});
        assert!(extract_first_list(&none).is_none());
    }

    #[test]
    fn test_target_label() {
        let mut target = Target::new("v-1", "f-1");
        assert_eq!(target.label(), "v-1 / f-1");
        target.venue_name = Some("Gym".into());
        target.field_type_name = Some("Badminton".into());
        assert_eq!(target.label(), "Gym / Badminton");
    }
}
