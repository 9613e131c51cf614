//! Slot polling, normalization and aggregation
//!
//! A [`SlotMonitor`] watches one target: it fetches raw per-sub-site slot
//! records for a date, normalizes them into typed [`Slot`]s and folds
//! duplicate sub-sites into per-time-window availability summaries.
//!
//! Polling is cost-aware: the cheap reserve-summary endpoint is consulted
//! first, and the expensive detail query only runs when the summary shows
//! availability or its fingerprint changed since the previous tick.

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::{self, Stream};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::client::PlatformClient;
use crate::credentials::AccountSession;
use crate::models::{aggregate, extract_first_list, AvailabilityWindow, Slot, Target};
use crate::utils::error::BookingError;

/// Source of slot data, implemented by the platform client and by test fakes
#[async_trait]
pub trait SlotSource: Send + Sync {
    /// Dates currently on sale for the target, with per-date tokens
    async fn available_dates(
        &self,
        target: &Target,
    ) -> Result<Vec<(NaiveDate, Option<String>)>, BookingError>;

    /// One round trip for one date; empty means confirmed no slots
    async fn day_slots(
        &self,
        target: &Target,
        date: NaiveDate,
        date_token: Option<&str>,
    ) -> Result<Vec<Slot>, BookingError>;

    /// Cheap availability summary for change detection
    async fn reserve_summary(
        &self,
        target: &Target,
        date: NaiveDate,
    ) -> Result<Value, BookingError>;
}

/// A platform client bound to one account's session
pub struct SessionSource {
    pub client: Arc<PlatformClient>,
    pub account: AccountSession,
}

#[async_trait]
impl SlotSource for SessionSource {
    async fn available_dates(
        &self,
        target: &Target,
    ) -> Result<Vec<(NaiveDate, Option<String>)>, BookingError> {
        Ok(self.client.available_dates(target, &self.account).await?)
    }

    async fn day_slots(
        &self,
        target: &Target,
        date: NaiveDate,
        date_token: Option<&str>,
    ) -> Result<Vec<Slot>, BookingError> {
        self.client
            .day_slots(target, date, date_token, &self.account)
            .await
    }

    async fn reserve_summary(
        &self,
        target: &Target,
        date: NaiveDate,
    ) -> Result<Value, BookingError> {
        Ok(self.client.reserve_summary(target, date, &self.account).await?)
    }
}

/// Normalized row of the reserve summary, used only for fingerprinting
#[derive(Debug)]
struct SummaryRow {
    label: String,
    available: bool,
}

/// Monitors one target's availability
pub struct SlotMonitor<S: SlotSource> {
    source: S,
    target: Target,

    /// Per-date fingerprint of the last seen summary
    fingerprints: HashMap<NaiveDate, String>,
}

impl<S: SlotSource> SlotMonitor<S> {
    pub fn new(source: S, target: Target) -> Self {
        Self {
            source,
            target,
            fingerprints: HashMap::new(),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Fetch and normalize one date's slots
    pub async fn fetch_day(
        &self,
        date: NaiveDate,
        date_token: Option<&str>,
    ) -> Result<Vec<Slot>, BookingError> {
        let slots = self.source.day_slots(&self.target, date, date_token).await?;
        debug!(
            date = %date,
            slots = slots.len(),
            target = %self.target.label(),
            "Fetched day slots"
        );
        Ok(slots)
    }

    /// One poll tick for one date, with the summary pre-check.
    ///
    /// Returns the aggregated windows, or an empty list when the summary
    /// proves nothing changed and nothing is available.
    pub async fn poll_once(
        &mut self,
        date: NaiveDate,
        date_token: Option<&str>,
    ) -> Result<Vec<AvailabilityWindow>, BookingError> {
        match self.source.reserve_summary(&self.target, date).await {
            Ok(summary) => {
                let rows = normalize_summary(&summary);
                let any_available = rows.iter().any(|r| r.available);
                let fingerprint = fingerprint_rows(&rows);
                let changed = self
                    .fingerprints
                    .insert(date, fingerprint.clone())
                    .map(|prev| prev != fingerprint)
                    .unwrap_or(true);

                if !rows.is_empty() && !any_available && !changed {
                    debug!(date = %date, "Summary unchanged and full; skipping detail query");
                    return Ok(Vec::new());
                }
            }
            Err(e) => {
                // The summary is an optimization; the detail query decides.
                warn!(date = %date, error = %e, "Reserve summary unavailable");
            }
        }

        let slots = self.fetch_day(date, date_token).await?;
        Ok(aggregate(&slots))
    }

    /// Lazily scan every date the platform sells, yielding per-date window
    /// aggregates as they arrive.
    ///
    /// The sequence is restartable: a rerun re-issues the same day-by-day
    /// fetch; there is no checkpoint.
    pub fn scan_all_dates(
        &self,
    ) -> impl Stream<Item = Result<(NaiveDate, Vec<AvailabilityWindow>), BookingError>> + '_ {
        enum ScanState {
            Start,
            Dates(VecDeque<(NaiveDate, Option<String>)>),
        }

        stream::try_unfold(ScanState::Start, move |state| async move {
            let mut queue = match state {
                ScanState::Start => self
                    .source
                    .available_dates(&self.target)
                    .await?
                    .into_iter()
                    .collect::<VecDeque<_>>(),
                ScanState::Dates(queue) => queue,
            };

            let Some((date, token)) = queue.pop_front() else {
                return Ok(None);
            };
            let slots = self.fetch_day(date, token.as_deref()).await?;
            Ok(Some(((date, aggregate(&slots)), ScanState::Dates(queue))))
        })
    }
}

fn normalize_summary(summary: &Value) -> Vec<SummaryRow> {
    let Some(items) = extract_first_list(summary) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let field = text_of(obj.get("field").or_else(|| obj.get("subSitename")));
            let start = text_of(obj.get("start").or_else(|| obj.get("startTime")));
            let end = text_of(obj.get("end").or_else(|| obj.get("endTime")));
            let status = text_of(obj.get("status"));

            let remain = obj
                .get("remain")
                .or_else(|| obj.get("left"))
                .and_then(Value::as_i64);
            let available_flag = match obj.get("available").or_else(|| obj.get("isFull")) {
                Some(Value::Bool(b)) => *b,
                Some(Value::String(s)) if obj.contains_key("isFull") => s == "0",
                Some(Value::Number(n)) if obj.contains_key("isFull") => n.as_i64() == Some(0),
                Some(Value::String(s)) => matches!(s.as_str(), "1" | "true" | "available"),
                _ => false,
            };
            let available = available_flag && remain.map(|r| r > 0).unwrap_or(true);

            Some(SummaryRow {
                label: format!("{field}|{start}|{end}|{:?}|{status}|{available}", remain),
                available,
            })
        })
        .collect()
}

fn fingerprint_rows(rows: &[SummaryRow]) -> String {
    let mut labels: Vec<&str> = rows.iter().map(|r| r.label.as_str()).collect();
    labels.sort_unstable();

    let mut hasher = Sha256::new();
    for label in labels {
        hasher.update(label.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

fn text_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
    }

    fn slot(date: NaiveDate, hour: u32, sub_site: &str, remain: u32) -> Slot {
        Slot {
            date,
            start: chrono::NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
            end: chrono::NaiveTime::from_hms_opt(hour + 1, 0, 0).unwrap(),
            slot_id: format!("{sub_site}-{hour}"),
            sub_site_id: sub_site.to_string(),
            sub_site_name: sub_site.to_string(),
            sign: Some(format!("sign-{sub_site}-{hour}")),
            remain: Some(remain),
            price: Some(30.0),
            available: remain > 0,
            order_id: None,
        }
    }

    /// Fake source with a scripted per-call slot feed
    struct FakeSource {
        dates: Vec<(NaiveDate, Option<String>)>,
        slots: Vec<Slot>,
        summary: Value,
        detail_calls: AtomicU32,
        summary_calls: AtomicU32,
    }

    impl FakeSource {
        fn new(slots: Vec<Slot>, summary: Value) -> Self {
            Self {
                dates: vec![(date(14), None), (date(15), Some("tok".into()))],
                slots,
                summary,
                detail_calls: AtomicU32::new(0),
                summary_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SlotSource for FakeSource {
        async fn available_dates(
            &self,
            _target: &Target,
        ) -> Result<Vec<(NaiveDate, Option<String>)>, BookingError> {
            Ok(self.dates.clone())
        }

        async fn day_slots(
            &self,
            _target: &Target,
            date: NaiveDate,
            _token: Option<&str>,
        ) -> Result<Vec<Slot>, BookingError> {
            self.detail_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.slots.iter().filter(|s| s.date == date).cloned().collect())
        }

        async fn reserve_summary(
            &self,
            _target: &Target,
            _date: NaiveDate,
        ) -> Result<Value, BookingError> {
            self.summary_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.summary.clone())
        }
    }

    fn full_summary() -> Value {
        serde_json::json!({"data": [
            {"field": "A", "start": "18:00", "end": "19:00", "remain": 0, "available": false},
        ]})
    }

    fn open_summary() -> Value {
        serde_json::json!({"data": [
            {"field": "A", "start": "18:00", "end": "19:00", "remain": 2, "available": true},
        ]})
    }

    #[tokio::test]
    async fn test_poll_skips_detail_when_summary_unchanged_and_full() {
        let source = FakeSource::new(vec![slot(date(14), 18, "s-1", 1)], full_summary());
        let mut monitor = SlotMonitor::new(source, Target::new("v", "f"));

        // First tick: fingerprint is new, detail query runs
        let first = monitor.poll_once(date(14), None).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(monitor.source().detail_calls.load(Ordering::SeqCst), 1);

        // Second tick: same full summary, detail query skipped
        let second = monitor.poll_once(date(14), None).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(monitor.source().detail_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_poll_fetches_detail_when_summary_shows_availability() {
        let source = FakeSource::new(vec![slot(date(14), 18, "s-1", 2)], open_summary());
        let mut monitor = SlotMonitor::new(source, Target::new("v", "f"));

        for _ in 0..2 {
            let windows = monitor.poll_once(date(14), None).await.unwrap();
            assert_eq!(windows.len(), 1);
            assert!(windows[0].is_available());
        }
        // Availability forces the detail query every tick
        assert_eq!(monitor.source().detail_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_scan_all_dates_yields_per_date() {
        let slots = vec![
            slot(date(14), 18, "s-1", 1),
            slot(date(14), 18, "s-2", 2),
            slot(date(15), 19, "s-1", 1),
        ];
        let source = FakeSource::new(slots, open_summary());
        let monitor = SlotMonitor::new(source, Target::new("v", "f"));

        let results: Vec<_> = monitor.scan_all_dates().collect().await;
        assert_eq!(results.len(), 2);

        let (first_date, first_windows) = results[0].as_ref().unwrap();
        assert_eq!(*first_date, date(14));
        assert_eq!(first_windows.len(), 1);
        assert_eq!(first_windows[0].site_count, 2);
        assert_eq!(first_windows[0].total_remain, 3);

        let (second_date, second_windows) = results[1].as_ref().unwrap();
        assert_eq!(*second_date, date(15));
        assert_eq!(second_windows.len(), 1);
    }

    #[test]
    fn test_fingerprint_is_order_insensitive() {
        let a = vec![
            SummaryRow { label: "x".into(), available: false },
            SummaryRow { label: "y".into(), available: false },
        ];
        let b = vec![
            SummaryRow { label: "y".into(), available: false },
            SummaryRow { label: "x".into(), available: false },
        ];
        assert_eq!(fingerprint_rows(&a), fingerprint_rows(&b));

        let c = vec![SummaryRow { label: "z".into(), available: false }];
        assert_ne!(fingerprint_rows(&a), fingerprint_rows(&c));
    }

    #[test]
    fn test_normalize_summary_is_full_semantics() {
        let summary = serde_json::json!({"rows": [
            {"subSitename": "A", "startTime": "18:00", "isFull": "0", "remain": 1},
            {"subSitename": "B", "startTime": "19:00", "isFull": "1", "remain": 0},
        ]});
        let rows = normalize_summary(&summary);
        assert_eq!(rows.len(), 2);
        assert!(rows[0].available);
        assert!(!rows[1].available);
    }
}
