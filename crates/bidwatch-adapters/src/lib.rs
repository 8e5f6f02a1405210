//! Procurement-portal adapter: search filters, paginated listing fetch and detail enrichment.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bidwatch_core::{DetailPayload, EnrichedRecord, ListingRecord};
use bidwatch_storage::{retry_with_backoff, ArtifactStore, BackoffPolicy, FetchError, JsonTransport};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "bidwatch-adapters";

pub const SEARCH_INDEX: &str = "es-contractor-selection";
pub const NOTICE_TYPE: &str = "es-notify-contractor";

/// Result status of a closed notice, with the portal's status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoticeStatus {
    UnderEvaluation,
    WinnerSelected,
    NoWinner,
    Cancelled,
    NotOpened,
    Invalidated,
    NotRecognized,
    Suspended,
}

impl NoticeStatus {
    pub fn code(&self) -> &'static str {
        match self {
            NoticeStatus::UnderEvaluation => "DXT",
            NoticeStatus::WinnerSelected => "CNTTT",
            NoticeStatus::NoWinner => "KCNTTT",
            NoticeStatus::Cancelled => "DHT",
            NoticeStatus::NotOpened => "",
            NoticeStatus::Invalidated => "VHH",
            NoticeStatus::NotRecognized => "KCN",
            NoticeStatus::Suspended => "DC",
        }
    }
}

/// Which notices a crawl asks for. Parsed from the portal's own filter keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoticeFilter {
    All,
    NotYetClosed,
    Closed,
    Status(NoticeStatus),
}

#[derive(Debug, Error)]
#[error("unknown notice filter {0:?}")]
pub struct UnknownNoticeFilter(pub String);

impl FromStr for NoticeFilter {
    type Err = UnknownNoticeFilter;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let filter = match s.trim() {
            "" | "tatCa" => NoticeFilter::All,
            "chuaDongThau" => NoticeFilter::NotYetClosed,
            "daDongThau" => NoticeFilter::Closed,
            "dangXetThau" => NoticeFilter::Status(NoticeStatus::UnderEvaluation),
            "coNhaThauTrungThau" => NoticeFilter::Status(NoticeStatus::WinnerSelected),
            "khongCoNhaThauTrungThau" => NoticeFilter::Status(NoticeStatus::NoWinner),
            "daHuyThau" => NoticeFilter::Status(NoticeStatus::Cancelled),
            "chuaMoThau" => NoticeFilter::Status(NoticeStatus::NotOpened),
            "tuyenBoVoHieuQuyetDinhVeKqlcnt" => NoticeFilter::Status(NoticeStatus::Invalidated),
            "khongCongNhanKqlcnt" => NoticeFilter::Status(NoticeStatus::NotRecognized),
            "dinhChiCuocThau" => NoticeFilter::Status(NoticeStatus::Suspended),
            other => return Err(UnknownNoticeFilter(other.to_string())),
        };
        Ok(filter)
    }
}

impl NoticeFilter {
    pub fn key(&self) -> &'static str {
        match self {
            NoticeFilter::All => "tatCa",
            NoticeFilter::NotYetClosed => "chuaDongThau",
            NoticeFilter::Closed => "daDongThau",
            NoticeFilter::Status(NoticeStatus::UnderEvaluation) => "dangXetThau",
            NoticeFilter::Status(NoticeStatus::WinnerSelected) => "coNhaThauTrungThau",
            NoticeFilter::Status(NoticeStatus::NoWinner) => "khongCoNhaThauTrungThau",
            NoticeFilter::Status(NoticeStatus::Cancelled) => "daHuyThau",
            NoticeFilter::Status(NoticeStatus::NotOpened) => "chuaMoThau",
            NoticeFilter::Status(NoticeStatus::Invalidated) => "tuyenBoVoHieuQuyetDinhVeKqlcnt",
            NoticeFilter::Status(NoticeStatus::NotRecognized) => "khongCongNhanKqlcnt",
            NoticeFilter::Status(NoticeStatus::Suspended) => "dinhChiCuocThau",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchFilter {
    pub field_name: String,
    pub search_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field_values: Option<Vec<String>>,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub range: Option<DateRange>,
}

impl SearchFilter {
    fn values(field_name: &str, search_type: &str, values: &[&str]) -> Self {
        Self {
            field_name: field_name.to_string(),
            search_type: search_type.to_string(),
            field_values: Some(values.iter().map(|v| v.to_string()).collect()),
            range: None,
        }
    }

    fn close_date(from: Option<String>, to: Option<String>) -> Self {
        Self {
            field_name: "bidCloseDate".to_string(),
            search_type: "range".to_string(),
            field_values: None,
            range: Some(DateRange { from, to }),
        }
    }
}

/// Filter list for the search request. `now` bounds the close-date ranges.
pub fn build_filters(filter: NoticeFilter, now: DateTime<Utc>) -> Vec<SearchFilter> {
    let mut filters = vec![
        SearchFilter::values("type", "in", &[NOTICE_TYPE]),
        SearchFilter::values("caseKHKQ", "not_in", &["1"]),
    ];
    let now = now.to_rfc3339_opts(SecondsFormat::Millis, true);

    match filter {
        NoticeFilter::All => {}
        NoticeFilter::NotYetClosed => filters.push(SearchFilter::close_date(Some(now), None)),
        NoticeFilter::Closed => filters.push(SearchFilter::close_date(None, Some(now))),
        // An empty status code carries no constraint of its own.
        NoticeFilter::Status(status) if status.code().is_empty() => {}
        NoticeFilter::Status(status) => {
            filters.push(SearchFilter::close_date(None, Some(now)));
            filters.push(SearchFilter::values("statusForNotify", "in", &[status.code()]));
        }
    }
    filters
}

pub fn search_payload(page: usize, page_size: usize, keyword: &str, filters: &[SearchFilter]) -> JsonValue {
    json!([{
        "pageSize": page_size,
        "pageNumber": page.to_string(),
        "query": [{
            "index": SEARCH_INDEX,
            "keyWord": keyword,
            "matchType": "all-1",
            "matchFields": ["notifyNo", "bidName"],
            "filters": filters,
        }],
    }])
}

/// Pulls `page.content` out of a search response; anything else is malformed.
/// Entries that are not listing objects are skipped with a warning.
pub fn parse_listing_page(url: &str, body: &JsonValue) -> Result<Vec<ListingRecord>, FetchError> {
    let content = body
        .get("page")
        .and_then(|page| page.get("content"))
        .and_then(JsonValue::as_array)
        .ok_or_else(|| FetchError::MalformedBody {
            url: url.to_string(),
            reason: "missing page.content array".to_string(),
        })?;

    Ok(content
        .iter()
        .enumerate()
        .filter_map(|(index, item)| match serde_json::from_value::<ListingRecord>(item.clone()) {
            Ok(listing) => Some(listing),
            Err(err) => {
                warn!(url, index, error = %err, "skipping unreadable listing");
                None
            }
        })
        .collect())
}

/// Fetches single pages of search results with retry and failure classification.
pub struct FetchScheduler {
    transport: Arc<dyn JsonTransport>,
    search_url: String,
    page_size: usize,
    backoff: BackoffPolicy,
}

impl FetchScheduler {
    /// `backoff.pre_attempt_delay` paces every page request, retries included.
    pub fn new(
        transport: Arc<dyn JsonTransport>,
        search_url: impl Into<String>,
        page_size: usize,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            transport,
            search_url: search_url.into(),
            page_size,
            backoff,
        }
    }

    pub async fn fetch_page(
        &self,
        page: usize,
        keyword: &str,
        filters: &[SearchFilter],
    ) -> Result<Vec<ListingRecord>, FetchError> {
        let payload = search_payload(page, self.page_size, keyword, filters);
        let label = format!("search page {page}");
        let transport = &self.transport;
        let url = self.search_url.as_str();
        let payload = &payload;
        retry_with_backoff(&self.backoff, &label, |_| async move {
            let body = transport.post_json(url, payload).await?;
            parse_listing_page(url, &body)
        })
        .await
    }

    pub fn pages(&self, keyword: &str, filters: Vec<SearchFilter>, limits: SequenceLimits) -> PageSequence<'_> {
        PageSequence::new(self, keyword, filters, limits)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageItem {
    Page { data: Vec<ListingRecord>, page: usize },
    /// Emitted exactly once, after which the sequence yields `None`.
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Exhausted,
    MaxPages,
    CircuitOpen,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceState {
    pub next_page: usize,
    pub consecutive_errors: usize,
    pub done: bool,
    pub finish: Option<FinishReason>,
    pub failed_pages: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct SequenceLimits {
    pub max_pages: usize,
    pub circuit_breaker_threshold: usize,
}

impl Default for SequenceLimits {
    fn default() -> Self {
        Self {
            max_pages: 200,
            circuit_breaker_threshold: 3,
        }
    }
}

/// Pull-based page iterator. Page `n + 1` is requested only once page `n` has
/// an outcome; a failed page is skipped and counted toward the circuit breaker.
pub struct PageSequence<'a> {
    scheduler: &'a FetchScheduler,
    keyword: String,
    filters: Vec<SearchFilter>,
    limits: SequenceLimits,
    state: SequenceState,
}

impl<'a> PageSequence<'a> {
    pub fn new(
        scheduler: &'a FetchScheduler,
        keyword: impl Into<String>,
        filters: Vec<SearchFilter>,
        limits: SequenceLimits,
    ) -> Self {
        Self {
            scheduler,
            keyword: keyword.into(),
            filters,
            limits,
            state: SequenceState::default(),
        }
    }

    pub fn state(&self) -> &SequenceState {
        &self.state
    }

    fn finish(&mut self, reason: FinishReason) -> Option<PageItem> {
        self.state.done = true;
        self.state.finish = Some(reason);
        Some(PageItem::Last)
    }

    pub async fn next(&mut self) -> Option<PageItem> {
        if self.state.done {
            return None;
        }

        loop {
            if self.state.next_page >= self.limits.max_pages {
                return self.finish(FinishReason::MaxPages);
            }

            let page = self.state.next_page;
            match self.scheduler.fetch_page(page, &self.keyword, &self.filters).await {
                Ok(data) => {
                    self.state.consecutive_errors = 0;
                    if data.is_empty() {
                        return self.finish(FinishReason::Exhausted);
                    }
                    self.state.next_page += 1;
                    return Some(PageItem::Page { data, page });
                }
                Err(err) => {
                    warn!(page, error = %err, "page fetch failed");
                    self.state.failed_pages.push(page);
                    self.state.consecutive_errors += 1;
                    self.state.next_page += 1;
                    if self.state.consecutive_errors >= self.limits.circuit_breaker_threshold {
                        warn!(
                            consecutive_errors = self.state.consecutive_errors,
                            "too many consecutive page failures, stopping crawl"
                        );
                        return self.finish(FinishReason::CircuitOpen);
                    }
                }
            }
        }
    }
}

/// Periodic snapshot of collected listings.
pub struct Checkpoint<'a> {
    pub store: &'a ArtifactStore,
    pub file_name: String,
    /// Snapshot after every `interval` pages; 0 disables checkpoints.
    pub interval: usize,
}

#[derive(Debug, Clone)]
pub struct CrawlOutcome {
    pub listings: Vec<ListingRecord>,
    pub pages: usize,
    pub finish: FinishReason,
    pub failed_pages: Vec<usize>,
    pub checkpoints_written: usize,
}

/// Drain `sequence`, accumulating listings and writing checkpoints as configured.
pub async fn crawl_listings(mut sequence: PageSequence<'_>, checkpoint: Option<Checkpoint<'_>>) -> CrawlOutcome {
    let mut listings = Vec::new();
    let mut pages = 0usize;
    let mut checkpoints_written = 0usize;

    while let Some(item) = sequence.next().await {
        let (data, page) = match item {
            PageItem::Page { data, page } => (data, page),
            PageItem::Last => break,
        };

        let added = data.len();
        listings.extend(data);
        pages += 1;
        info!(page, added, total = listings.len(), "page collected");

        if let Some(cp) = &checkpoint {
            if cp.interval > 0 && pages % cp.interval == 0 {
                match cp.store.write_json_pretty(&cp.file_name, &listings).await {
                    Ok(stored) => {
                        checkpoints_written += 1;
                        info!(path = %stored.path.display(), listings = listings.len(), "checkpoint written");
                    }
                    Err(err) => warn!(error = %err, "checkpoint write failed"),
                }
            }
        }
    }

    let state = sequence.state();
    let finish = state.finish.unwrap_or(FinishReason::Exhausted);
    info!(pages, listings = listings.len(), ?finish, "crawl finished");
    CrawlOutcome {
        listings,
        pages,
        finish,
        failed_pages: state.failed_pages.clone(),
        checkpoints_written,
    }
}

#[derive(Debug, Clone)]
pub struct EnrichmentOutcome {
    pub records: Vec<EnrichedRecord>,
    pub dropped: usize,
    pub detail_failures: usize,
}

enum ItemOutcome {
    Dropped,
    Enriched { record: EnrichedRecord, failed: bool },
}

/// Fetches detail payloads in fixed-size concurrent batches.
pub struct DetailEnricher {
    transport: Arc<dyn JsonTransport>,
    detail_url: String,
    backoff: BackoffPolicy,
    concurrency: usize,
    batch_delay: Duration,
}

impl DetailEnricher {
    pub fn new(
        transport: Arc<dyn JsonTransport>,
        detail_url: impl Into<String>,
        backoff: BackoffPolicy,
        concurrency: usize,
        batch_delay: Duration,
    ) -> Self {
        Self {
            transport,
            detail_url: detail_url.into(),
            backoff,
            concurrency: concurrency.max(1),
            batch_delay,
        }
    }

    pub async fn fetch_detail(&self, reference_id: &str) -> Result<DetailPayload, FetchError> {
        let body = json!({ "id": reference_id });
        let label = format!("detail {reference_id}");
        let transport = &self.transport;
        let url = self.detail_url.as_str();
        let body = &body;
        retry_with_backoff(&self.backoff, &label, |_| async move { transport.post_json(url, body).await })
            .await
            .map(DetailPayload::new)
    }

    async fn enrich_one(&self, listing: ListingRecord) -> ItemOutcome {
        let Some(reference_id) = listing.reference_id().map(str::to_string) else {
            warn!(
                notify_no = listing.notify_no.as_deref().unwrap_or_default(),
                "skipping listing without inputResultId"
            );
            return ItemOutcome::Dropped;
        };

        match self.fetch_detail(&reference_id).await {
            Ok(details) => ItemOutcome::Enriched {
                record: EnrichedRecord {
                    listing,
                    details: Some(details),
                },
                failed: false,
            },
            Err(err) => {
                warn!(reference_id, error = %err, "detail fetch failed, keeping listing without details");
                ItemOutcome::Enriched {
                    record: EnrichedRecord { listing, details: None },
                    failed: true,
                }
            }
        }
    }

    /// Batches run one after another; items inside a batch run concurrently.
    /// Output keeps input order.
    pub async fn enrich(&self, listings: Vec<ListingRecord>) -> EnrichmentOutcome {
        let total = listings.len();
        let mut records = Vec::with_capacity(total);
        let mut dropped = 0usize;
        let mut detail_failures = 0usize;
        let mut remaining = listings.into_iter().peekable();

        while remaining.peek().is_some() {
            let batch: Vec<ListingRecord> = remaining.by_ref().take(self.concurrency).collect();
            let results = join_all(batch.into_iter().map(|listing| self.enrich_one(listing))).await;

            for result in results {
                match result {
                    ItemOutcome::Dropped => dropped += 1,
                    ItemOutcome::Enriched { record, failed } => {
                        detail_failures += usize::from(failed);
                        records.push(record);
                    }
                }
            }
            info!(done = records.len() + dropped, total, "detail batch complete");

            if remaining.peek().is_some() && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
        }

        EnrichmentOutcome {
            records,
            dropped,
            detail_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    const SEARCH: &str = "http://portal.test/search";
    const DETAIL: &str = "http://portal.test/detail";

    /// Canned responses keyed by page number (search) or id (detail).
    #[derive(Default)]
    struct FakePortal {
        pages: HashMap<usize, Result<usize, u16>>,
        default_page: Option<Result<usize, u16>>,
        timeout_pages: bool,
        failing_details: Vec<String>,
        search_calls: AtomicUsize,
        detail_calls: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    fn listings(page: usize, n: usize) -> Vec<JsonValue> {
        (0..n)
            .map(|i| {
                json!({
                    "notifyNo": format!("IB{page:03}{i:03}"),
                    "inputResultId": format!("{page}-{i}"),
                    "bidName": format!("Gói thầu {page}-{i}"),
                })
            })
            .collect()
    }

    #[async_trait]
    impl JsonTransport for FakePortal {
        async fn post_json(&self, url: &str, body: &JsonValue) -> Result<JsonValue, FetchError> {
            if url == SEARCH {
                self.search_calls.fetch_add(1, Ordering::SeqCst);
                if self.timeout_pages {
                    return Err(FetchError::Timeout { url: url.into() });
                }
                let page: usize = body[0]["pageNumber"].as_str().unwrap().parse().unwrap();
                let outcome = self
                    .pages
                    .get(&page)
                    .cloned()
                    .or(self.default_page.clone())
                    .unwrap_or(Ok(0));
                return match outcome {
                    Ok(n) => Ok(json!({ "page": { "content": listings(page, n) } })),
                    Err(status) => Err(FetchError::HttpStatus { status, url: url.into() }),
                };
            }

            let id = body["id"].as_str().unwrap().to_string();
            self.detail_calls.lock().unwrap().push(id.clone());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing_details.contains(&id) {
                return Err(FetchError::Timeout { url: url.into() });
            }
            Ok(json!({ "bideContractorInputResultDTO": { "lotResultDTO": [] }, "id": id }))
        }
    }

    fn fast_backoff() -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            pre_attempt_delay: Duration::ZERO,
        }
    }

    fn scheduler(portal: Arc<FakePortal>) -> FetchScheduler {
        FetchScheduler::new(portal, SEARCH, 50, fast_backoff())
    }

    #[test]
    fn filters_for_closed_status() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let filters = build_filters("coNhaThauTrungThau".parse().unwrap(), now);
        let value = serde_json::to_value(&filters).unwrap();

        assert_eq!(value.as_array().unwrap().len(), 4);
        assert_eq!(value[0], json!({"fieldName": "type", "searchType": "in", "fieldValues": ["es-notify-contractor"]}));
        assert_eq!(
            value[2],
            json!({"fieldName": "bidCloseDate", "searchType": "range", "from": null, "to": "2024-05-01T00:00:00.000Z"})
        );
        assert_eq!(value[3]["fieldValues"], json!(["CNTTT"]));
    }

    #[test]
    fn filters_for_open_all_and_not_opened() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let open = build_filters(NoticeFilter::NotYetClosed, now);
        assert_eq!(open.len(), 3);
        assert_eq!(open[2].range.as_ref().unwrap().to, None);

        assert_eq!(build_filters(NoticeFilter::All, now).len(), 2);
        assert_eq!(build_filters("chuaMoThau".parse().unwrap(), now).len(), 2);
        assert!("khongTonTai".parse::<NoticeFilter>().is_err());
        assert_eq!(NoticeFilter::from_str("").unwrap().key(), "tatCa");
    }

    #[test]
    fn search_payload_shape() {
        let payload = search_payload(3, 50, "firewall", &[]);
        assert_eq!(payload[0]["pageNumber"], json!("3"));
        assert_eq!(payload[0]["pageSize"], json!(50));
        assert_eq!(payload[0]["query"][0]["keyWord"], json!("firewall"));
        assert_eq!(payload[0]["query"][0]["matchFields"], json!(["notifyNo", "bidName"]));
    }

    #[test]
    fn missing_content_is_malformed() {
        let err = parse_listing_page(SEARCH, &json!({ "page": {} })).unwrap_err();
        assert!(matches!(err, FetchError::MalformedBody { .. }));
    }

    #[test]
    fn unreadable_entries_are_skipped() {
        let body = json!({ "page": { "content": [
            { "notifyNo": "IB1", "inputResultId": "r1", "bidName": "Mua sắm tường lửa" },
            null,
            "x",
            7,
        ] } });
        let listings = parse_listing_page(SEARCH, &body).unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].reference_id(), Some("r1"));
    }

    #[tokio::test]
    async fn not_found_page_is_requested_once() {
        let portal = Arc::new(FakePortal {
            pages: HashMap::from([(0, Err(404))]),
            ..Default::default()
        });
        let err = scheduler(portal.clone()).fetch_page(0, "", &[]).await.unwrap_err();
        assert!(err.is_permanent());
        assert_eq!(portal.search_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timing_out_page_uses_every_attempt() {
        let portal = Arc::new(FakePortal {
            timeout_pages: true,
            ..Default::default()
        });
        let err = scheduler(portal.clone()).fetch_page(0, "", &[]).await.unwrap_err();
        assert!(matches!(err, FetchError::Exhausted { attempts: 3, .. }));
        assert_eq!(portal.search_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn sequence_stops_at_first_empty_page() {
        let portal = Arc::new(FakePortal {
            pages: HashMap::from([(0, Ok(2)), (1, Ok(1)), (2, Ok(0)), (3, Ok(5))]),
            ..Default::default()
        });
        let scheduler = scheduler(portal.clone());
        let mut seq = scheduler.pages("", vec![], SequenceLimits::default());

        let mut pages = Vec::new();
        let mut terminals = 0;
        while let Some(item) = seq.next().await {
            match item {
                PageItem::Page { page, data } => pages.push((page, data.len())),
                PageItem::Last => terminals += 1,
            }
        }

        assert_eq!(pages, vec![(0, 2), (1, 1)]);
        assert_eq!(terminals, 1);
        assert_eq!(seq.state().finish, Some(FinishReason::Exhausted));
        assert_eq!(portal.search_calls.load(Ordering::SeqCst), 3);
        assert!(seq.next().await.is_none());
    }

    #[tokio::test]
    async fn sequence_never_exceeds_max_pages() {
        let portal = Arc::new(FakePortal {
            default_page: Some(Ok(1)),
            ..Default::default()
        });
        let scheduler = scheduler(portal.clone());
        let limits = SequenceLimits {
            max_pages: 4,
            circuit_breaker_threshold: 3,
        };
        let outcome = crawl_listings(scheduler.pages("", vec![], limits), None).await;

        assert_eq!(outcome.pages, 4);
        assert_eq!(outcome.finish, FinishReason::MaxPages);
        assert_eq!(portal.search_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn circuit_breaker_keeps_collected_pages() {
        let portal = Arc::new(FakePortal {
            pages: HashMap::from([(0, Ok(3)), (1, Err(404)), (2, Err(400)), (3, Err(404)), (4, Ok(3))]),
            ..Default::default()
        });
        let scheduler = scheduler(portal.clone());
        let outcome = crawl_listings(
            scheduler.pages("", vec![], SequenceLimits::default()),
            None,
        )
        .await;

        assert_eq!(outcome.finish, FinishReason::CircuitOpen);
        assert_eq!(outcome.listings.len(), 3);
        assert_eq!(outcome.failed_pages, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn isolated_failure_resets_the_breaker() {
        let portal = Arc::new(FakePortal {
            pages: HashMap::from([(0, Ok(1)), (1, Err(404)), (2, Ok(1)), (3, Err(404)), (4, Err(404)), (5, Ok(1))]),
            ..Default::default()
        });
        let scheduler = scheduler(portal.clone());
        let outcome = crawl_listings(
            scheduler.pages("", vec![], SequenceLimits::default()),
            None,
        )
        .await;

        // Page 6 is empty, so the crawl ends naturally after page 5.
        assert_eq!(outcome.finish, FinishReason::Exhausted);
        assert_eq!(outcome.pages, 3);
        assert_eq!(outcome.failed_pages, vec![1, 3, 4]);
    }

    #[tokio::test]
    async fn checkpoints_are_written_every_interval() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let portal = Arc::new(FakePortal {
            pages: (0..5).map(|p| (p, Ok(2))).collect(),
            ..Default::default()
        });
        let scheduler = scheduler(portal);
        let outcome = crawl_listings(
            scheduler.pages("", vec![], SequenceLimits::default()),
            Some(Checkpoint {
                store: &store,
                file_name: "temp-data-all-tatCa.json".into(),
                interval: 2,
            }),
        )
        .await;

        assert_eq!(outcome.pages, 5);
        assert_eq!(outcome.checkpoints_written, 2);
        let snapshot: Vec<JsonValue> =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("temp-data-all-tatCa.json")).unwrap())
                .unwrap();
        assert_eq!(snapshot.len(), 8);
    }

    #[tokio::test]
    async fn enrichment_drops_missing_ids_and_keeps_failed_details() {
        let portal = Arc::new(FakePortal {
            failing_details: vec!["0-2".into()],
            ..Default::default()
        });
        let enricher = DetailEnricher::new(portal.clone(), DETAIL, fast_backoff(), 2, Duration::from_millis(1));

        let mut input: Vec<ListingRecord> = listings(0, 5)
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect();
        input[1].input_result_id = None;

        let outcome = enricher.enrich(input).await;

        assert_eq!(outcome.dropped, 1);
        assert_eq!(outcome.detail_failures, 1);
        let ids: Vec<_> = outcome
            .records
            .iter()
            .map(|r| r.listing.reference_id().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["0-0", "0-2", "0-3", "0-4"]);
        assert!(outcome.records[1].details.is_none());
        assert!(outcome.records[0].details.is_some());

        let calls = portal.detail_calls.lock().unwrap();
        assert_eq!(calls.iter().filter(|id| id.as_str() == "0-2").count(), 3);
        assert!(!calls.contains(&"0-1".to_string()));
        assert!(portal.max_in_flight.load(Ordering::SeqCst) <= 2);
    }
}
