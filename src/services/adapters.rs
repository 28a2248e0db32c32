//! Source adapter framework (C4).
//!
//! Generalizes the source's dynamically-loaded plugin modules into two
//! traits implemented in Rust code: [`SingleSeriesAdapter`] for sources that
//! make one API call per series, and [`MultiSeriesAdapter`] for sources that
//! return several series from one call (grouped to avoid redundant
//! requests). [`AdapterRegistry`] is the compile-time stand-in for the
//! source's `module`/`class` dynamic import: a string tag from YAML maps to
//! a constructor function baked into the binary.
//!
//! Ships one reference adapter, [`http_json`], whose pagination shape
//! (accumulate pages until the reported total is reached) mirrors the shape
//! common to the source's REST-backed plugins, without reproducing any
//! vendor-specific request/response parsing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::error::{CoreError, CoreResult};

/// One fetched `(ts, value)` pair, prior to gap imputation or persistence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPoint {
    pub ts: DateTime<Utc>,
    pub value: f64,
}

/// Static description of a time series, as carried in the C5 YAML config.
#[derive(Debug, Clone, Deserialize)]
pub struct SeriesMetadata {
    pub name: String,
    pub description: String,
    pub frequency: String,
    pub unit: String,
    pub domain: String,
    pub category: String,
    #[serde(default)]
    pub subcategory: Option<String>,
}

/// A data source that produces one time series per API call.
#[async_trait]
pub trait SingleSeriesAdapter: Send + Sync {
    fn unique_id(&self) -> &str;
    fn metadata(&self) -> &SeriesMetadata;

    /// Fetch historical data from `start` up to `end` (or "as late as the
    /// source has", when `None` — preferred, since sources may run in a
    /// different timezone than the caller).
    async fn fetch_historical(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> CoreResult<Vec<RawPoint>>;

    /// Timezone the adapter detected from the source's response, if any;
    /// used to populate `TimeSeries.timezone` on first sight.
    fn detected_timezone(&self) -> Option<&str> {
        None
    }
}

/// A data source that returns several time series from a single API call.
#[async_trait]
pub trait MultiSeriesAdapter: Send + Sync {
    fn group_id(&self) -> &str;
    fn series_definitions(&self) -> &[(String, SeriesMetadata)];

    /// The group's own update cadence, as declared by its `schedule:` entry
    /// in the adapters YAML — the interval trigger C5 registers this group
    /// under, independent of any individual member series' frequency.
    fn schedule(&self) -> crate::duration::Duration;

    async fn fetch_historical_multi(
        &self,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> CoreResult<HashMap<String, Vec<RawPoint>>>;
}

/// Token-bucket-free rate limiter: serializes calls so consecutive fetches
/// against the same adapter are spaced at least `min_interval` apart.
/// Shared via `Arc` across an adapter's scheduled runs.
pub struct RateLimiter {
    min_interval: StdDuration,
    state: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: StdDuration) -> Arc<Self> {
        Arc::new(Self {
            min_interval,
            state: Mutex::new(None),
        })
    }

    /// Block the caller until at least `min_interval` has elapsed since the
    /// previous `acquire`.
    pub async fn acquire(&self) {
        let wait = {
            let mut last_call = self.state.lock();
            let now = Instant::now();
            let wait = last_call
                .map(|last| self.min_interval.saturating_sub(now.duration_since(last)))
                .unwrap_or_default();
            *last_call = Some(now + wait);
            wait
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Constructor signature a registered adapter tag resolves to: given the
/// adapter-specific opaque parameter bag and this series' metadata, build a
/// boxed adapter instance.
pub type SingleSeriesFactory =
    fn(params: &serde_json::Value, unique_id: String, metadata: SeriesMetadata) -> CoreResult<Box<dyn SingleSeriesAdapter>>;

pub type MultiSeriesFactory = fn(
    params: &serde_json::Value,
    group_id: String,
    schedule: crate::duration::Duration,
    series: Vec<(String, SeriesMetadata)>,
) -> CoreResult<Box<dyn MultiSeriesAdapter>>;

/// Compile-time registry mapping the `module`/`class`-equivalent string tag
/// carried in YAML config to a concrete constructor. Concrete vendor
/// adapters (EIA, ENTSO-E, ...) are deployment-specific and out of this
/// core's scope; only the `http_json` reference adapter is registered by
/// default.
#[derive(Default)]
pub struct AdapterRegistry {
    single: HashMap<&'static str, SingleSeriesFactory>,
    multi: HashMap<&'static str, MultiSeriesFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the adapters this crate ships.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_single("http_json", http_json::construct);
        registry
    }

    pub fn register_single(&mut self, tag: &'static str, factory: SingleSeriesFactory) {
        self.single.insert(tag, factory);
    }

    pub fn register_multi(&mut self, tag: &'static str, factory: MultiSeriesFactory) {
        self.multi.insert(tag, factory);
    }

    pub fn build_single(
        &self,
        tag: &str,
        params: &serde_json::Value,
        unique_id: String,
        metadata: SeriesMetadata,
    ) -> CoreResult<Box<dyn SingleSeriesAdapter>> {
        let factory = self
            .single
            .get(tag)
            .ok_or_else(|| CoreError::invalid_config(format!("unknown single-series adapter tag '{tag}'")))?;
        factory(params, unique_id, metadata)
    }

    pub fn build_multi(
        &self,
        tag: &str,
        params: &serde_json::Value,
        group_id: String,
        schedule: crate::duration::Duration,
        series: Vec<(String, SeriesMetadata)>,
    ) -> CoreResult<Box<dyn MultiSeriesAdapter>> {
        let factory = self
            .multi
            .get(tag)
            .ok_or_else(|| CoreError::invalid_config(format!("unknown multi-series adapter tag '{tag}'")))?;
        factory(params, group_id, schedule, series)
    }
}

/// Reference single-series adapter: fetches JSON pages over an injectable
/// transport and accumulates them until the reported total is reached,
/// mirroring the source's `offset += length` loop without depending on any
/// particular HTTP client or wire format.
pub mod http_json {
    use super::*;

    /// One page of results: the rows fetched, plus the total row count the
    /// source reports (used to decide whether another page is needed).
    #[derive(Debug, Clone)]
    pub struct Page {
        pub rows: Vec<RawPoint>,
        pub total: usize,
    }

    /// Abstraction over the actual HTTP call, so the pagination and
    /// accumulation logic can be exercised in tests without a network
    /// dependency. A production deployment supplies a concrete transport
    /// backed by whatever HTTP client it already depends on.
    #[async_trait]
    pub trait Transport: Send + Sync {
        async fn fetch_page(
            &self,
            start: DateTime<Utc>,
            end: Option<DateTime<Utc>>,
            offset: usize,
            page_size: usize,
        ) -> CoreResult<Page>;
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct Params {
        #[serde(default = "default_page_size")]
        pub page_size: usize,
    }

    fn default_page_size() -> usize {
        5000
    }

    pub struct HttpJsonAdapter {
        unique_id: String,
        metadata: SeriesMetadata,
        page_size: usize,
        transport: Arc<dyn Transport>,
    }

    impl HttpJsonAdapter {
        pub fn new(
            unique_id: String,
            metadata: SeriesMetadata,
            page_size: usize,
            transport: Arc<dyn Transport>,
        ) -> Self {
            Self {
                unique_id,
                metadata,
                page_size,
                transport,
            }
        }
    }

    #[async_trait]
    impl SingleSeriesAdapter for HttpJsonAdapter {
        fn unique_id(&self) -> &str {
            &self.unique_id
        }

        fn metadata(&self) -> &SeriesMetadata {
            &self.metadata
        }

        async fn fetch_historical(
            &self,
            start: DateTime<Utc>,
            end: Option<DateTime<Utc>>,
        ) -> CoreResult<Vec<RawPoint>> {
            let mut rows = Vec::new();
            let mut offset = 0usize;
            loop {
                let page = self
                    .transport
                    .fetch_page(start, end, offset, self.page_size)
                    .await
                    .map_err(|e| CoreError::adapter_fetch(self.unique_id.clone(), e.to_string()))?;
                let fetched = page.rows.len();
                rows.extend(page.rows);
                offset += self.page_size;
                if offset >= page.total || fetched == 0 {
                    break;
                }
            }
            rows.sort_by_key(|p| p.ts);
            Ok(rows)
        }
    }

    /// Registry constructor: builds an [`HttpJsonAdapter`] whose transport is
    /// a no-op stub. Real deployments register their own tag with a
    /// transport wired to the relevant HTTP client instead of using this
    /// default construction path.
    pub fn construct(
        params: &serde_json::Value,
        unique_id: String,
        metadata: SeriesMetadata,
    ) -> CoreResult<Box<dyn SingleSeriesAdapter>> {
        let parsed: Params = serde_json::from_value(params.clone())
            .map_err(|e| CoreError::invalid_config(format!("invalid http_json params: {e}")))?;
        Ok(Box::new(HttpJsonAdapter::new(
            unique_id,
            metadata,
            parsed.page_size,
            Arc::new(NullTransport),
        )))
    }

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn fetch_page(
            &self,
            _start: DateTime<Utc>,
            _end: Option<DateTime<Utc>>,
            _offset: usize,
            _page_size: usize,
        ) -> CoreResult<Page> {
            Ok(Page {
                rows: Vec::new(),
                total: 0,
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct FakeTransport {
            total: usize,
            calls: AtomicUsize,
        }

        #[async_trait]
        impl Transport for FakeTransport {
            async fn fetch_page(
                &self,
                _start: DateTime<Utc>,
                _end: Option<DateTime<Utc>>,
                offset: usize,
                page_size: usize,
            ) -> CoreResult<Page> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let remaining = self.total.saturating_sub(offset);
                let take = remaining.min(page_size);
                let rows = (0..take)
                    .map(|i| RawPoint {
                        ts: Utc::now() + chrono::Duration::hours((offset + i) as i64),
                        value: (offset + i) as f64,
                    })
                    .collect();
                Ok(Page { rows, total: self.total })
            }
        }

        fn meta() -> SeriesMetadata {
            SeriesMetadata {
                name: "n".into(),
                description: "d".into(),
                frequency: "1 hour".into(),
                unit: "u".into(),
                domain: "energy".into(),
                category: "generation".into(),
                subcategory: None,
            }
        }

        #[tokio::test]
        async fn paginates_until_total_reached() {
            let transport = Arc::new(FakeTransport {
                total: 12,
                calls: AtomicUsize::new(0),
            });
            let adapter = HttpJsonAdapter::new("series-1".into(), meta(), 5, transport.clone());
            let points = adapter.fetch_historical(Utc::now(), None).await.unwrap();
            assert_eq!(points.len(), 12);
            assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        }

        #[tokio::test]
        async fn stops_on_empty_page_even_below_total() {
            let transport = Arc::new(FakeTransport {
                total: 1000,
                calls: AtomicUsize::new(0),
            });
            // total is huge but every page after the first is empty, because
            // offset immediately exceeds what FakeTransport can produce once
            // we shrink its advertised total after one call. Simulate with a
            // transport that always reports 0 rows to exercise the
            // fetched == 0 early exit.
            struct EmptyTransport;
            #[async_trait]
            impl Transport for EmptyTransport {
                async fn fetch_page(
                    &self,
                    _start: DateTime<Utc>,
                    _end: Option<DateTime<Utc>>,
                    _offset: usize,
                    _page_size: usize,
                ) -> CoreResult<Page> {
                    Ok(Page { rows: Vec::new(), total: 1000 })
                }
            }
            let adapter = HttpJsonAdapter::new("series-1".into(), meta(), 5, Arc::new(EmptyTransport));
            let points = adapter.fetch_historical(Utc::now(), None).await.unwrap();
            assert!(points.is_empty());
            let _ = transport;
        }
    }
}

/// YAML loader for the C5 adapter/request-group configuration file: the
/// `timeseries:`/`request_groups:` document a `data-collector` process reads
/// at startup. `tag` stands in for the source's `module`/`class` pair —
/// Rust resolves it against a compile-time [`AdapterRegistry`] instead of
/// importing a module by string at runtime.
pub mod config {
    use super::*;

    #[derive(Debug, Clone, Deserialize)]
    pub struct SingleSeriesEntry {
        pub tag: String,
        pub metadata: SeriesMetadata,
        #[serde(default = "default_params")]
        pub default_params: serde_json::Value,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct RequestGroupSeriesEntry {
        pub unique_id: String,
        #[serde(default)]
        pub metadata: Option<SeriesMetadata>,
        #[serde(default = "default_params")]
        pub extract_filter: serde_json::Value,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct RequestGroupEntry {
        pub tag: String,
        pub schedule: String,
        #[serde(default = "default_params")]
        pub request_params: serde_json::Value,
        pub timeseries: Vec<RequestGroupSeriesEntry>,
    }

    fn default_params() -> serde_json::Value {
        serde_json::json!({})
    }

    #[derive(Debug, Default, Deserialize)]
    struct AdaptersFile {
        #[serde(default)]
        timeseries: HashMap<String, SingleSeriesEntry>,
        #[serde(default)]
        request_groups: HashMap<String, RequestGroupEntry>,
    }

    /// Parse `yaml` and construct every adapter it names against `registry`,
    /// returning the single-series and multi-series adapters in file order
    /// (`HashMap` iteration order isn't file order, but neither the source
    /// nor this framework depends on load order beyond "all get scheduled").
    pub fn load_adapters(
        yaml: &str,
        registry: &AdapterRegistry,
    ) -> CoreResult<(Vec<Box<dyn SingleSeriesAdapter>>, Vec<Box<dyn MultiSeriesAdapter>>)> {
        let parsed: AdaptersFile =
            serde_yaml::from_str(yaml).map_err(|e| CoreError::invalid_config(format!("invalid adapters file: {e}")))?;

        let mut single = Vec::with_capacity(parsed.timeseries.len());
        for (unique_id, entry) in parsed.timeseries {
            let adapter = registry.build_single(&entry.tag, &entry.default_params, unique_id, entry.metadata)?;
            single.push(adapter);
        }

        let mut multi = Vec::with_capacity(parsed.request_groups.len());
        for (group_id, entry) in parsed.request_groups {
            let schedule = crate::duration::Duration::parse(&entry.schedule)?;
            let series: Vec<(String, SeriesMetadata)> = entry
                .timeseries
                .iter()
                .filter_map(|ts| ts.metadata.clone().map(|m| (ts.unique_id.clone(), m)))
                .collect();
            let adapter = registry.build_multi(&entry.tag, &entry.request_params, group_id, schedule, series)?;
            multi.push(adapter);
        }

        Ok((single, multi))
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        const SAMPLE: &str = r#"
timeseries:
  series-a:
    tag: http_json
    metadata:
      name: Series A
      description: A sample series
      frequency: "1 hour"
      unit: MW
      domain: energy
      category: generation
    default_params:
      page_size: 500
"#;

        #[test]
        fn parses_and_builds_single_series_adapter() {
            let registry = AdapterRegistry::with_defaults();
            let (single, multi) = load_adapters(SAMPLE, &registry).unwrap();
            assert_eq!(single.len(), 1);
            assert_eq!(multi.len(), 0);
            assert_eq!(single[0].unique_id(), "series-a");
        }

        #[test]
        fn unknown_tag_fails_whole_load() {
            let bad = SAMPLE.replace("tag: http_json", "tag: does_not_exist");
            let registry = AdapterRegistry::with_defaults();
            assert!(load_adapters(&bad, &registry).is_err());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDur;

    #[tokio::test]
    async fn rate_limiter_spaces_out_calls() {
        let limiter = RateLimiter::new(StdDur::from_millis(50));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= StdDur::from_millis(100));
    }

    #[test]
    fn registry_rejects_unknown_tag() {
        let registry = AdapterRegistry::with_defaults();
        let metadata = SeriesMetadata {
            name: "n".into(),
            description: "d".into(),
            frequency: "1 hour".into(),
            unit: "u".into(),
            domain: "energy".into(),
            category: "generation".into(),
            subcategory: None,
        };
        let result = registry.build_single("does_not_exist", &serde_json::json!({}), "x".into(), metadata);
        assert!(result.is_err());
    }

    #[test]
    fn registry_builds_registered_http_json_tag() {
        let registry = AdapterRegistry::with_defaults();
        let metadata = SeriesMetadata {
            name: "n".into(),
            description: "d".into(),
            frequency: "1 hour".into(),
            unit: "u".into(),
            domain: "energy".into(),
            category: "generation".into(),
            subcategory: None,
        };
        let adapter = registry
            .build_single("http_json", &serde_json::json!({"page_size": 100}), "x".into(), metadata)
            .unwrap();
        assert_eq!(adapter.unique_id(), "x");
    }
}
