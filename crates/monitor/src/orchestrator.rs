//! One scan cycle: open a batch, run every scanner against its targets,
//! persist what came back and close the batch.
//!
//! Cycles are single-flight. Scanner and query failures are isolated and
//! reported in the [`ScanResult`]; only the batch lifecycle itself can fail a
//! cycle.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use coffer_core::{AppError, Settings};
use coffer_storage::models::{AssetQuery, NewAssetSnapshot};
use futures::StreamExt;
use futures::future::join_all;
use futures::stream::FuturesUnordered;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{MonitorError, QueryFailure, ScanQueryError, ScannerInitError, StoreError};
use crate::notify::{NoopNotifier, Notifier, TelegramNotifier};
use crate::price::{PriceResolver, PriceSources, build_price_sources};
use crate::rate_limiter::RateLimiter;
use crate::scanner::{ChainScanner, OmittedPosition, QueryOutput, ScannerContext, ScannerRegistry};
use crate::store::{AssetStore, ScannerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CycleState::Pending => "pending",
            CycleState::Running => "running",
            CycleState::Completed => "completed",
            CycleState::Failed => "failed",
        })
    }
}

/// Outcome of a cycle whose batch was opened and closed.
#[derive(Debug)]
pub struct ScanResult {
    pub batch_id: i32,
    pub state: CycleState,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub snapshot_count: u64,
    pub usd_value: Decimal,
    /// Scanners configured for this cycle, including the ones that failed.
    pub scanner_count: usize,
    pub succeeded_query_count: usize,
    /// Set when `close()` interrupted the cycle before every query returned.
    pub cancelled: bool,
    pub init_failures: Vec<ScannerInitError>,
    pub query_failures: Vec<ScanQueryError>,
    /// Held positions that could not be valued and are missing from the batch.
    pub omitted: Vec<OmittedPosition>,
}

impl ScanResult {
    pub fn failed_scanner_count(&self) -> usize {
        self.init_failures.len()
    }

    pub fn failed_query_count(&self) -> usize {
        self.query_failures.len()
    }

    pub fn omitted_count(&self) -> usize {
        self.omitted.len()
    }

    /// Nothing was collected because everything that ran failed, as opposed
    /// to an empty batch from idle addresses.
    pub fn all_failed(&self) -> bool {
        self.succeeded_query_count == 0
            && (self.failed_scanner_count() > 0 || self.failed_query_count() > 0)
    }

    pub fn report_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "Scan #{} {} in {:.1}s: {} snapshots worth ${} from {}/{} scanners",
            self.batch_id,
            if self.cancelled { "cancelled" } else { "completed" },
            self.duration.as_secs_f64(),
            self.snapshot_count,
            self.usd_value.round_dp(2),
            self.scanner_count - self.failed_scanner_count(),
            self.scanner_count,
        )];
        if self.all_failed() {
            lines.push("Every scanner or query failed, the batch is empty".to_string());
        }
        if !self.omitted.is_empty() {
            lines.push(format!("{} held positions omitted without a price", self.omitted_count()));
        }
        lines.extend(self.init_failures.iter().map(|e| format!("- {e}")));
        lines.extend(self.query_failures.iter().map(|e| format!("- {e}")));
        lines.extend(self.omitted.iter().map(|o| format!("- {o}")));
        lines
    }
}

/// Runs scan cycles against the configured scanners.
pub struct AssetMonitor {
    store: Arc<dyn AssetStore>,
    registry: ScannerRegistry,
    limiter: Arc<RateLimiter>,
    price_sources: PriceSources,
    settings: Arc<Settings>,
    notifier: Arc<dyn Notifier>,
    running: tokio::sync::Mutex<()>,
    state: Mutex<CycleState>,
    shutdown: watch::Sender<bool>,
}

impl AssetMonitor {
    /// Monitor with the builtin scanners, the configured price sources and
    /// Telegram notifications when configured.
    pub fn new(store: Arc<dyn AssetStore>, settings: Arc<Settings>) -> Result<Self, AppError> {
        let limiter = Arc::new(RateLimiter::new(
            settings.rate_limit,
            settings.rate_limit_overrides.clone(),
        ));
        let price_sources = build_price_sources(&settings, &limiter)?;
        let notifier: Arc<dyn Notifier> = match TelegramNotifier::from_settings(&settings) {
            Some(telegram) => Arc::new(telegram),
            None => Arc::new(NoopNotifier),
        };

        Ok(Self {
            store,
            registry: ScannerRegistry::builtin(),
            limiter,
            price_sources,
            settings,
            notifier,
            running: tokio::sync::Mutex::new(()),
            state: Mutex::new(CycleState::Pending),
            shutdown: watch::channel(false).0,
        })
    }

    pub fn with_registry(mut self, registry: ScannerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_price_sources(mut self, sources: PriceSources) -> Self {
        self.price_sources = sources;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// State of the current or last cycle.
    pub fn state(&self) -> CycleState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run one cycle. Fails with `ScanInProgress` while another is running.
    pub async fn scan(&self) -> Result<ScanResult, MonitorError> {
        if self.is_closed() {
            return Err(MonitorError::Closed);
        }
        let _running = self
            .running
            .try_lock()
            .map_err(|_| MonitorError::ScanInProgress)?;

        self.set_state(CycleState::Running);
        match self.run_cycle().await {
            Ok(result) => {
                self.set_state(result.state);
                info!(
                    batch_id = result.batch_id,
                    snapshots = result.snapshot_count,
                    usd_value = %result.usd_value,
                    failed_scanners = result.failed_scanner_count(),
                    failed_queries = result.failed_query_count(),
                    omitted = result.omitted_count(),
                    cancelled = result.cancelled,
                    elapsed_ms = result.duration.as_millis() as u64,
                    "scan cycle finished"
                );
                self.notifier.send(&result.report_lines()).await;
                Ok(result)
            }
            Err(e) => {
                self.set_state(CycleState::Failed);
                error!(error = %e, "scan cycle failed");
                self.notifier.send(&[format!("Scan failed: {e}")]).await;
                Err(e)
            }
        }
    }

    /// Stop accepting cycles, let a running one wrap up, then close the limiter.
    pub async fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("monitor closing");
        let _running = self.running.lock().await;
        self.limiter.close();
        info!("monitor closed");
    }

    fn set_state(&self, state: CycleState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    async fn run_cycle(&self) -> Result<ScanResult, MonitorError> {
        let clock = Instant::now();
        let started_at = Utc::now();

        let configs = self
            .store
            .enabled_scanner_configs()
            .await
            .map_err(lifecycle("load scanner configs"))?;
        let targets = self
            .store
            .asset_queries()
            .await
            .map_err(lifecycle("load asset queries"))?;
        let batch = self
            .store
            .open_batch(started_at)
            .await
            .map_err(lifecycle("open batch"))?;

        let configs = group_configs(configs);
        info!(
            batch_id = batch.id,
            scanners = configs.len(),
            targets = targets.len(),
            "scan cycle started"
        );

        // Prices are memoized for this batch only.
        let prices = Arc::new(PriceResolver::new(Arc::clone(&self.price_sources)));
        let scanner_count = configs.len();

        let (scanners, init_failures) = self
            .until_shutdown(self.start_scanners(configs, &prices))
            .await
            .unwrap_or_default();
        let collected = self.collect(&scanners, &targets).await;

        let written = if collected.snapshots.is_empty() {
            0
        } else {
            match self.store.insert_snapshots(batch.id, &collected.snapshots).await {
                Ok(written) => written,
                Err(e) => {
                    // Close the batch even though its snapshots were lost.
                    if let Err(close) = self.store.close_batch(batch.id, Utc::now()).await {
                        warn!(batch_id = batch.id, error = %close, "could not close batch after failed insert");
                    }
                    return Err(lifecycle("persist snapshots")(e));
                }
            }
        };
        self.store
            .close_batch(batch.id, Utc::now())
            .await
            .map_err(lifecycle("close batch"))?;

        Ok(ScanResult {
            batch_id: batch.id,
            state: CycleState::Completed,
            started_at,
            duration: clock.elapsed(),
            snapshot_count: written,
            usd_value: collected.snapshots.iter().map(|s| s.usd_value).sum(),
            scanner_count,
            succeeded_query_count: collected.succeeded,
            cancelled: collected.cancelled || self.is_closed(),
            init_failures,
            query_failures: collected.failures,
            omitted: collected.omitted,
        })
    }

    /// Build and initialize every scanner concurrently. Failures exclude only
    /// the scanner concerned.
    async fn start_scanners(
        &self,
        configs: Vec<ScannerConfig>,
        prices: &Arc<PriceResolver>,
    ) -> (Vec<Box<dyn ChainScanner>>, Vec<ScannerInitError>) {
        let starts = configs.into_iter().map(|config| {
            let ctx = ScannerContext {
                config,
                limiter: Arc::clone(&self.limiter),
                prices: Arc::clone(prices),
                store: Arc::clone(&self.store),
                settings: Arc::clone(&self.settings),
            };
            async move {
                let mut scanner = self.registry.build(&ctx)?;
                scanner.initialize().await?;
                Ok::<_, ScannerInitError>(scanner)
            }
        });

        let mut scanners = Vec::new();
        let mut failures = Vec::new();
        for outcome in join_all(starts).await {
            match outcome {
                Ok(scanner) => {
                    debug!(scanner = %scanner.id(), "scanner initialized");
                    scanners.push(scanner);
                }
                Err(e) => {
                    warn!(scanner = %e.scanner, error = %e.cause, "scanner excluded from cycle");
                    failures.push(e);
                }
            }
        }
        (scanners, failures)
    }

    /// Query every target of every scanner concurrently until all return or
    /// the monitor is closed.
    async fn collect(&self, scanners: &[Box<dyn ChainScanner>], targets: &[AssetQuery]) -> Collected {
        let mut pending = FuturesUnordered::new();
        for scanner in scanners {
            let chain = &scanner.id().chain;
            for target in targets.iter().filter(|t| &t.chain == chain) {
                pending.push(self.query_with_timeout(scanner.as_ref(), target));
            }
        }
        for target in targets {
            if !scanners.iter().any(|s| s.id().chain == target.chain) {
                debug!(chain = %target.chain, address = %target.addr, "no active scanner for target");
            }
        }

        let mut collected = Collected::default();
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some(Ok(mut output)) => {
                        collected.succeeded += 1;
                        collected.snapshots.append(&mut output.snapshots);
                        collected.omitted.append(&mut output.omitted);
                    }
                    Some(Err(e)) => {
                        warn!(scanner = %e.scanner, address = %e.address, error = %e.cause, "query failed");
                        collected.failures.push(e);
                    }
                    None => break,
                },
                _ = closed(&mut shutdown) => {
                    warn!(abandoned = pending.len(), "cycle cancelled, keeping collected snapshots");
                    collected.cancelled = true;
                    break;
                }
            }
        }
        collected
    }

    async fn query_with_timeout(
        &self,
        scanner: &dyn ChainScanner,
        target: &AssetQuery,
    ) -> Result<QueryOutput, ScanQueryError> {
        let limit = self.settings.query_timeout;
        match tokio::time::timeout(limit, scanner.query(target)).await {
            Ok(result) => result,
            Err(_) => Err(scanner.id().query_error(target, QueryFailure::Timeout(limit))),
        }
    }

    async fn until_shutdown<F: Future>(&self, future: F) -> Option<F::Output> {
        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            output = future => Some(output),
            _ = closed(&mut shutdown) => None,
        }
    }
}

#[derive(Default)]
struct Collected {
    snapshots: Vec<NewAssetSnapshot>,
    succeeded: usize,
    failures: Vec<ScanQueryError>,
    omitted: Vec<OmittedPosition>,
    cancelled: bool,
}

fn lifecycle(stage: &'static str) -> impl FnOnce(StoreError) -> MonitorError {
    move |source| MonitorError::BatchLifecycle { stage, source }
}

/// Resolves once the shutdown flag is set.
async fn closed(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|closed| *closed).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Merge configs that share `(chain, scanner_type)` into one scanner with all
/// of their endpoints.
fn group_configs(configs: Vec<ScannerConfig>) -> Vec<ScannerConfig> {
    let mut grouped: Vec<ScannerConfig> = Vec::new();
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    for config in configs {
        let key = (config.config.chain.clone(), config.config.scanner_type.clone());
        match index.get(&key) {
            Some(&i) => grouped[i].endpoints.extend(config.endpoints),
            None => {
                index.insert(key, grouped.len());
                grouped.push(config);
            }
        }
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InitFailure;
    use crate::scanner::ScannerId;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use coffer_storage::models::{AssetState, AssetType};
    use rust_decimal_macros::dec;

    #[derive(Clone, Copy)]
    enum Reply {
        Holds(Decimal),
        Unpriced(Decimal),
        Fails,
        Hangs,
    }

    struct FakeScanner {
        id: ScannerId,
        init_fails: bool,
        replies: HashMap<String, Reply>,
    }

    #[async_trait]
    impl ChainScanner for FakeScanner {
        fn id(&self) -> &ScannerId {
            &self.id
        }

        async fn initialize(&mut self) -> Result<(), ScannerInitError> {
            if self.init_fails {
                return Err(self.id.init_error(InitFailure::MissingReference("no native asset".into())));
            }
            Ok(())
        }

        async fn query(&self, target: &AssetQuery) -> Result<QueryOutput, ScanQueryError> {
            match self.replies.get(&target.addr).copied().unwrap_or(Reply::Holds(Decimal::ZERO)) {
                Reply::Holds(qty) if qty.is_zero() => Ok(QueryOutput::default()),
                Reply::Holds(qty) => Ok(QueryOutput::from(vec![NewAssetSnapshot::valued(
                    "Fake Native Token",
                    "FAKE",
                    &self.id.chain,
                    AssetType::NativeToken,
                    AssetState::Liquid,
                    qty,
                    dec!(2),
                    Utc::now(),
                )])),
                Reply::Unpriced(qty) => Ok(QueryOutput {
                    snapshots: Vec::new(),
                    omitted: vec![OmittedPosition {
                        scanner: self.id.clone(),
                        address: target.addr.clone(),
                        code: "MEME".into(),
                        quantity: qty,
                        reason: "no price source quotes MEME".into(),
                    }],
                }),
                Reply::Fails => Err(self.id.query_error(
                    target,
                    QueryFailure::Chain(coffer_chains::ChainError::Rpc("node unavailable".into())),
                )),
                Reply::Hangs => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(QueryOutput::default())
                }
            }
        }
    }

    fn fake(registry: &mut ScannerRegistry, chain: &str, init_fails: bool, replies: &[(&str, Reply)]) {
        let replies: HashMap<String, Reply> =
            replies.iter().map(|(addr, r)| (addr.to_string(), *r)).collect();
        registry.register(
            chain,
            "native",
            Arc::new(move |ctx: &ScannerContext| -> Result<Box<dyn ChainScanner>, InitFailure> {
                Ok(Box::new(FakeScanner {
                    id: ctx.id(),
                    init_fails,
                    replies: replies.clone(),
                }))
            }),
        );
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, lines: &[String]) {
            self.sent.lock().unwrap().push(lines.to_vec());
        }
    }

    fn settings() -> Arc<Settings> {
        let settings = Settings::from_lookup(|key| match key {
            "DATABASE_URL" => Some("postgres://localhost/coffer".into()),
            "QUERY_TIMEOUT_SECS" => Some("5".into()),
            _ => None,
        })
        .unwrap();
        Arc::new(settings)
    }

    fn build_monitor(store: &Arc<MemoryStore>, registry: ScannerRegistry) -> (AssetMonitor, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::default());
        let monitor = AssetMonitor::new(store.clone(), settings())
            .unwrap()
            .with_registry(registry)
            .with_price_sources(Arc::new(Vec::new()))
            .with_notifier(notifier.clone());
        (monitor, notifier)
    }

    #[tokio::test]
    async fn failed_initialization_excludes_only_that_scanner() {
        let store = Arc::new(MemoryStore::new());
        store.add_scanner("alpha", "native", &["http://alpha"]);
        store.add_scanner("beta", "native", &["http://beta"]);
        store.add_query("alpha", "a1", None);
        store.add_query("beta", "b1", None);

        let mut registry = ScannerRegistry::empty();
        fake(&mut registry, "alpha", false, &[("a1", Reply::Holds(dec!(10)))]);
        fake(&mut registry, "beta", true, &[("b1", Reply::Holds(dec!(99)))]);
        let (monitor, notifier) = build_monitor(&store, registry);

        let result = monitor.scan().await.unwrap();

        assert_eq!(result.state, CycleState::Completed);
        assert_eq!(result.scanner_count, 2);
        assert_eq!(result.failed_scanner_count(), 1);
        assert_eq!(result.snapshot_count, 1);
        assert_eq!(result.usd_value, dec!(20));
        assert!(store.snapshots().iter().all(|s| s.chain == "alpha"));
        assert!(store.batches()[0].scan_finished_at.is_some());
        assert_eq!(monitor.state(), CycleState::Completed);
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failing_queries_leave_the_cycle_completed() {
        let store = Arc::new(MemoryStore::new());
        store.add_scanner("alpha", "native", &["http://alpha"]);
        store.add_query("alpha", "ok", None);
        store.add_query("alpha", "down", None);
        store.add_query("alpha", "empty", None);

        let mut registry = ScannerRegistry::empty();
        fake(
            &mut registry,
            "alpha",
            false,
            &[("ok", Reply::Holds(dec!(3))), ("down", Reply::Fails)],
        );
        let (monitor, _) = build_monitor(&store, registry);

        let result = monitor.scan().await.unwrap();

        assert_eq!(result.state, CycleState::Completed);
        assert_eq!(result.snapshot_count, 1);
        assert_eq!(result.failed_query_count(), 1);
        assert_eq!(result.query_failures[0].address, "down");
        assert_eq!(result.succeeded_query_count, 2);
        assert!(!result.all_failed());
    }

    #[tokio::test]
    async fn every_scanner_failing_is_distinguishable_from_no_holdings() {
        let store = Arc::new(MemoryStore::new());
        store.add_scanner("alpha", "native", &["http://alpha"]);
        store.add_query("alpha", "a1", None);
        let mut registry = ScannerRegistry::empty();
        fake(&mut registry, "alpha", true, &[]);
        let (monitor, _) = build_monitor(&store, registry);

        let failed = monitor.scan().await.unwrap();
        assert!(failed.all_failed());
        assert!(failed.report_lines().iter().any(|l| l.contains("Every scanner")));

        let store = Arc::new(MemoryStore::new());
        store.add_scanner("alpha", "native", &["http://alpha"]);
        store.add_query("alpha", "idle", None);
        let mut registry = ScannerRegistry::empty();
        fake(&mut registry, "alpha", false, &[]);
        let (monitor, _) = build_monitor(&store, registry);

        let idle = monitor.scan().await.unwrap();
        assert_eq!(idle.snapshot_count, 0);
        assert!(!idle.all_failed());
    }

    #[tokio::test]
    async fn unsupported_scanner_type_is_an_init_failure() {
        let store = Arc::new(MemoryStore::new());
        store.add_scanner("solana", "native", &["http://solana"]);
        let (monitor, _) = build_monitor(&store, ScannerRegistry::empty());

        let result = monitor.scan().await.unwrap();

        assert_eq!(result.failed_scanner_count(), 1);
        assert!(matches!(result.init_failures[0].cause, InitFailure::Unsupported));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_query_times_out() {
        let store = Arc::new(MemoryStore::new());
        store.add_scanner("alpha", "native", &["http://alpha"]);
        store.add_query("alpha", "slow", None);
        let mut registry = ScannerRegistry::empty();
        fake(&mut registry, "alpha", false, &[("slow", Reply::Hangs)]);
        let (monitor, _) = build_monitor(&store, registry);

        let result = monitor.scan().await.unwrap();

        assert_eq!(result.failed_query_count(), 1);
        assert!(matches!(result.query_failures[0].cause, QueryFailure::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_scan_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        store.add_scanner("alpha", "native", &["http://alpha"]);
        store.add_query("alpha", "slow", None);
        let mut registry = ScannerRegistry::empty();
        fake(&mut registry, "alpha", false, &[("slow", Reply::Hangs)]);
        let (monitor, _) = build_monitor(&store, registry);

        let first = monitor.scan();
        tokio::pin!(first);
        tokio::select! {
            _ = &mut first => panic!("first cycle finished early"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }

        assert_eq!(monitor.state(), CycleState::Running);
        assert!(matches!(monitor.scan().await, Err(MonitorError::ScanInProgress)));
        assert!(first.await.is_ok());
        assert!(monitor.scan().await.is_ok());
    }

    #[tokio::test]
    async fn unavailable_store_fails_the_cycle() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let (monitor, notifier) = build_monitor(&store, ScannerRegistry::empty());

        let err = monitor.scan().await.unwrap_err();

        assert!(matches!(err, MonitorError::BatchLifecycle { .. }));
        assert_eq!(monitor.state(), CycleState::Failed);
        assert!(notifier.sent.lock().unwrap()[0][0].starts_with("Scan failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_a_running_cycle_and_keeps_its_snapshots() {
        let store = Arc::new(MemoryStore::new());
        store.add_scanner("alpha", "native", &["http://alpha"]);
        store.add_query("alpha", "fast", None);
        store.add_query("alpha", "slow", None);
        let mut registry = ScannerRegistry::empty();
        fake(
            &mut registry,
            "alpha",
            false,
            &[("fast", Reply::Holds(dec!(1))), ("slow", Reply::Hangs)],
        );
        let (monitor, _) = build_monitor(&store, registry);

        let (result, ()) = tokio::join!(monitor.scan(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            monitor.close().await;
        });

        let result = result.unwrap();
        assert!(result.cancelled);
        assert_eq!(result.snapshot_count, 1);
        assert!(store.batches()[0].scan_finished_at.is_some());
        assert!(monitor.limiter().is_closed());
        assert!(matches!(monitor.scan().await, Err(MonitorError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn summary_ignores_the_batch_being_scanned() {
        let store = Arc::new(MemoryStore::new());
        store.seed_batch(Utc::now() - chrono::Duration::hours(1), dec!(1500));
        store.add_scanner("alpha", "native", &["http://alpha"]);
        store.add_query("alpha", "slow", None);
        let mut registry = ScannerRegistry::empty();
        fake(&mut registry, "alpha", false, &[("slow", Reply::Hangs)]);
        let (monitor, _) = build_monitor(&store, registry);
        let aggregator = crate::summary::SummaryAggregator::new(store.clone());

        let scan = monitor.scan();
        tokio::pin!(scan);
        tokio::select! {
            _ = &mut scan => panic!("cycle finished early"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }

        assert_eq!(store.batches().len(), 2);
        let summary = aggregator.summary().await.unwrap();
        assert_eq!(summary.current_usd_value, Some(dec!(1500)));
        assert_eq!(summary.thirty_day_low, Some(dec!(1500)));

        assert!(scan.await.is_ok());
        let summary = aggregator.summary().await.unwrap();
        assert_eq!(summary.current_usd_value, Some(Decimal::ZERO));
    }

    #[tokio::test]
    async fn failed_snapshot_insert_still_closes_the_batch() {
        let store = Arc::new(MemoryStore::new());
        store.add_scanner("alpha", "native", &["http://alpha"]);
        store.add_query("alpha", "a1", None);
        store.set_reject_snapshots(true);
        let mut registry = ScannerRegistry::empty();
        fake(&mut registry, "alpha", false, &[("a1", Reply::Holds(dec!(4)))]);
        let (monitor, _) = build_monitor(&store, registry);

        let err = monitor.scan().await.unwrap_err();

        assert!(matches!(err, MonitorError::BatchLifecycle { stage: "persist snapshots", .. }));
        assert_eq!(monitor.state(), CycleState::Failed);
        assert!(store.snapshots().is_empty());
        assert!(store.batches()[0].scan_finished_at.is_some());
    }

    #[tokio::test]
    async fn unpriced_positions_are_reported() {
        let store = Arc::new(MemoryStore::new());
        store.add_scanner("alpha", "native", &["http://alpha"]);
        store.add_query("alpha", "a1", None);
        store.add_query("alpha", "a2", None);
        let mut registry = ScannerRegistry::empty();
        fake(
            &mut registry,
            "alpha",
            false,
            &[("a1", Reply::Holds(dec!(5))), ("a2", Reply::Unpriced(dec!(42)))],
        );
        let (monitor, notifier) = build_monitor(&store, registry);

        let result = monitor.scan().await.unwrap();

        assert_eq!(result.snapshot_count, 1);
        assert_eq!(result.omitted_count(), 1);
        assert_eq!(result.omitted[0].address, "a2");
        assert!(!result.all_failed());
        let report = &notifier.sent.lock().unwrap()[0];
        assert!(report.iter().any(|l| l.starts_with("1 held positions omitted")));
        assert!(report.iter().any(|l| l.contains("42 MEME omitted")));
    }

    #[test]
    fn configs_sharing_a_scanner_merge_endpoints() {
        let store = MemoryStore::new();
        store.add_scanner("alpha", "native", &["http://one"]);
        store.add_scanner("alpha", "native", &["http://two"]);
        store.add_scanner("alpha", "erc20", &["http://three"]);
        let configs = futures::executor::block_on(store.enabled_scanner_configs()).unwrap();

        let grouped = group_configs(configs);

        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].endpoints.len(), 2);
    }
}
