use crate::config::{PipelineSettings, Settings};
use crate::marketplace::{BrowseLookup, DemoLookup, ItemLookup, LookupError};
use crate::models::{ItemSnapshot, ResearchRequest, StageReport};
use crate::profit::{
    self, FallbackStrategy, PackageEstimate, ProfitInputs, ProfitStrategy, SurfaceStrategy,
    estimate_package,
};
use crate::report::{ResultRecord, Verdict};
use crate::rows::{
    InMemoryRowStore, RedisRowStore, RowError, RowStatus, RowStore, Transition, TransitionError,
};
use crate::sourcing::{
    RakutenProvider, SearchConstraints, SerpApiProvider, SourcingAggregator, SourcingOutcome,
    SourcingProvider, StaticProvider, YahooProvider, derive_query,
};
use crate::surface::{
    CalculationBridge, CalculationSurface, RedisFence, SheetsSurface, SimulatedSurface,
    SurfaceLayout, SurfacePool,
};
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Value, json};
use std::{any::Any, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::time::{Duration, timeout};
use tracing::{error, info, warn};
use uuid::Uuid;

// Rows outlive the run long enough for the poller to see the verdict.
const ROW_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Clone)]
pub struct Pipeline {
    lookup: Arc<dyn ItemLookup>,
    aggregator: Arc<SourcingAggregator>,
    constraints: SearchConstraints,
    strategies: Arc<Vec<Arc<dyn ProfitStrategy>>>,
    rows: Arc<dyn RowStore>,
    settings: PipelineSettings,
}

/// What a finished run looked like. Returned for `done` rows; failures come
/// back as `PipelineError` after the row has been moved to `error`.
#[derive(Debug, Clone, Serialize)]
pub struct ResearchOutcome {
    pub request_id: Uuid,
    pub row_key: String,
    pub status: RowStatus,
    pub result: ResultRecord,
    pub stages: Vec<StageReport>,
}

impl Pipeline {
    pub fn new(
        lookup: Arc<dyn ItemLookup>,
        aggregator: SourcingAggregator,
        constraints: SearchConstraints,
        strategies: Vec<Arc<dyn ProfitStrategy>>,
        rows: Arc<dyn RowStore>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            lookup,
            aggregator: Arc::new(aggregator),
            constraints,
            strategies: Arc::new(strategies),
            rows,
            settings,
        }
    }

    /// Fully offline wiring: demo item, static offers, simulated surface,
    /// in-memory rows.
    pub fn demo(settings: &Settings) -> Result<Self, PipelineError> {
        let providers = StaticProvider::demo_set()
            .into_iter()
            .map(|provider| Arc::new(provider) as Arc<dyn SourcingProvider>)
            .collect();
        let surface = Arc::new(SimulatedSurface::new(
            settings.fees.clone(),
            settings.surface.simulated_propagation,
        ));
        let pool = build_pool(surface, settings, None)?;
        Ok(Self::new(
            Arc::new(DemoLookup::new()),
            SourcingAggregator::new(providers, &settings.sourcing),
            SearchConstraints::from(&settings.sourcing),
            strategies(pool, settings),
            Arc::new(InMemoryRowStore::new()),
            settings.pipeline.clone(),
        ))
    }

    /// Production wiring from env. Every collaborator without credentials
    /// falls back to its offline counterpart with a warning.
    pub fn from_settings(
        settings: &Settings,
        redis: Option<redis::Client>,
    ) -> Result<Self, PipelineError> {
        let lookup: Arc<dyn ItemLookup> = match BrowseLookup::from_env() {
            Some(lookup) => Arc::new(lookup),
            None => {
                warn!(
                    target = "research.pipeline",
                    "EBAY_APP_ID/EBAY_CERT_ID not set; using the demo item lookup"
                );
                Arc::new(DemoLookup::new())
            }
        };

        let mut providers: Vec<Arc<dyn SourcingProvider>> = Vec::new();
        if let Some(provider) = RakutenProvider::from_env() {
            providers.push(Arc::new(provider));
        }
        if let Some(provider) = YahooProvider::from_env() {
            providers.push(Arc::new(provider));
        }
        if let Some(provider) = SerpApiProvider::from_env() {
            providers.push(Arc::new(provider));
        }
        if providers.is_empty() {
            warn!(
                target = "research.pipeline",
                "no sourcing credentials configured; using static demo offers"
            );
            providers = StaticProvider::demo_set()
                .into_iter()
                .map(|provider| Arc::new(provider) as Arc<dyn SourcingProvider>)
                .collect();
        }

        let surface: Arc<dyn CalculationSurface> = match SheetsSurface::from_env() {
            Some(sheets) => Arc::new(sheets),
            None => {
                warn!(
                    target = "research.pipeline",
                    "SHEETS_SPREADSHEET_ID/SHEETS_ACCESS_TOKEN not set; using the simulated surface"
                );
                Arc::new(SimulatedSurface::new(
                    settings.fees.clone(),
                    settings.surface.simulated_propagation,
                ))
            }
        };
        let fence = redis
            .clone()
            .map(|client| RedisFence::new(client, settings.surface.fence_ttl));
        let pool = build_pool(surface, settings, fence)?;

        let rows: Arc<dyn RowStore> = match redis {
            Some(client) => Arc::new(RedisRowStore::new(client, ROW_TTL)),
            None => Arc::new(InMemoryRowStore::new()),
        };

        let aggregator = SourcingAggregator::new(providers, &settings.sourcing);
        info!(
            target = "research.pipeline",
            lookup = lookup.name(),
            providers = ?aggregator.provider_ids(),
            surface_rows = pool.size(),
            rows = rows.name(),
            "pipeline wired"
        );
        Ok(Self::new(
            lookup,
            aggregator,
            SearchConstraints::from(&settings.sourcing),
            strategies(pool, settings),
            rows,
            settings.pipeline.clone(),
        ))
    }

    pub fn rows(&self) -> Arc<dyn RowStore> {
        self.rows.clone()
    }

    /// Runs one request to a terminal row state. The row is never left
    /// `processing`: errors, panics and the deadline all end in `Fail`.
    pub async fn run(&self, request: ResearchRequest) -> Result<ResearchOutcome, PipelineError> {
        let started = Instant::now();
        let row_key = request.row_key.trim().to_string();
        if row_key.is_empty() {
            return Err(PipelineError::validation("validate", "row_key is empty"));
        }

        if let Err(err) = self.rows.transition(&row_key, Transition::Begin).await {
            let err = match &err {
                RowError::Transition(
                    TransitionError::AlreadyProcessing { .. } | TransitionError::Terminal { .. },
                ) => PipelineError::already_running(err.to_string()),
                _ => PipelineError::internal("rows", err.to_string()),
            };
            warn!(target = "research.pipeline", row_key = %row_key, error = %err, "run refused");
            return Err(err);
        }
        info!(
            target = "research.pipeline",
            request_id = %request.request_id,
            row_key = %row_key,
            item = %request.item_reference,
            "research started"
        );

        let budget = self.settings.run_budget();
        let mut stages = Vec::new();
        let work = AssertUnwindSafe(self.execute(&request, &row_key, &mut stages)).catch_unwind();
        let result = match timeout(budget, work).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(PipelineError::internal("pipeline", panic_message(panic))),
            Err(_) => Err(PipelineError::timeout(budget)),
        };

        let elapsed_ms = started.elapsed().as_millis();
        match result {
            Ok(record) => {
                let stored = self
                    .rows
                    .transition(&row_key, Transition::Complete(Box::new(record.clone())))
                    .await;
                match stored {
                    Ok(_) => {
                        crate::metrics::run_finished("done", elapsed_ms);
                        info!(
                            target = "research.pipeline",
                            row_key = %row_key,
                            elapsed_ms = elapsed_ms as u64,
                            profitable = record.profit().is_some_and(|p| p.is_profitable()),
                            "research done"
                        );
                        Ok(ResearchOutcome {
                            request_id: request.request_id,
                            row_key,
                            status: RowStatus::Done,
                            result: record,
                            stages,
                        })
                    }
                    Err(err) => {
                        let err = PipelineError::internal("rows", err.to_string());
                        self.fail_row(&row_key, &err).await;
                        crate::metrics::run_finished("error", elapsed_ms);
                        Err(err)
                    }
                }
            }
            Err(err) => {
                self.fail_row(&row_key, &err).await;
                crate::metrics::run_finished("error", elapsed_ms);
                error!(
                    target = "research.pipeline",
                    row_key = %row_key,
                    stage = err.stage(),
                    error = %err.detail(),
                    "research failed"
                );
                Err(err)
            }
        }
    }

    async fn fail_row(&self, row_key: &str, err: &PipelineError) {
        if let Err(store_err) = self
            .rows
            .transition(row_key, Transition::Fail(err.to_string()))
            .await
        {
            error!(
                target = "research.pipeline",
                row_key,
                error = %store_err,
                "could not record failure on row"
            );
        }
    }

    async fn note(&self, row_key: &str, message: String) {
        if let Err(err) = self.rows.transition(row_key, Transition::Note(message)).await {
            warn!(target = "research.pipeline", row_key, error = %err, "progress note dropped");
        }
    }

    async fn execute(
        &self,
        request: &ResearchRequest,
        row_key: &str,
        stages: &mut Vec<StageReport>,
    ) -> Result<ResultRecord, PipelineError> {
        let reference = self
            .capture_stage("validate", stages, async {
                let reference = request.item_reference.trim().to_string();
                if reference.is_empty() {
                    return Err(PipelineError::validation("validate", "item_reference is empty"));
                }
                let output = json!({ "item_reference": reference });
                Ok(StageOutcome::new(reference, output))
            })
            .await?;

        let item = self
            .capture_stage("fetch_item", stages, stages::fetch_item(&*self.lookup, &reference))
            .await?;
        self.note(row_key, format!("item fetched: {}", item.title)).await;

        let query = self
            .capture_stage("derive_query", stages, stages::derive(&item))
            .await?;

        let sourcing = self
            .capture_stage(
                "sourcing",
                stages,
                stages::source(&self.aggregator, &query, &self.constraints),
            )
            .await?;
        let report = sourcing.report();
        let ranked: Vec<_> = report
            .ranked
            .iter()
            .take(self.settings.ranked_offers)
            .cloned()
            .collect();

        let selected = match &sourcing {
            SourcingOutcome::Found { selected, .. } => selected.clone(),
            SourcingOutcome::NoOfferFound { .. } => {
                self.note(row_key, "no sourcing found".to_string()).await;
                return Ok(ResultRecord::new(
                    reference,
                    item,
                    query,
                    Vec::new(),
                    Verdict::NoSourcingFound,
                ));
            }
        };
        self.note(
            row_key,
            format!(
                "sourcing: {} offers, cheapest {} from {}",
                report.ranked.len(),
                selected.landed_cost(),
                selected.provider_id
            ),
        )
        .await;

        let package = self
            .capture_stage("estimate_package", stages, stages::estimate(&item))
            .await?;
        let inputs = ProfitInputs {
            source_price: selected.landed_cost(),
            sell_price: item.listing_price,
            listing_shipping: item.listing_shipping_cost,
            weight_g: Some(package.actual_g),
            dimensions_cm: Some(package.dimensions_cm),
            item_url: Some(reference.clone()),
            category_id: item.category_id.clone(),
        };
        let result = self
            .capture_stage(
                "profit",
                stages,
                stages::price(&self.strategies, &inputs),
            )
            .await?;
        self.note(
            row_key,
            format!(
                "profit {} ({}%) via {}",
                result.profit_amount,
                result.profit_margin_pct,
                result.source.as_str()
            ),
        )
        .await;

        Ok(ResultRecord::new(
            reference,
            item,
            query,
            ranked,
            Verdict::Profit(result),
        ))
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

fn build_pool(
    surface: Arc<dyn CalculationSurface>,
    settings: &Settings,
    fence: Option<RedisFence>,
) -> Result<SurfacePool, PipelineError> {
    let bridges = settings
        .surface
        .rows
        .iter()
        .map(|row| {
            SurfaceLayout::at_row(settings.surface.sheet.clone(), *row).map(|layout| {
                CalculationBridge::new(surface.clone(), layout, settings.surface.poll_interval)
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| PipelineError::validation("surface", err.to_string()))?;
    SurfacePool::new(bridges, fence).map_err(|err| PipelineError::validation("surface", err.to_string()))
}

/// Surface first, local formula second.
fn strategies(pool: SurfacePool, settings: &Settings) -> Vec<Arc<dyn ProfitStrategy>> {
    vec![
        Arc::new(SurfaceStrategy::new(
            pool,
            settings.surface.lock_wait,
            settings.surface.max_wait,
        )),
        Arc::new(FallbackStrategy::new(settings.fees.clone())),
    ]
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("unhandled panic: {detail}")
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    /// Bad request data; retrying cannot help.
    Validation,
    /// The row is processing or already terminal; the row was not touched.
    AlreadyRunning,
    /// The marketplace item could not be fetched.
    Lookup,
    /// No profit strategy produced a valid result.
    Exhausted,
    Timeout,
    Internal,
}

impl PipelineError {
    pub fn validation(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Validation)
    }

    pub fn already_running(message: impl Into<String>) -> Self {
        Self::with_kind("begin", message, PipelineErrorKind::AlreadyRunning)
    }

    pub fn lookup(err: LookupError) -> Self {
        let kind = match err {
            LookupError::InvalidReference(_) => PipelineErrorKind::Validation,
            _ => PipelineErrorKind::Lookup,
        };
        Self::with_kind("fetch_item", err.to_string(), kind)
    }

    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::with_kind("profit", message, PipelineErrorKind::Exhausted)
    }

    pub fn timeout(budget: Duration) -> Self {
        Self::with_kind(
            "pipeline",
            format!("timed out after {}s", budget.as_secs()),
            PipelineErrorKind::Timeout,
        )
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Internal)
    }

    fn with_kind(stage: &'static str, message: impl Into<String>, kind: PipelineErrorKind) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

pub mod stages {
    use super::*;
    use crate::models::ProfitResult;
    use crate::sourcing::SourcingOutcome;

    pub async fn fetch_item(
        lookup: &dyn ItemLookup,
        reference: &str,
    ) -> Result<StageOutcome<ItemSnapshot>, PipelineError> {
        let item = lookup.fetch(reference).await.map_err(PipelineError::lookup)?;
        let output = json!({
            "lookup": lookup.name(),
            "item_id": item.item_id,
            "title": item.title,
            "price": item.listing_price,
            "shipping": item.listing_shipping_cost,
            "sell_total": item.sell_total(),
            "currency": item.currency,
        });
        Ok(StageOutcome::new(item, output))
    }

    /// Falls back to the raw title when nothing survives the cleanup.
    pub async fn derive(item: &ItemSnapshot) -> Result<StageOutcome<String>, PipelineError> {
        let derived = derive_query(&item.title);
        let (query, from_title) = if derived.is_empty() {
            (item.title.trim().to_string(), true)
        } else {
            (derived, false)
        };
        let output = json!({ "query": query, "raw_title": from_title });
        Ok(StageOutcome::new(query, output))
    }

    /// The listing's own weight wins over the table; dimensions always come
    /// from the table since listings rarely carry them.
    pub async fn estimate(
        item: &ItemSnapshot,
    ) -> Result<StageOutcome<PackageEstimate>, PipelineError> {
        let text = match &item.category {
            Some(category) => format!("{} {category}", item.title),
            None => item.title.clone(),
        };
        let package = estimate_package(&text, item.listing_price, item.weight_g);
        let output = serde_json::to_value(&package)
            .map_err(|err| PipelineError::internal("estimate_package", err.to_string()))?;
        Ok(StageOutcome::new(package, output))
    }

    pub async fn source(
        aggregator: &SourcingAggregator,
        query: &str,
        constraints: &SearchConstraints,
    ) -> Result<StageOutcome<SourcingOutcome>, PipelineError> {
        let outcome = if query.is_empty() {
            SourcingOutcome::NoOfferFound {
                report: crate::sourcing::SourcingReport {
                    query: String::new(),
                    providers: Vec::new(),
                    ranked: Vec::new(),
                },
            }
        } else {
            aggregator.search(query, constraints).await
        };
        let output = serde_json::to_value(&outcome)
            .map_err(|err| PipelineError::internal("sourcing", err.to_string()))?;
        Ok(StageOutcome::new(outcome, output))
    }

    pub async fn price(
        strategies: &[Arc<dyn ProfitStrategy>],
        inputs: &ProfitInputs,
    ) -> Result<StageOutcome<ProfitResult>, PipelineError> {
        let resolution = profit::resolve(strategies, inputs).await;
        let output = json!({ "inputs": inputs, "attempts": resolution.attempts });
        match resolution.result {
            Some(result) => Ok(StageOutcome::new(result, output)),
            None => {
                let reasons: Vec<String> = resolution
                    .attempts
                    .iter()
                    .filter_map(|attempt| match &attempt.outcome {
                        profit::StrategyOutcome::Invalid { reason } => {
                            Some(format!("{}: {reason}", attempt.source.as_str()))
                        }
                        profit::StrategyOutcome::Valid(_) => None,
                    })
                    .collect();
                Err(PipelineError::exhausted(format!(
                    "no profit strategy succeeded ({})",
                    reasons.join("; ")
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeeConfig;
    use crate::models::{ProfitSource, SourcingOffer};
    use crate::profit::fallback;
    use crate::sourcing::ProviderError;
    use crate::surface::{CellRef, CellValue, SurfaceError, WriteMode};
    use async_trait::async_trait;
    use std::collections::HashMap;

    fn offer(provider: &str, price: f64, shipping: f64, url: &str) -> SourcingOffer {
        SourcingOffer {
            provider_id: provider.into(),
            unit_price: price,
            shipping_cost: shipping,
            source_url: url.into(),
            title: String::new(),
        }
    }

    fn test_settings() -> Settings {
        let mut settings = Settings::default();
        settings.surface.poll_interval = Duration::from_millis(5);
        settings.surface.max_wait = Duration::from_millis(300);
        settings.surface.lock_wait = Duration::from_secs(2);
        settings.surface.simulated_propagation = Duration::from_millis(20);
        settings
    }

    fn three_provider_fixture() -> Vec<Arc<dyn SourcingProvider>> {
        vec![
            Arc::new(StaticProvider::new(
                "rakuten",
                vec![offer("rakuten", 1200.0, 300.0, "https://item.rakuten.co.jp/a/1/")],
            )),
            Arc::new(StaticProvider::new(
                "yahoo",
                vec![offer(
                    "yahoo",
                    999.0,
                    500.0,
                    "https://store.shopping.yahoo.co.jp/b/2.html",
                )],
            )),
            Arc::new(StaticProvider::new(
                "serpapi",
                vec![offer("serpapi", 1500.0, 0.0, "https://www.yodobashi.com/product/3/")],
            )),
        ]
    }

    fn pipeline_with(
        lookup: Arc<dyn ItemLookup>,
        providers: Vec<Arc<dyn SourcingProvider>>,
        surface: Arc<dyn CalculationSurface>,
        settings: &Settings,
    ) -> Pipeline {
        let pool = build_pool(surface, settings, None).expect("pool");
        Pipeline::new(
            lookup,
            SourcingAggregator::new(providers, &settings.sourcing),
            SearchConstraints::from(&settings.sourcing),
            strategies(pool, settings),
            Arc::new(InMemoryRowStore::new()),
            settings.pipeline.clone(),
        )
    }

    /// Accepts writes and always reads back zeros.
    struct ZeroSurface;

    #[async_trait]
    impl CalculationSurface for ZeroSurface {
        fn name(&self) -> &'static str {
            "zero"
        }

        async fn write_cells(
            &self,
            _sheet: &str,
            _cells: &[(CellRef, CellValue)],
            _mode: WriteMode,
        ) -> Result<(), SurfaceError> {
            Ok(())
        }

        async fn read_cells(
            &self,
            _sheet: &str,
            cells: &[CellRef],
        ) -> Result<Vec<CellValue>, SurfaceError> {
            Ok(cells.iter().map(|_| CellValue::Number(0.0)).collect())
        }
    }

    struct PanickingLookup;

    #[async_trait]
    impl ItemLookup for PanickingLookup {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn fetch(&self, _reference: &str) -> Result<ItemSnapshot, LookupError> {
            panic!("lookup exploded");
        }
    }

    struct StalledProvider;

    #[async_trait]
    impl SourcingProvider for StalledProvider {
        fn id(&self) -> &str {
            "stalled"
        }

        async fn search(&self, _: &str, _: usize) -> Result<Vec<SourcingOffer>, ProviderError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        }
    }

    /// Serves a different listing per item id.
    struct MapLookup(HashMap<String, ItemSnapshot>);

    #[async_trait]
    impl ItemLookup for MapLookup {
        fn name(&self) -> &'static str {
            "map"
        }

        async fn fetch(&self, reference: &str) -> Result<ItemSnapshot, LookupError> {
            self.0
                .get(reference)
                .cloned()
                .ok_or_else(|| LookupError::NotFound(reference.to_string()))
        }
    }

    fn simulated(settings: &Settings) -> Arc<dyn CalculationSurface> {
        Arc::new(SimulatedSurface::new(
            settings.fees.clone(),
            settings.surface.simulated_propagation,
        ))
    }

    #[tokio::test]
    async fn cheapest_offer_is_priced_on_the_surface() {
        let settings = test_settings();
        let pipeline = pipeline_with(
            Arc::new(DemoLookup::new()),
            three_provider_fixture(),
            simulated(&settings),
            &settings,
        );
        let outcome = pipeline
            .run(ResearchRequest::new("https://www.ebay.com/itm/256789012345", "12"))
            .await
            .expect("run");
        assert_eq!(outcome.status, RowStatus::Done);
        assert_eq!(outcome.result.offers.len(), 3);
        assert_eq!(outcome.result.offers[0].landed_cost(), 1499.0);
        assert_eq!(outcome.result.offers[0].provider_id, "yahoo");
        let profit = outcome.result.profit().expect("profit verdict");
        assert_eq!(profit.source, ProfitSource::Surface);

        let stage_names: Vec<_> = outcome.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            stage_names,
            vec![
                "validate",
                "fetch_item",
                "derive_query",
                "sourcing",
                "estimate_package",
                "profit"
            ]
        );
        let profit_stage = &outcome.stages[5];
        assert_eq!(profit_stage.output["inputs"]["weight_g"], json!(700));
        assert_eq!(
            profit_stage.output["inputs"]["dimensions_cm"],
            json!([28.0, 20.0, 12.0])
        );

        let row = pipeline.rows().load("12").await.expect("load").expect("row");
        assert_eq!(row.status, RowStatus::Done);
        assert!(row.log.iter().any(|line| line.ends_with("- processing started")));
        assert!(row.log.iter().any(|line| line.contains("via surface")));
        assert_eq!(row.result.as_ref(), Some(&outcome.result));
    }

    #[tokio::test]
    async fn zero_sentinel_on_the_surface_falls_back() {
        let mut settings = test_settings();
        settings.surface.max_wait = Duration::from_millis(40);
        let pipeline = pipeline_with(
            Arc::new(DemoLookup::new()),
            three_provider_fixture(),
            Arc::new(ZeroSurface),
            &settings,
        );
        let outcome = pipeline
            .run(ResearchRequest::new("256789012345", "c"))
            .await
            .expect("run");
        let profit = outcome.result.profit().expect("profit verdict");
        assert_eq!(profit.source, ProfitSource::Fallback);

        let item = DemoLookup::sample_snapshot("256789012345");
        let expected = fallback::compute(
            1499.0,
            item.sell_total(),
            settings.fees.outbound_shipping,
            &settings.fees,
        )
        .expect("fallback");
        assert_eq!(profit.profit_amount, expected.profit_amount);
        assert_eq!(profit.profit_margin_pct, expected.profit_margin_pct);
    }

    #[tokio::test]
    async fn empty_sourcing_is_done_not_error() {
        let settings = test_settings();
        let providers: Vec<Arc<dyn SourcingProvider>> = vec![
            Arc::new(StaticProvider::new("rakuten", Vec::new())),
            Arc::new(StaticProvider::new("yahoo", Vec::new())),
        ];
        let pipeline = pipeline_with(
            Arc::new(DemoLookup::new()),
            providers,
            simulated(&settings),
            &settings,
        );
        let outcome = pipeline
            .run(ResearchRequest::new("256789012345", "e"))
            .await
            .expect("run");
        assert_eq!(outcome.status, RowStatus::Done);
        assert_eq!(outcome.result.verdict, Verdict::NoSourcingFound);
        assert!(outcome.result.offers.is_empty());
        let row = pipeline.rows().load("e").await.expect("load").expect("row");
        assert_eq!(row.status, RowStatus::Done);
        assert!(row.cause.is_none());
    }

    #[tokio::test]
    async fn concurrent_rows_share_one_scratch_row_without_mixing() {
        let settings = test_settings();
        let snapshot = |id: &str, price: f64| ItemSnapshot {
            listing_price: price,
            ..DemoLookup::sample_snapshot(id)
        };
        let lookup = MapLookup(HashMap::from([
            ("1001".to_string(), snapshot("1001", 40.0)),
            ("1002".to_string(), snapshot("1002", 90.0)),
        ]));
        let pipeline = pipeline_with(
            Arc::new(lookup),
            three_provider_fixture(),
            simulated(&settings),
            &settings,
        );
        let (first, second) = tokio::join!(
            pipeline.run(ResearchRequest::new("1001", "row-a")),
            pipeline.run(ResearchRequest::new("1002", "row-b")),
        );
        let fees = FeeConfig::default();
        // the cheaper kit packs into a smaller box: 1344 g volumetric ships
        // by EMS, the pricier one bills 2625 g and goes FedEx
        for (outcome, listing_price, shipping) in [(first, 40.0, 3000.0), (second, 90.0, 5000.0)] {
            let outcome = outcome.expect("run");
            let profit = outcome.result.profit().expect("profit verdict").clone();
            assert_eq!(profit.source, ProfitSource::Surface);
            let expected = fallback::compute(1499.0, listing_price + 15.0, shipping, &fees)
                .expect("expected");
            assert_eq!(profit.profit_amount, expected.profit_amount);
            assert_eq!(
                profit.profit_amount_with_rebate,
                expected.profit_amount_with_rebate
            );
        }
    }

    #[tokio::test]
    async fn second_run_on_a_processing_row_is_refused() {
        let settings = test_settings();
        let pipeline = Pipeline::demo(&settings).expect("demo");
        pipeline
            .rows()
            .transition("busy", Transition::Begin)
            .await
            .expect("begin");
        let err = pipeline
            .run(ResearchRequest::new("256789012345", "busy"))
            .await
            .expect_err("already running");
        assert_eq!(err.kind(), PipelineErrorKind::AlreadyRunning);
        let row = pipeline.rows().load("busy").await.expect("load").expect("row");
        assert_eq!(row.status, RowStatus::Processing);
    }

    #[tokio::test]
    async fn lookup_failure_ends_in_error() {
        let settings = test_settings();
        let pipeline = pipeline_with(
            Arc::new(DemoLookup::new().missing("404404")),
            three_provider_fixture(),
            simulated(&settings),
            &settings,
        );
        let err = pipeline
            .run(ResearchRequest::new("404404", "gone"))
            .await
            .expect_err("lookup failure");
        assert_eq!(err.kind(), PipelineErrorKind::Lookup);
        let row = pipeline.rows().load("gone").await.expect("load").expect("row");
        assert_eq!(row.status, RowStatus::Error);
        assert!(row.cause.as_deref().is_some_and(|c| c.contains("not found")));
    }

    #[tokio::test]
    async fn panics_become_internal_errors() {
        let settings = test_settings();
        let pipeline = pipeline_with(
            Arc::new(PanickingLookup),
            three_provider_fixture(),
            simulated(&settings),
            &settings,
        );
        let err = pipeline
            .run(ResearchRequest::new("1", "boom"))
            .await
            .expect_err("panic");
        assert_eq!(err.kind(), PipelineErrorKind::Internal);
        assert!(err.detail().contains("lookup exploded"));
        let row = pipeline.rows().load("boom").await.expect("load").expect("row");
        assert_eq!(row.status, RowStatus::Error);
    }

    #[tokio::test]
    async fn deadline_expiry_fails_the_row() {
        let mut settings = test_settings();
        settings.pipeline.deadline = Duration::from_secs(1);
        settings.pipeline.deadline_margin = Duration::ZERO;
        let pipeline = pipeline_with(
            Arc::new(DemoLookup::new()),
            vec![Arc::new(StalledProvider)],
            simulated(&settings),
            &settings,
        );
        let err = pipeline
            .run(ResearchRequest::new("1", "slow"))
            .await
            .expect_err("deadline");
        assert_eq!(err.kind(), PipelineErrorKind::Timeout);
        let row = pipeline.rows().load("slow").await.expect("load").expect("row");
        assert_eq!(row.status, RowStatus::Error);
        assert!(row.cause.as_deref().is_some_and(|c| c.contains("timed out")));
    }

    #[tokio::test]
    async fn empty_item_reference_is_a_validation_error() {
        let settings = test_settings();
        let pipeline = Pipeline::demo(&settings).expect("demo");
        let err = pipeline
            .run(ResearchRequest::new("   ", "blank"))
            .await
            .expect_err("validation");
        assert_eq!(err.kind(), PipelineErrorKind::Validation);
        let row = pipeline.rows().load("blank").await.expect("load").expect("row");
        assert_eq!(row.status, RowStatus::Error);

        let err = pipeline
            .run(ResearchRequest::new("1", " "))
            .await
            .expect_err("no row key");
        assert_eq!(err.kind(), PipelineErrorKind::Validation);
    }
}
