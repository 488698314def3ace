//! Reconciliation pipeline: strategy chains, merge + non-regression guard, auth alerts, persistence.

use std::collections::HashSet;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ppr_adapters::{
    build_strategies, normalize, AuthSignals, CanonicalRecord, Credentials, FetchStrategy,
    PaginationLimits, RunContext, SignedCredentials, SourceEndpoints, StrategyError,
    StrategyRegistry,
};
use ppr_core::{
    AnalyticsMetrics, AnalyticsSnapshot, CreatorPayoutRecord, DistributionPayoutRecord,
    FetchStatus, Keyed, RecordCategory,
};
use ppr_storage::{HttpClientConfig, HttpFetcher, HttpRequest, StateFile};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const ALERT_TITLE: &str = "Partner platform credential expired";

const REMEDIATION_STEPS: &str = "\
### Remediation

1. Sign in to the partner dashboard in a browser with the reporting account.
2. Copy the current session cookie (or regenerate the open-API access token).
3. Update the `PPR_SESSION_COOKIE` secret (or `PPR_ACCESS_TOKEN`) in the scheduler environment.
4. Trigger a manual sync run and confirm the affected categories report `fetched`.
5. Close this issue; a new one is opened automatically if the credential expires again.
";

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub state_path: PathBuf,
    pub reports_dir: Option<PathBuf>,
    pub strategies_file: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub max_pages: u32,
    pub page_size: u32,
    pub user_agent: String,
    pub open_api_base_url: String,
    pub app_key: Option<String>,
    pub app_secret: Option<String>,
    pub access_token: Option<String>,
    pub session_base_url: String,
    pub session_cookie: Option<String>,
    pub extra_auth_codes: Vec<i64>,
    pub alert_api_url: String,
    pub alert_repo: Option<String>,
    pub alert_token: Option<String>,
    pub alert_label: String,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        let endpoints = SourceEndpoints::default();
        let limits = PaginationLimits::default();
        Self {
            state_path: env_opt("PPR_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data/finance.json")),
            reports_dir: env_opt("PPR_REPORTS_DIR").map(PathBuf::from),
            strategies_file: env_opt("PPR_STRATEGIES_FILE").map(PathBuf::from),
            http_timeout_secs: env_opt("PPR_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            max_pages: env_opt("PPR_MAX_PAGES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(limits.max_pages),
            page_size: env_opt("PPR_PAGE_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(limits.page_size),
            user_agent: env_opt("PPR_USER_AGENT").unwrap_or_else(|| "ppr-bot/0.1".to_string()),
            open_api_base_url: env_opt("PPR_OPEN_API_BASE_URL")
                .unwrap_or(endpoints.open_api_base_url),
            app_key: env_opt("PPR_APP_KEY"),
            app_secret: env_opt("PPR_APP_SECRET"),
            access_token: env_opt("PPR_ACCESS_TOKEN"),
            session_base_url: env_opt("PPR_SESSION_BASE_URL").unwrap_or(endpoints.session_base_url),
            session_cookie: env_opt("PPR_SESSION_COOKIE"),
            extra_auth_codes: env_opt("PPR_AUTH_ERROR_CODES")
                .map(|v| parse_code_list(&v))
                .unwrap_or_default(),
            alert_api_url: env_opt("PPR_ALERT_API_URL")
                .unwrap_or_else(|| "https://api.github.com".to_string()),
            alert_repo: env_opt("PPR_ALERT_REPO"),
            alert_token: env_opt("PPR_ALERT_TOKEN"),
            alert_label: env_opt("PPR_ALERT_LABEL").unwrap_or_else(|| "auth-expired".to_string()),
        }
    }

    /// The signed triple is only usable when all three parts are present.
    pub fn credentials(&self) -> Credentials {
        let signed = match (&self.app_key, &self.app_secret, &self.access_token) {
            (Some(app_key), Some(app_secret), Some(access_token)) => Some(SignedCredentials {
                app_key: app_key.clone(),
                app_secret: app_secret.clone(),
                access_token: access_token.clone(),
            }),
            _ => None,
        };
        Credentials {
            signed,
            session_cookie: self.session_cookie.clone(),
        }
    }

    pub fn run_context(&self, run_date: NaiveDate) -> RunContext {
        RunContext {
            run_id: Uuid::new_v4(),
            run_date,
            credentials: self.credentials(),
            endpoints: SourceEndpoints {
                open_api_base_url: self.open_api_base_url.clone(),
                session_base_url: self.session_base_url.clone(),
            },
            pagination: PaginationLimits {
                max_pages: self.max_pages.max(1),
                page_size: self.page_size.max(1),
            },
            auth_signals: AuthSignals::with_extra_codes(self.extra_auth_codes.iter().copied()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn load_registry(&self) -> Result<StrategyRegistry> {
        match &self.strategies_file {
            Some(path) => StrategyRegistry::load(path),
            None => Ok(StrategyRegistry::builtin()),
        }
    }

    pub fn alert_sink(&self, http: &Arc<HttpFetcher>) -> Option<Arc<dyn AlertSink>> {
        match (&self.alert_repo, &self.alert_token) {
            (Some(repo), Some(token)) => Some(Arc::new(GithubIssueSink::new(
                Arc::clone(http),
                self.alert_api_url.clone(),
                repo.clone(),
                token.clone(),
            ))),
            _ => None,
        }
    }
}

fn parse_code_list(raw: &str) -> Vec<i64> {
    raw.split(',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyAttempt {
    pub strategy: String,
    /// `fetched`, `confirmed_empty`, or the failure classification label.
    pub outcome: String,
    pub detail: Option<String>,
}

/// Result of one category's strategy chain.
#[derive(Debug, Clone)]
pub struct CategoryFetch<T> {
    pub category: RecordCategory,
    pub status: FetchStatus,
    pub records: Vec<T>,
    pub unparseable: usize,
    pub strategy: Option<String>,
    pub attempts: Vec<StrategyAttempt>,
    pub auth_failure: Option<String>,
}

impl<T> CategoryFetch<T> {
    /// The chain ran dry and at least one strategy was rejected for an expired credential.
    pub fn terminated_in_auth_failure(&self) -> bool {
        self.status == FetchStatus::NoData && self.auth_failure.is_some()
    }
}

/// Ordered fetch strategies for one record category.
pub struct StrategyChain<T> {
    strategies: Vec<Arc<dyn FetchStrategy>>,
    _record: PhantomData<fn() -> T>,
}

impl<T: CanonicalRecord> StrategyChain<T> {
    pub fn new(strategies: Vec<Arc<dyn FetchStrategy>>) -> Self {
        Self {
            strategies,
            _record: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Try each strategy in order; the first with parseable records (or a confirmed zero) wins.
    pub async fn run(&self, ctx: &RunContext) -> CategoryFetch<T> {
        let category = T::CATEGORY;
        let span = info_span!("category_chain", run_id = %ctx.run_id, %category);
        async move {
            let mut result = CategoryFetch {
                category,
                status: FetchStatus::NoData,
                records: Vec::new(),
                unparseable: 0,
                strategy: None,
                attempts: Vec::new(),
                auth_failure: None,
            };

            for strategy in &self.strategies {
                let name = strategy.name().to_string();
                let err = match strategy.fetch(ctx).await {
                    Ok(batch) => {
                        let normalized = normalize::<T>(&batch.records, strategy.kind());
                        result.unparseable += normalized.unparseable;

                        if !normalized.records.is_empty() {
                            info!(
                                strategy = %name,
                                records = normalized.records.len(),
                                unparseable = normalized.unparseable,
                                "strategy produced records"
                            );
                            result.attempts.push(StrategyAttempt {
                                strategy: name.clone(),
                                outcome: "fetched".to_string(),
                                detail: None,
                            });
                            result.status = FetchStatus::Fetched;
                            result.records = normalized.records;
                            result.strategy = Some(name);
                            break;
                        }

                        if batch.records.is_empty() && batch.confirmed_empty {
                            info!(strategy = %name, "source confirmed zero records");
                            result.attempts.push(StrategyAttempt {
                                strategy: name.clone(),
                                outcome: "confirmed_empty".to_string(),
                                detail: None,
                            });
                            result.status = FetchStatus::ConfirmedEmpty;
                            result.strategy = Some(name);
                            break;
                        }

                        if batch.records.is_empty() {
                            StrategyError::EmptyUnconfirmed
                        } else {
                            StrategyError::Malformed(format!(
                                "{} raw records, none parseable",
                                batch.records.len()
                            ))
                        }
                    }
                    Err(err) => err,
                };

                match &err {
                    StrategyError::NotConfigured(_) => {
                        debug!(strategy = %name, %err, "skipping strategy");
                    }
                    StrategyError::AuthExpired(detail) => {
                        warn!(strategy = %name, classification = err.label(), %err, "strategy failed");
                        result.auth_failure.get_or_insert_with(|| detail.clone());
                    }
                    _ => {
                        warn!(strategy = %name, classification = err.label(), %err, "strategy failed");
                    }
                }
                result.attempts.push(StrategyAttempt {
                    strategy: name,
                    outcome: err.label().to_string(),
                    detail: Some(err.to_string()),
                });
            }

            if result.status != FetchStatus::NoData && result.auth_failure.is_some() {
                warn!(
                    strategy = ?result.strategy,
                    "an earlier strategy reported an expired credential; a later strategy recovered"
                );
            }
            if result.status == FetchStatus::NoData {
                warn!(
                    attempts = result.attempts.len(),
                    unparseable = result.unparseable,
                    auth_expired = result.auth_failure.is_some(),
                    "all strategies exhausted without usable data"
                );
            }
            result
        }
        .instrument(span)
        .await
    }
}

/// Incoming records first so they win key collisions; first occurrence per key is kept;
/// stable sort by date descending.
pub fn merge_records<T: Keyed + Clone>(existing: &[T], incoming: &[T]) -> Vec<T> {
    let mut seen = HashSet::new();
    let mut merged: Vec<T> = incoming
        .iter()
        .chain(existing.iter())
        .filter(|record| seen.insert(record.identity_key()))
        .cloned()
        .collect();
    merged.sort_by(|a, b| b.date().cmp(&a.date()));
    merged
}

/// Non-regression guard: returns the records to commit and whether the guard fired.
/// Only a `ConfirmedEmpty` status may replace non-empty history with an empty collection.
pub fn guard_non_regression<T: Clone>(
    existing: &[T],
    candidate: Vec<T>,
    status: FetchStatus,
) -> (Vec<T>, bool) {
    if candidate.is_empty() && !existing.is_empty() && status != FetchStatus::ConfirmedEmpty {
        (existing.to_vec(), true)
    } else {
        (candidate, false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Fresh records merged into the persisted collection.
    Merged,
    /// Fetch result discarded; persisted state kept unchanged.
    Preserved,
    /// Source confirmed an empty history; collection emptied.
    Cleared,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCollection<T> {
    pub records: Vec<T>,
    pub resolution: Resolution,
    pub added: usize,
    pub replaced: usize,
}

pub fn resolve_collection<T: Keyed + Clone>(
    category: RecordCategory,
    existing: &[T],
    status: FetchStatus,
    incoming: &[T],
) -> ResolvedCollection<T> {
    let candidate = match status {
        FetchStatus::Fetched => merge_records(existing, incoming),
        FetchStatus::ConfirmedEmpty | FetchStatus::NoData => Vec::new(),
    };
    let (records, guarded) = guard_non_regression(existing, candidate, status);

    if guarded {
        warn!(
            %category,
            ?status,
            preserved = existing.len(),
            "non-regression guard kept persisted records instead of an empty result"
        );
        return ResolvedCollection {
            records,
            resolution: Resolution::Preserved,
            added: 0,
            replaced: 0,
        };
    }

    match status {
        FetchStatus::Fetched => {
            let existing_keys: HashSet<String> = existing.iter().map(Keyed::identity_key).collect();
            let incoming_keys: HashSet<String> = incoming.iter().map(Keyed::identity_key).collect();
            let replaced = incoming_keys.intersection(&existing_keys).count();
            ResolvedCollection {
                added: incoming_keys.len() - replaced,
                replaced,
                records,
                resolution: Resolution::Merged,
            }
        }
        FetchStatus::ConfirmedEmpty => {
            if !existing.is_empty() {
                warn!(%category, removed = existing.len(), "source confirmed empty history; clearing collection");
            }
            ResolvedCollection {
                records,
                resolution: Resolution::Cleared,
                added: 0,
                replaced: 0,
            }
        }
        FetchStatus::NoData => ResolvedCollection {
            records,
            resolution: Resolution::Preserved,
            added: 0,
            replaced: 0,
        },
    }
}

/// Analytics is a single snapshot: replaced on success, untouched on `NoData`.
pub fn resolve_analytics(
    existing: &AnalyticsSnapshot,
    fetch: &CategoryFetch<AnalyticsMetrics>,
    run_date: NaiveDate,
) -> (AnalyticsSnapshot, Resolution) {
    match fetch.status {
        FetchStatus::Fetched => {
            let metrics = fetch
                .records
                .iter()
                .fold(AnalyticsMetrics::default(), |acc, m| acc.combine(m));
            let mut snapshot = existing.clone();
            snapshot.apply(&metrics, run_date);
            (snapshot, Resolution::Merged)
        }
        FetchStatus::ConfirmedEmpty => {
            let mut snapshot = existing.clone();
            snapshot.apply(&AnalyticsMetrics::default(), run_date);
            (snapshot, Resolution::Cleared)
        }
        FetchStatus::NoData => {
            if existing.last_updated.is_some() {
                warn!(
                    last_updated = ?existing.last_updated,
                    "non-regression guard kept the previous analytics snapshot"
                );
            }
            (existing.clone(), Resolution::Preserved)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAlert {
    pub number: u64,
    pub title: String,
}

/// External ticketing collaborator. Idempotency is the dispatcher's job, not the sink's.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn search_open(&self, ctx: &RunContext, label: &str) -> Result<Vec<OpenAlert>>;
    async fn create(
        &self,
        ctx: &RunContext,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<OpenAlert>;
}

/// GitHub issues used as the alert channel.
pub struct GithubIssueSink {
    http: Arc<HttpFetcher>,
    api_url: String,
    repo: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct IssueRow {
    number: u64,
    title: String,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

impl GithubIssueSink {
    pub fn new(http: Arc<HttpFetcher>, api_url: String, repo: String, token: String) -> Self {
        Self {
            http,
            api_url,
            repo,
            token,
        }
    }

    fn issues_url(&self) -> String {
        format!("{}/repos/{}/issues", self.api_url.trim_end_matches('/'), self.repo)
    }

    fn authorize(&self, request: HttpRequest) -> HttpRequest {
        request
            .header("authorization", format!("Bearer {}", self.token))
            .header("accept", "application/vnd.github+json")
            .header("x-github-api-version", "2022-11-28")
    }
}

#[async_trait]
impl AlertSink for GithubIssueSink {
    async fn search_open(&self, ctx: &RunContext, label: &str) -> Result<Vec<OpenAlert>> {
        let request = self.authorize(
            HttpRequest::get(self.issues_url())
                .query("state", "open")
                .query("labels", label)
                .query("per_page", "100"),
        );
        let response = self
            .http
            .send(ctx.run_id, "alert_search", request)
            .await
            .context("searching open alert issues")?;
        let rows: Vec<IssueRow> =
            serde_json::from_slice(&response.body).context("parsing issue search response")?;
        Ok(rows
            .into_iter()
            .filter(|row| row.pull_request.is_none())
            .map(|row| OpenAlert {
                number: row.number,
                title: row.title,
            })
            .collect())
    }

    async fn create(
        &self,
        ctx: &RunContext,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<OpenAlert> {
        let request = self.authorize(HttpRequest::post_json(
            self.issues_url(),
            serde_json::json!({ "title": title, "body": body, "labels": labels }),
        ));
        let response = self
            .http
            .send(ctx.run_id, "alert_create", request)
            .await
            .context("creating alert issue")?;
        let row: IssueRow =
            serde_json::from_slice(&response.body).context("parsing created issue response")?;
        Ok(OpenAlert {
            number: row.number,
            title: row.title,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthFailure {
    pub category: RecordCategory,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AlertOutcome {
    NotNeeded,
    Disabled,
    AlreadyOpen { number: u64 },
    Created { number: u64 },
    Failed { error: String },
}

/// Best-effort, at-most-one-open-alert notification for expired credentials.
pub struct AlertDispatcher {
    sink: Option<Arc<dyn AlertSink>>,
    label: String,
}

impl AlertDispatcher {
    pub fn new(sink: Option<Arc<dyn AlertSink>>, label: impl Into<String>) -> Self {
        Self {
            sink,
            label: label.into(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, "auth-expired")
    }

    pub async fn dispatch(&self, ctx: &RunContext, failures: &[AuthFailure]) -> AlertOutcome {
        if failures.is_empty() {
            return AlertOutcome::NotNeeded;
        }
        let Some(sink) = &self.sink else {
            warn!(
                categories = failures.len(),
                "credential expired but no alert sink is configured"
            );
            return AlertOutcome::Disabled;
        };

        match sink.search_open(ctx, &self.label).await {
            Ok(open) => {
                if let Some(existing) = open.first() {
                    info!(number = existing.number, label = %self.label, "auth alert already open");
                    return AlertOutcome::AlreadyOpen {
                        number: existing.number,
                    };
                }
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "alert search failed; skipping alert");
                return AlertOutcome::Failed {
                    error: format!("{err:#}"),
                };
            }
        }

        let body = alert_body(ctx, failures);
        match sink
            .create(ctx, ALERT_TITLE, &body, std::slice::from_ref(&self.label))
            .await
        {
            Ok(alert) => {
                info!(number = alert.number, "auth alert created");
                AlertOutcome::Created {
                    number: alert.number,
                }
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "alert creation failed");
                AlertOutcome::Failed {
                    error: format!("{err:#}"),
                }
            }
        }
    }
}

pub fn alert_body(ctx: &RunContext, failures: &[AuthFailure]) -> String {
    let details = failures
        .iter()
        .map(|f| format!("- `{}`: {}", f.category, f.detail))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "The scheduled payout sync could not authenticate against the partner platform.\n\n\
         - Run ID: `{}`\n- Run date: {}\n\n### Affected categories\n{}\n\n{}",
        ctx.run_id, ctx.run_date, details, REMEDIATION_STEPS
    )
}

/// One strategy chain per record category.
pub struct CategoryChains {
    pub distribution: StrategyChain<DistributionPayoutRecord>,
    pub creator: StrategyChain<CreatorPayoutRecord>,
    pub analytics: StrategyChain<AnalyticsMetrics>,
}

impl CategoryChains {
    pub fn from_registry(registry: &StrategyRegistry, http: &Arc<HttpFetcher>) -> Self {
        Self {
            distribution: StrategyChain::new(build_strategies(
                registry,
                RecordCategory::DistributionPayouts,
                http,
            )),
            creator: StrategyChain::new(build_strategies(
                registry,
                RecordCategory::CreatorPayouts,
                http,
            )),
            analytics: StrategyChain::new(build_strategies(registry, RecordCategory::Analytics, http)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CategorySummary {
    pub category: RecordCategory,
    pub status: FetchStatus,
    pub strategy: Option<String>,
    pub incoming: usize,
    pub unparseable: usize,
    pub resulting: usize,
    pub added: usize,
    pub replaced: usize,
    pub resolution: Resolution,
    pub auth_expired: bool,
    pub attempts: Vec<StrategyAttempt>,
}

impl CategorySummary {
    fn from_fetch<T>(fetch: &CategoryFetch<T>, resulting: usize, resolution: Resolution) -> Self {
        Self {
            category: fetch.category,
            status: fetch.status,
            strategy: fetch.strategy.clone(),
            incoming: fetch.records.len(),
            unparseable: fetch.unparseable,
            resulting,
            added: 0,
            replaced: 0,
            resolution,
            auth_expired: fetch.terminated_in_auth_failure(),
            attempts: fetch.attempts.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub run_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state_path: String,
    pub state_bytes: usize,
    pub categories: Vec<CategorySummary>,
    pub auth_expired: bool,
    pub alert: AlertOutcome,
    pub report_path: Option<String>,
}

pub struct ReconcilePipeline {
    state_file: StateFile,
    chains: CategoryChains,
    alerts: AlertDispatcher,
    reports_dir: Option<PathBuf>,
}

impl ReconcilePipeline {
    pub fn new(state_file: StateFile, chains: CategoryChains, alerts: AlertDispatcher) -> Self {
        Self {
            state_file,
            chains,
            alerts,
            reports_dir: None,
        }
    }

    pub fn with_reports_dir(mut self, reports_dir: Option<PathBuf>) -> Self {
        self.reports_dir = reports_dir;
        self
    }

    /// Load once, fetch all categories concurrently, resolve, write once, alert at most once.
    /// A state file that cannot be read aborts the run before anything is written.
    /// An expired credential is alerted even when the write itself fails.
    pub async fn run_once(&self, ctx: &RunContext) -> Result<RunSummary> {
        let started_at = Utc::now();
        info!(
            run_id = %ctx.run_id,
            run_date = %ctx.run_date,
            credentials = ?ctx.credentials,
            state = %self.state_file.path().display(),
            "reconcile run starting"
        );
        if ctx.credentials.is_empty() {
            warn!(run_id = %ctx.run_id, "no credentials configured; persisted state will be preserved");
        }

        let loaded = self
            .state_file
            .load()
            .await
            .context("loading persisted state; refusing to overwrite it")?;
        if !loaded.existed {
            info!(path = %self.state_file.path().display(), "no persisted state yet; starting from the empty shape");
        }
        let mut state = loaded.state;

        let (distribution, creator, analytics) = tokio::join!(
            self.chains.distribution.run(ctx),
            self.chains.creator.run(ctx),
            self.chains.analytics.run(ctx),
        );

        let resolved_distribution = resolve_collection(
            distribution.category,
            &state.distribution_payouts,
            distribution.status,
            &distribution.records,
        );
        let resolved_creator = resolve_collection(
            creator.category,
            &state.payouts,
            creator.status,
            &creator.records,
        );
        let (snapshot, analytics_resolution) = resolve_analytics(&state.analytics, &analytics, ctx.run_date);

        let mut categories = Vec::with_capacity(3);
        categories.push(CategorySummary {
            added: resolved_distribution.added,
            replaced: resolved_distribution.replaced,
            ..CategorySummary::from_fetch(
                &distribution,
                resolved_distribution.records.len(),
                resolved_distribution.resolution,
            )
        });
        categories.push(CategorySummary {
            added: resolved_creator.added,
            replaced: resolved_creator.replaced,
            ..CategorySummary::from_fetch(
                &creator,
                resolved_creator.records.len(),
                resolved_creator.resolution,
            )
        });
        categories.push(CategorySummary::from_fetch(
            &analytics,
            usize::from(snapshot.last_updated.is_some()),
            analytics_resolution,
        ));

        state.distribution_payouts = resolved_distribution.records;
        state.payouts = resolved_creator.records;
        state.analytics = snapshot;

        let persisted = self.state_file.persist(&state).await;

        let failures: Vec<AuthFailure> = [
            (distribution.category, distribution.terminated_in_auth_failure(), &distribution.auth_failure),
            (creator.category, creator.terminated_in_auth_failure(), &creator.auth_failure),
            (analytics.category, analytics.terminated_in_auth_failure(), &analytics.auth_failure),
        ]
        .into_iter()
        .filter(|(_, terminated, _)| *terminated)
        .filter_map(|(category, _, detail)| {
            detail.clone().map(|detail| AuthFailure { category, detail })
        })
        .collect();
        let alert = self.alerts.dispatch(ctx, &failures).await;
        let persisted = persisted.context("writing persisted state")?;

        let mut summary = RunSummary {
            run_id: ctx.run_id,
            run_date: ctx.run_date,
            started_at,
            finished_at: Utc::now(),
            state_path: persisted.path.display().to_string(),
            state_bytes: persisted.byte_size,
            categories,
            auth_expired: !failures.is_empty(),
            alert,
            report_path: None,
        };

        for category in &summary.categories {
            info!(
                run_id = %summary.run_id,
                category = %category.category,
                status = ?category.status,
                resolution = ?category.resolution,
                strategy = ?category.strategy,
                incoming = category.incoming,
                unparseable = category.unparseable,
                resulting = category.resulting,
                "category resolved"
            );
        }

        if let Some(dir) = &self.reports_dir {
            match write_run_report(dir, &summary).await {
                Ok(path) => summary.report_path = Some(path.display().to_string()),
                Err(err) => warn!(error = %format!("{err:#}"), "run report not written"),
            }
        }

        info!(
            run_id = %summary.run_id,
            auth_expired = summary.auth_expired,
            alert = ?summary.alert,
            state_bytes = summary.state_bytes,
            "reconcile run complete"
        );
        Ok(summary)
    }
}

pub async fn write_run_report(reports_dir: &std::path::Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let path = run_dir.join("run_summary.json");
    let mut bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    bytes.push(b'\n');
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

pub async fn run_sync_once_from_env() -> Result<RunSummary> {
    let config = ReconcileConfig::from_env();
    let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let registry = config.load_registry()?;
    let ctx = config.run_context(Utc::now().date_naive());
    let alerts = AlertDispatcher::new(config.alert_sink(&http), config.alert_label.clone());
    let pipeline = ReconcilePipeline::new(
        StateFile::new(&config.state_path),
        CategoryChains::from_registry(&registry, &http),
        alerts,
    )
    .with_reports_dir(config.reports_dir.clone());
    pipeline.run_once(&ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use ppr_adapters::{RawBatch, StrategyKind};
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn ctx() -> RunContext {
        RunContext::new(date("2026-02-10"))
    }

    fn dist(id: &str, day: &str, paid: i64) -> DistributionPayoutRecord {
        DistributionPayoutRecord {
            statement_id: id.into(),
            date: date(day),
            settlement_amount: Decimal::from(paid),
            amount_paid: Decimal::from(paid),
            payout_type: "settlement".into(),
            currency: "USD".into(),
        }
    }

    fn ids(records: &[DistributionPayoutRecord]) -> Vec<&str> {
        records.iter().map(|r| r.statement_id.as_str()).collect()
    }

    struct FakeStrategy {
        name: &'static str,
        kind: StrategyKind,
        result: Result<RawBatch, StrategyError>,
        calls: AtomicU32,
    }

    impl FakeStrategy {
        fn arc(
            name: &'static str,
            kind: StrategyKind,
            result: Result<RawBatch, StrategyError>,
        ) -> Arc<FakeStrategy> {
            Arc::new(Self {
                name,
                kind,
                result,
                calls: AtomicU32::new(0),
            })
        }

        fn records(name: &'static str, records: Vec<serde_json::Value>) -> Arc<FakeStrategy> {
            Self::arc(
                name,
                StrategyKind::SessionApi,
                Ok(RawBatch {
                    records,
                    confirmed_empty: false,
                }),
            )
        }

        fn failing(name: &'static str, err: StrategyError) -> Arc<FakeStrategy> {
            Self::arc(name, StrategyKind::OpenApi, Err(err))
        }
    }

    #[async_trait]
    impl FetchStrategy for FakeStrategy {
        fn name(&self) -> &str {
            self.name
        }

        fn kind(&self) -> StrategyKind {
            self.kind
        }

        async fn fetch(&self, _ctx: &RunContext) -> Result<RawBatch, StrategyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn chain<T: CanonicalRecord>(strategies: Vec<Arc<FakeStrategy>>) -> StrategyChain<T> {
        StrategyChain::new(
            strategies
                .into_iter()
                .map(|s| s as Arc<dyn FetchStrategy>)
                .collect(),
        )
    }

    #[derive(Default)]
    struct MemorySink {
        open: Mutex<Vec<OpenAlert>>,
        created: Mutex<Vec<(String, String, Vec<String>)>>,
        fail_search: bool,
    }

    #[async_trait]
    impl AlertSink for MemorySink {
        async fn search_open(&self, _ctx: &RunContext, _label: &str) -> Result<Vec<OpenAlert>> {
            if self.fail_search {
                anyhow::bail!("search unavailable");
            }
            Ok(self.open.lock().unwrap().clone())
        }

        async fn create(
            &self,
            _ctx: &RunContext,
            title: &str,
            body: &str,
            labels: &[String],
        ) -> Result<OpenAlert> {
            let mut open = self.open.lock().unwrap();
            let alert = OpenAlert {
                number: open.len() as u64 + 1,
                title: title.to_string(),
            };
            open.push(alert.clone());
            self.created
                .lock()
                .unwrap()
                .push((title.to_string(), body.to_string(), labels.to_vec()));
            Ok(alert)
        }
    }

    #[test]
    fn merge_prefers_incoming_and_sorts_newest_first() {
        let existing = vec![dist("A", "2026-01-01", 100), dist("B", "2026-01-15", 50)];
        let incoming = vec![dist("B", "2026-01-15", 55), dist("C", "2026-02-01", 70)];

        let merged = merge_records(&existing, &incoming);

        assert_eq!(ids(&merged), vec!["C", "B", "A"]);
        assert_eq!(merged[1].amount_paid, Decimal::from(55));
    }

    #[test]
    fn merge_replaces_corrected_statement_and_adds_new_one() {
        let existing = vec![dist("A", "2026-02-01", 100)];
        let incoming = vec![dist("A", "2026-02-01", 150), dist("B", "2026-02-03", 50)];
        let merged = merge_records(&existing, &incoming);
        assert_eq!(merged, vec![dist("B", "2026-02-03", 50), dist("A", "2026-02-01", 150)]);
    }

    #[test]
    fn merge_is_idempotent() {
        let existing = vec![dist("A", "2026-01-01", 100)];
        let incoming = vec![dist("B", "2026-01-15", 50), dist("C", "2026-02-01", 70)];
        let once = merge_records(&existing, &incoming);
        let twice = merge_records(&once, &incoming);
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_keeps_first_occurrence_and_stable_order_for_same_date() {
        let incoming = vec![
            dist("X", "2026-01-10", 1),
            dist("Y", "2026-01-10", 2),
            dist("X", "2026-01-10", 3),
        ];
        let existing = vec![dist("Z", "2026-01-10", 4)];
        let merged = merge_records(&existing, &incoming);
        assert_eq!(ids(&merged), vec!["X", "Y", "Z"]);
        assert_eq!(merged[0].amount_paid, Decimal::from(1));
    }

    #[test]
    fn merge_dedups_records_without_ids_on_fallback_key() {
        let existing = vec![dist("", "2026-01-10", 150)];
        let mut incoming = dist("", "2026-01-10", 150);
        incoming.settlement_amount = Decimal::from(160);
        let merged = merge_records(&existing, &[incoming.clone(), dist("", "2026-01-11", 150)]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1], incoming);
    }

    #[test]
    fn guard_keeps_existing_unless_confirmed_empty() {
        let existing = vec![dist("B", "2026-01-01", 1), dist("A", "2026-02-01", 2)];

        let (kept, fired) = guard_non_regression(&existing, Vec::new(), FetchStatus::NoData);
        assert!(fired);
        assert_eq!(kept, existing);

        let (cleared, fired) =
            guard_non_regression(&existing, Vec::new(), FetchStatus::ConfirmedEmpty);
        assert!(!fired);
        assert!(cleared.is_empty());

        let (empty, fired) =
            guard_non_regression::<DistributionPayoutRecord>(&[], Vec::new(), FetchStatus::NoData);
        assert!(!fired);
        assert!(empty.is_empty());
    }

    #[test]
    fn no_data_returns_existing_collection_unchanged_even_if_unsorted() {
        let existing = vec![dist("B", "2026-01-01", 1), dist("A", "2026-02-01", 2)];
        let resolved = resolve_collection(
            RecordCategory::DistributionPayouts,
            &existing,
            FetchStatus::NoData,
            &[],
        );
        assert_eq!(resolved.records, existing);
        assert_eq!(resolved.resolution, Resolution::Preserved);
    }

    #[test]
    fn fetched_resolution_counts_added_and_replaced() {
        let existing = vec![dist("A", "2026-01-01", 100), dist("B", "2026-01-15", 50)];
        let incoming = vec![dist("B", "2026-01-15", 55), dist("C", "2026-02-01", 70)];
        let resolved = resolve_collection(
            RecordCategory::DistributionPayouts,
            &existing,
            FetchStatus::Fetched,
            &incoming,
        );
        assert_eq!(resolved.resolution, Resolution::Merged);
        assert_eq!(resolved.added, 1);
        assert_eq!(resolved.replaced, 1);
        assert_eq!(resolved.records.len(), 3);
    }

    #[test]
    fn analytics_resolution_sums_rows_and_preserves_on_no_data() {
        let existing = AnalyticsSnapshot {
            last_updated: Some(date("2026-02-01")),
            affiliate_gmv: Decimal::from(900),
            est_commission: Decimal::from(90),
            orders: 9,
            gmv_refund: Decimal::from(9),
        };
        let mut fetch = CategoryFetch {
            category: RecordCategory::Analytics,
            status: FetchStatus::NoData,
            records: Vec::new(),
            unparseable: 0,
            strategy: None,
            attempts: Vec::new(),
            auth_failure: None,
        };

        let (kept, resolution) = resolve_analytics(&existing, &fetch, date("2026-02-10"));
        assert_eq!(kept, existing);
        assert_eq!(resolution, Resolution::Preserved);

        fetch.status = FetchStatus::Fetched;
        fetch.records = vec![
            AnalyticsMetrics {
                affiliate_gmv: Decimal::from(100),
                orders: 2,
                ..AnalyticsMetrics::default()
            },
            AnalyticsMetrics {
                affiliate_gmv: Decimal::from(50),
                est_commission: Decimal::from(5),
                orders: 1,
                ..AnalyticsMetrics::default()
            },
        ];
        let (fresh, resolution) = resolve_analytics(&existing, &fetch, date("2026-02-10"));
        assert_eq!(resolution, Resolution::Merged);
        assert_eq!(fresh.affiliate_gmv, Decimal::from(150));
        assert_eq!(fresh.est_commission, Decimal::from(5));
        assert_eq!(fresh.gmv_refund, Decimal::ZERO);
        assert_eq!(fresh.orders, 3);
        assert_eq!(fresh.last_updated, Some(date("2026-02-10")));
    }

    #[tokio::test]
    async fn chain_falls_through_to_first_strategy_with_records() {
        let open_api = FakeStrategy::failing(
            "open_api",
            StrategyError::TransientNetwork("timeout".into()),
        );
        let session = FakeStrategy::records(
            "session_api",
            vec![json!({"payment_id": "P-1", "paid_time": "2026-02-01", "amount_paid": "12.50"})],
        );
        let scrape = FakeStrategy::records("dashboard", vec![]);

        let fetch = chain::<CreatorPayoutRecord>(vec![
            Arc::clone(&open_api),
            Arc::clone(&session),
            Arc::clone(&scrape),
        ])
        .run(&ctx())
        .await;

        assert_eq!(fetch.status, FetchStatus::Fetched);
        assert_eq!(fetch.strategy.as_deref(), Some("session_api"));
        assert_eq!(fetch.records[0].amount_paid, Decimal::new(1250, 2));
        assert_eq!(fetch.attempts.len(), 2);
        assert_eq!(fetch.attempts[0].outcome, "transient_network");
        assert_eq!(scrape.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn chain_stops_on_confirmed_empty() {
        let confirmed = FakeStrategy::arc(
            "open_api",
            StrategyKind::OpenApi,
            Ok(RawBatch {
                records: vec![],
                confirmed_empty: true,
            }),
        );
        let later = FakeStrategy::records("session_api", vec![]);
        let fetch = chain::<CreatorPayoutRecord>(vec![confirmed, Arc::clone(&later)])
            .run(&ctx())
            .await;
        assert_eq!(fetch.status, FetchStatus::ConfirmedEmpty);
        assert!(!fetch.terminated_in_auth_failure());
        assert_eq!(later.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn chain_of_unparseable_records_is_no_data() {
        let garbage = FakeStrategy::records(
            "session_api",
            vec![json!({"payment_id": "P-1"}), json!({"unrelated": true})],
        );
        let fetch = chain::<CreatorPayoutRecord>(vec![garbage]).run(&ctx()).await;
        assert_eq!(fetch.status, FetchStatus::NoData);
        assert_eq!(fetch.unparseable, 2);
        assert_eq!(fetch.attempts[0].outcome, "malformed");
    }

    #[tokio::test]
    async fn chain_reports_auth_failure_only_when_exhausted() {
        let expired = || {
            FakeStrategy::failing(
                "open_api",
                StrategyError::AuthExpired("code 401: session expired".into()),
            )
        };
        let skipped = FakeStrategy::failing("session_api", StrategyError::NotConfigured("session cookie"));

        let fetch = chain::<DistributionPayoutRecord>(vec![expired(), skipped])
            .run(&ctx())
            .await;
        assert_eq!(fetch.status, FetchStatus::NoData);
        assert!(fetch.terminated_in_auth_failure());
        assert_eq!(fetch.auth_failure.as_deref(), Some("code 401: session expired"));
        assert_eq!(fetch.attempts[1].outcome, "not_configured");

        let recovered = FakeStrategy::records(
            "session_api",
            vec![json!({"statement_id": "S-1", "statement_date": "2026-02-01", "amount_paid": 3})],
        );
        let fetch = chain::<DistributionPayoutRecord>(vec![expired(), recovered])
            .run(&ctx())
            .await;
        assert_eq!(fetch.status, FetchStatus::Fetched);
        assert!(!fetch.terminated_in_auth_failure());
    }

    #[tokio::test]
    async fn dispatcher_creates_at_most_one_open_alert() {
        let sink = Arc::new(MemorySink::default());
        let dispatcher = AlertDispatcher::new(Some(sink.clone() as Arc<dyn AlertSink>), "auth-expired");
        let failures = vec![AuthFailure {
            category: RecordCategory::CreatorPayouts,
            detail: "code 401: login required".into(),
        }];

        let first = dispatcher.dispatch(&ctx(), &failures).await;
        let second = dispatcher.dispatch(&ctx(), &failures).await;

        assert_eq!(first, AlertOutcome::Created { number: 1 });
        assert_eq!(second, AlertOutcome::AlreadyOpen { number: 1 });
        let created = sink.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, ALERT_TITLE);
        assert!(created[0].1.contains("creator_payouts"));
        assert!(created[0].1.contains("code 401: login required"));
        assert!(created[0].1.contains("PPR_SESSION_COOKIE"));
        assert_eq!(created[0].2, vec!["auth-expired".to_string()]);
    }

    #[tokio::test]
    async fn dispatcher_swallows_sink_failures_and_skips_when_unneeded() {
        let failures = vec![AuthFailure {
            category: RecordCategory::Analytics,
            detail: "expired".into(),
        }];
        let broken = Arc::new(MemorySink {
            fail_search: true,
            ..MemorySink::default()
        });
        let dispatcher = AlertDispatcher::new(Some(broken.clone() as Arc<dyn AlertSink>), "auth-expired");

        let outcome = dispatcher.dispatch(&ctx(), &failures).await;
        assert!(matches!(outcome, AlertOutcome::Failed { .. }));
        assert!(broken.created.lock().unwrap().is_empty());

        assert_eq!(dispatcher.dispatch(&ctx(), &[]).await, AlertOutcome::NotNeeded);
        assert_eq!(
            AlertDispatcher::disabled().dispatch(&ctx(), &failures).await,
            AlertOutcome::Disabled
        );
    }

    fn expired_chains(analytics_rows: Vec<serde_json::Value>) -> CategoryChains {
        let expired = || {
            FakeStrategy::failing("open_api", StrategyError::AuthExpired("http 401: session expired".into()))
        };
        CategoryChains {
            distribution: chain(vec![expired()]),
            creator: chain(vec![FakeStrategy::records(
                "session_api",
                vec![json!({"payment_id": "P-2", "paid_time": "2026-02-05", "amount_paid": 20})],
            )]),
            analytics: chain(vec![FakeStrategy::records("session_api", analytics_rows)]),
        }
    }

    #[tokio::test]
    async fn pipeline_preserves_history_on_auth_failure_and_alerts_once() {
        let dir = tempdir().expect("tempdir");
        let state_path = dir.path().join("data").join("finance.json");
        let seeded = ppr_core::PersistedState {
            distribution_payouts: vec![dist("A", "2026-01-01", 100), dist("B", "2026-01-15", 50)],
            payouts: vec![CreatorPayoutRecord {
                payment_id: "P-1".into(),
                date: date("2026-01-20"),
                settlement_amount: Decimal::from(10),
                amount_paid: Decimal::from(10),
            }],
            ..Default::default()
        };
        StateFile::new(&state_path).persist(&seeded).await.expect("seed");

        let sink = Arc::new(MemorySink::default());
        let reports = dir.path().join("reports");
        let pipeline = ReconcilePipeline::new(
            StateFile::new(&state_path),
            expired_chains(vec![json!({"affiliate_gmv": "1,200.50", "orders": 4})]),
            AlertDispatcher::new(Some(sink.clone() as Arc<dyn AlertSink>), "auth-expired"),
        )
        .with_reports_dir(Some(reports.clone()));

        let summary = pipeline.run_once(&ctx()).await.expect("run");
        assert!(summary.auth_expired);
        assert_eq!(summary.alert, AlertOutcome::Created { number: 1 });

        let state = StateFile::new(&state_path).load().await.expect("load").state;
        assert_eq!(state.distribution_payouts, seeded.distribution_payouts);
        assert_eq!(state.payouts.len(), 2);
        assert_eq!(state.payouts[0].payment_id, "P-2");
        assert_eq!(state.analytics.affiliate_gmv, Decimal::new(120050, 2));
        assert_eq!(state.analytics.orders, 4);
        assert_eq!(state.analytics.last_updated, Some(date("2026-02-10")));

        let text = std::fs::read_to_string(&state_path).unwrap();
        assert!(text.starts_with("{\n  \"analytics\""));
        assert!(text.ends_with("}\n"));

        let report = summary.report_path.expect("report path");
        assert!(report.ends_with("run_summary.json"));
        let report_json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&report).unwrap()).unwrap();
        assert_eq!(report_json["categories"][0]["resolution"], "preserved");
        assert_eq!(report_json["alert"]["outcome"], "created");

        let second = ReconcilePipeline::new(
            StateFile::new(&state_path),
            expired_chains(vec![json!({"affiliate_gmv": 10})]),
            AlertDispatcher::new(Some(sink.clone() as Arc<dyn AlertSink>), "auth-expired"),
        )
        .run_once(&ctx())
        .await
        .expect("second run");
        assert_eq!(second.alert, AlertOutcome::AlreadyOpen { number: 1 });
        assert_eq!(sink.created.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pipeline_refuses_to_overwrite_corrupt_state() {
        let dir = tempdir().expect("tempdir");
        let state_path = dir.path().join("finance.json");
        std::fs::write(&state_path, "not json").unwrap();

        let pipeline = ReconcilePipeline::new(
            StateFile::new(&state_path),
            expired_chains(vec![]),
            AlertDispatcher::disabled(),
        );
        assert!(pipeline.run_once(&ctx()).await.is_err());
        assert_eq!(std::fs::read_to_string(&state_path).unwrap(), "not json");
    }

    /// Replaces the state file's parent directory with a plain file, then reports an expired session.
    struct BlockStateDir {
        dir: PathBuf,
    }

    #[async_trait]
    impl FetchStrategy for BlockStateDir {
        fn name(&self) -> &str {
            "open_api"
        }

        fn kind(&self) -> StrategyKind {
            StrategyKind::OpenApi
        }

        async fn fetch(&self, _ctx: &RunContext) -> Result<RawBatch, StrategyError> {
            std::fs::write(&self.dir, "not a directory").unwrap();
            Err(StrategyError::AuthExpired("code 401: session expired".into()))
        }
    }

    #[tokio::test]
    async fn auth_alert_is_sent_even_when_the_state_write_fails() {
        let dir = tempdir().expect("tempdir");
        let state_dir = dir.path().join("data");
        let state_path = state_dir.join("finance.json");

        let sink = Arc::new(MemorySink::default());
        let pipeline = ReconcilePipeline::new(
            StateFile::new(&state_path),
            CategoryChains {
                distribution: StrategyChain::new(vec![
                    Arc::new(BlockStateDir { dir: state_dir.clone() }) as Arc<dyn FetchStrategy>
                ]),
                creator: chain(vec![]),
                analytics: chain(vec![]),
            },
            AlertDispatcher::new(Some(sink.clone() as Arc<dyn AlertSink>), "auth-expired"),
        );

        assert!(pipeline.run_once(&ctx()).await.is_err());
        assert!(state_dir.is_file());
        let created = sink.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert!(created[0].1.contains("distribution_payouts"));
    }

    #[tokio::test]
    async fn run_without_credentials_preserves_state_and_sends_nothing() {
        let dir = tempdir().expect("tempdir");
        let state_path = dir.path().join("finance.json");
        let seeded = ppr_core::PersistedState {
            analytics: AnalyticsSnapshot {
                last_updated: Some(date("2026-02-01")),
                affiliate_gmv: Decimal::from(500),
                est_commission: Decimal::from(50),
                orders: 5,
                gmv_refund: Decimal::from(5),
            },
            distribution_payouts: vec![dist("A", "2026-01-01", 100)],
            payouts: vec![CreatorPayoutRecord {
                payment_id: "P-1".into(),
                date: date("2026-01-20"),
                settlement_amount: Decimal::from(10),
                amount_paid: Decimal::from(10),
            }],
        };
        StateFile::new(&state_path).persist(&seeded).await.expect("seed");

        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("http client"));
        let registry = StrategyRegistry::builtin();
        let sink = Arc::new(MemorySink::default());
        let pipeline = ReconcilePipeline::new(
            StateFile::new(&state_path),
            CategoryChains::from_registry(&registry, &http),
            AlertDispatcher::new(Some(sink.clone() as Arc<dyn AlertSink>), "auth-expired"),
        );

        // Any request that did go out would fail against this address and not read as not_configured.
        let mut run = ctx();
        run.endpoints = SourceEndpoints {
            open_api_base_url: "http://127.0.0.1:9".into(),
            session_base_url: "http://127.0.0.1:9".into(),
        };
        assert!(run.credentials.is_empty());

        let summary = pipeline.run_once(&run).await.expect("run");

        for category in &summary.categories {
            assert_eq!(category.status, FetchStatus::NoData);
            assert_eq!(category.resolution, Resolution::Preserved);
            assert!(!category.attempts.is_empty());
            assert!(category
                .attempts
                .iter()
                .all(|attempt| attempt.outcome == "not_configured"));
        }
        assert_eq!(
            summary.categories[0].attempts.len(),
            registry.endpoints(RecordCategory::DistributionPayouts).len()
        );
        assert!(!summary.auth_expired);
        assert_eq!(summary.alert, AlertOutcome::NotNeeded);
        assert!(sink.created.lock().unwrap().is_empty());

        let state = StateFile::new(&state_path).load().await.expect("load").state;
        assert_eq!(state, seeded);
    }

    #[test]
    fn auth_code_list_ignores_garbage() {
        assert_eq!(parse_code_list("36004004, 105002,abc,"), vec![36004004, 105002]);
    }
}
