//! Hunt pipeline orchestration: query registry, qualification, and the
//! lead-store reconciler.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use jobhound_core::{
    clamp_score, company_from_title, lead_id_for_url, Lead, LeadDraft, LeadStatus,
};
use jobhound_sources::{
    parse_search_response, FixtureProvider, QuerySpec, SearchContext, SearchProvider,
    SerperProvider,
};
use jobhound_storage::{
    CaptureStore, LeadStore, RateLimitConfig, SearchClientConfig, SearchHttpClient,
};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobhound-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRegistry {
    pub queries: Vec<QuerySpec>,
}

/// Knobs of the reconcile step. Passed in explicitly so retention and the
/// archive sweep stay deterministic under an injected clock.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub retention_window: chrono::Duration,
    pub max_store_size: usize,
    /// UTC hour during which the archive sweep fires. An out-of-range value
    /// (>= 24) never matches and disables the sweep.
    pub archive_trigger_hour: u32,
    pub company_placeholder: String,
    pub default_score: Option<u8>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            retention_window: chrono::Duration::days(3),
            max_store_size: 50,
            archive_trigger_hour: 23,
            company_placeholder: "Unknown".to_string(),
            default_score: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HuntConfig {
    pub store_path: PathBuf,
    pub captures_dir: PathBuf,
    pub api_key: Option<String>,
    pub search_endpoint: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Optional cap on search requests per second across all queries.
    pub search_rate_per_sec: Option<u32>,
    pub scheduler_enabled: bool,
    pub hunt_cron: String,
    pub workspace_root: PathBuf,
    pub reconciler: ReconcilerConfig,
}

impl HuntConfig {
    pub fn from_env() -> Self {
        let defaults = ReconcilerConfig::default();
        Self {
            store_path: std::env::var("JOBHOUND_STORE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./jobs.json")),
            captures_dir: std::env::var("JOBHOUND_CAPTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./captures")),
            api_key: std::env::var("SERPER_API_KEY").ok(),
            search_endpoint: std::env::var("JOBHOUND_SEARCH_ENDPOINT")
                .unwrap_or_else(|_| SerperProvider::DEFAULT_ENDPOINT.to_string()),
            user_agent: std::env::var("JOBHOUND_USER_AGENT")
                .unwrap_or_else(|_| "jobhound/0.1".to_string()),
            http_timeout_secs: env_parsed("JOBHOUND_HTTP_TIMEOUT_SECS").unwrap_or(20),
            search_rate_per_sec: env_parsed("JOBHOUND_SEARCH_RATE_PER_SEC"),
            scheduler_enabled: std::env::var("JOBHOUND_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            hunt_cron: std::env::var("JOBHOUND_HUNT_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
            workspace_root: PathBuf::from("."),
            reconciler: ReconcilerConfig {
                retention_window: env_parsed::<i64>("JOBHOUND_RETENTION_DAYS")
                    .map(chrono::Duration::days)
                    .unwrap_or(defaults.retention_window),
                max_store_size: env_parsed("JOBHOUND_MAX_LEADS")
                    .unwrap_or(defaults.max_store_size),
                archive_trigger_hour: env_parsed("JOBHOUND_ARCHIVE_HOUR")
                    .unwrap_or(defaults.archive_trigger_hour),
                company_placeholder: std::env::var("JOBHOUND_COMPANY_PLACEHOLDER")
                    .unwrap_or(defaults.company_placeholder),
                default_score: env_parsed("JOBHOUND_DEFAULT_SCORE"),
            },
        }
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Optional stage between fetch and reconcile that filters or annotates the
/// candidate batch. The reconciler contract holds whether or not one runs.
pub trait Qualifier: Send + Sync {
    fn qualifier_id(&self) -> &'static str;
    fn qualify(&self, drafts: Vec<LeadDraft>) -> Result<Vec<LeadDraft>>;
}

#[derive(Default)]
pub struct NoopQualifier;

impl Qualifier for NoopQualifier {
    fn qualifier_id(&self) -> &'static str {
        "noop"
    }

    fn qualify(&self, drafts: Vec<LeadDraft>) -> Result<Vec<LeadDraft>> {
        Ok(drafts)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeywordRule {
    pub contains_any: Vec<String>,
    pub weight: u8,
}

#[derive(Debug, Clone, Deserialize)]
struct RulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    target_titles: Vec<String>,
    #[serde(default)]
    boosts: Vec<KeywordRule>,
    #[serde(default)]
    penalties: Vec<KeywordRule>,
    #[serde(default)]
    min_score: u8,
}

/// Deterministic rule-based qualifier: title similarity against the target
/// roles sets the base, keyword boosts/penalties adjust it, and drafts below
/// the floor are dropped. Same (title, snippet) always scores the same.
pub struct RuleQualifier {
    target_titles: Vec<String>,
    boosts: Vec<KeywordRule>,
    penalties: Vec<KeywordRule>,
    min_score: u8,
}

impl RuleQualifier {
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules.yaml");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let rules: RulesFile = serde_yaml::from_str(text).context("parsing qualifier rules")?;
        Ok(Self {
            target_titles: rules.target_titles,
            boosts: rules.boosts,
            penalties: rules.penalties,
            min_score: rules.min_score,
        })
    }

    pub fn score_draft(&self, draft: &LeadDraft) -> u8 {
        let title = normalize_text(&draft.title);
        let base = self
            .target_titles
            .iter()
            .map(|target| jaro_winkler(&normalize_text(target), &title))
            .fold(0.0_f64, f64::max);
        let mut score = (base * 60.0).round() as i64;

        let haystack = match &draft.snippet {
            Some(snippet) => format!("{} {}", title, normalize_text(snippet)),
            None => title,
        };
        for rule in &self.boosts {
            if rule
                .contains_any
                .iter()
                .any(|needle| haystack.contains(&normalize_text(needle)))
            {
                score += i64::from(rule.weight);
            }
        }
        for rule in &self.penalties {
            if rule
                .contains_any
                .iter()
                .any(|needle| haystack.contains(&normalize_text(needle)))
            {
                score -= i64::from(rule.weight);
            }
        }
        clamp_score(score)
    }
}

impl Qualifier for RuleQualifier {
    fn qualifier_id(&self) -> &'static str {
        "rules"
    }

    fn qualify(&self, drafts: Vec<LeadDraft>) -> Result<Vec<LeadDraft>> {
        let mut kept = Vec::with_capacity(drafts.len());
        for mut draft in drafts {
            let score = self.score_draft(&draft);
            if score < self.min_score {
                debug!(url = %draft.url, score, "draft below score floor; dropped");
                continue;
            }
            draft.score = Some(score);
            kept.push(draft);
        }
        Ok(kept)
    }
}

fn normalize_text(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingUrl,
    AlreadyInStore,
    DuplicateInBatch,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedDraft {
    pub url: String,
    pub title: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    pub leads: Vec<Lead>,
    pub added: usize,
    pub purged_expired: usize,
    pub archived: usize,
    pub demoted: usize,
    pub evicted_over_cap: usize,
    pub skipped: Vec<SkippedDraft>,
}

/// Merges a qualified candidate batch into the existing store.
///
/// Order matters: retention purge, archive sweep, status reset, URL-deduped
/// merge, prepend, capacity cap. `now` is injected by the caller; nothing in
/// here reads the ambient clock, and nothing in here can fail — every
/// malformed input degrades to a skip.
pub fn reconcile(
    existing: Vec<Lead>,
    batch: Vec<LeadDraft>,
    now: DateTime<Utc>,
    config: &ReconcilerConfig,
) -> ReconcileOutcome {
    let cutoff = now - config.retention_window;
    let before = existing.len();
    let mut survivors: Vec<Lead> = existing
        .into_iter()
        .filter(|lead| lead.found_at >= cutoff)
        .collect();
    let purged_expired = before - survivors.len();

    let mut archived = 0usize;
    if now.hour() == config.archive_trigger_hour {
        for lead in survivors.iter_mut().filter(|l| l.status.is_new()) {
            lead.status = LeadStatus::BestArchived;
            archived += 1;
        }
    }

    // Whatever the sweep left in `New` was simply not re-found; demote it.
    let mut demoted = 0usize;
    for lead in survivors.iter_mut().filter(|l| l.status.is_new()) {
        lead.status = LeadStatus::Old;
        demoted += 1;
    }

    let in_store: HashSet<String> = survivors.iter().map(|l| l.url.clone()).collect();
    let mut batch_seen: HashSet<String> = HashSet::new();
    let mut fresh: Vec<Lead> = Vec::new();
    let mut skipped: Vec<SkippedDraft> = Vec::new();

    for draft in batch {
        let url = draft.url.trim();
        let reason = if url.is_empty() {
            Some(SkipReason::MissingUrl)
        } else if in_store.contains(url) {
            Some(SkipReason::AlreadyInStore)
        } else if batch_seen.contains(url) {
            Some(SkipReason::DuplicateInBatch)
        } else {
            None
        };
        if let Some(reason) = reason {
            skipped.push(SkippedDraft {
                url: draft.url,
                title: draft.title,
                reason,
            });
            continue;
        }

        batch_seen.insert(url.to_string());
        let company = draft
            .company
            .clone()
            .or_else(|| company_from_title(&draft.title))
            .unwrap_or_else(|| config.company_placeholder.clone());
        fresh.push(Lead {
            id: lead_id_for_url(url),
            url: url.to_string(),
            title: draft.title,
            company,
            status: LeadStatus::New,
            found_at: now,
            posted_at: draft.posted_hint,
            score: draft.score.or(config.default_score),
        });
    }

    let added = fresh.len();
    let mut leads = fresh;
    leads.extend(survivors);

    let evicted_over_cap = leads.len().saturating_sub(config.max_store_size);
    leads.truncate(config.max_store_size);

    ReconcileOutcome {
        leads,
        added,
        purged_expired,
        archived,
        demoted,
        evicted_over_cap,
        skipped,
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryOutcome {
    Fetched { query_id: String, drafts: usize },
    FetchFailed { query_id: String, error: String },
    ParseFailed { query_id: String, error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct HuntSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub queries_run: usize,
    pub query_outcomes: Vec<QueryOutcome>,
    pub fetched: usize,
    pub qualified: usize,
    pub added: usize,
    pub skipped: usize,
    pub purged_expired: usize,
    pub archived: usize,
    pub demoted: usize,
    pub evicted_over_cap: usize,
    pub dropped_at_load: usize,
    pub total_after: usize,
}

pub struct HuntPipeline {
    config: HuntConfig,
    captures: CaptureStore,
    http: SearchHttpClient,
    provider: Box<dyn SearchProvider>,
    qualifier: Box<dyn Qualifier>,
}

impl HuntPipeline {
    pub fn new(config: HuntConfig) -> Result<Self> {
        if config.api_key.is_none() {
            warn!("SERPER_API_KEY not set; live searches will be rejected upstream");
        }
        let captures = CaptureStore::new(config.captures_dir.clone());
        let http = SearchHttpClient::new(SearchClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            api_key: config.api_key.clone(),
            rate_limit: config.search_rate_per_sec.map(|rps| {
                let rps = rps.max(1);
                RateLimitConfig {
                    capacity: rps,
                    refill_every: Duration::from_millis(1000 / u64::from(rps)),
                }
            }),
            ..Default::default()
        })?;
        let provider = Box::new(SerperProvider::new(config.search_endpoint.clone()));
        Ok(Self {
            config,
            captures,
            http,
            provider,
            qualifier: Box::new(NoopQualifier),
        })
    }

    pub fn with_provider(mut self, provider: Box<dyn SearchProvider>) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_qualifier(mut self, qualifier: Box<dyn Qualifier>) -> Self {
        self.qualifier = qualifier;
        self
    }

    /// One full hunt: fetch every enabled query, qualify, reconcile, persist.
    ///
    /// Upstream failures degrade per query; the run always ends by writing a
    /// valid store. Only a failed store write surfaces as an error.
    pub async fn run_once(&self) -> Result<HuntSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let registry = self.load_query_registry().await?;
        let enabled: Vec<QuerySpec> = registry.queries.into_iter().filter(|q| q.enabled).collect();
        let ctx = SearchContext {
            run_id,
            fetched_at: started_at,
        };

        let mut batch: Vec<LeadDraft> = Vec::new();
        let mut query_outcomes = Vec::with_capacity(enabled.len());
        for query in &enabled {
            match self.provider.fetch_raw(&self.http, &ctx, query).await {
                Ok(body) => {
                    if let Err(err) = self
                        .captures
                        .store_response(started_at, &query.query_id, &body)
                        .await
                    {
                        warn!(query_id = %query.query_id, %err, "failed to archive raw response");
                    }
                    match parse_search_response(&query.query_id, &body) {
                        Ok(drafts) => {
                            query_outcomes.push(QueryOutcome::Fetched {
                                query_id: query.query_id.clone(),
                                drafts: drafts.len(),
                            });
                            batch.extend(drafts);
                        }
                        Err(err) => {
                            warn!(query_id = %query.query_id, %err, "unparseable search response; contributing nothing");
                            query_outcomes.push(QueryOutcome::ParseFailed {
                                query_id: query.query_id.clone(),
                                error: err.to_string(),
                            });
                        }
                    }
                }
                Err(err) => {
                    warn!(query_id = %query.query_id, %err, "search fetch failed; contributing nothing");
                    query_outcomes.push(QueryOutcome::FetchFailed {
                        query_id: query.query_id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        let fetched = batch.len();
        let qualified_batch = match self.qualifier.qualify(batch) {
            Ok(drafts) => drafts,
            Err(err) => {
                warn!(qualifier = self.qualifier.qualifier_id(), %err, "qualifier failed; treating batch as empty");
                Vec::new()
            }
        };
        let qualified = qualified_batch.len();

        let store = LeadStore::new(&self.config.store_path);
        let loaded = store.load().await;
        if loaded.dropped_records > 0 {
            warn!(
                dropped = loaded.dropped_records,
                "malformed store records purged at load"
            );
        }

        // Sole ambient clock read for reconciliation; everything below is
        // deterministic in `now`.
        let now = Utc::now();
        let outcome = reconcile(loaded.leads, qualified_batch, now, &self.config.reconciler);
        store.save(&outcome.leads).await?;

        let summary = HuntSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            queries_run: enabled.len(),
            query_outcomes,
            fetched,
            qualified,
            added: outcome.added,
            skipped: outcome.skipped.len(),
            purged_expired: outcome.purged_expired,
            archived: outcome.archived,
            demoted: outcome.demoted,
            evicted_over_cap: outcome.evicted_over_cap,
            dropped_at_load: loaded.dropped_records,
            total_after: outcome.leads.len(),
        };
        if let Err(err) = self.write_run_report(&summary).await {
            warn!(%err, "failed to write run report");
        }
        info!(
            run_id = %summary.run_id,
            added = summary.added,
            total = summary.total_after,
            "hunt complete"
        );
        Ok(summary)
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.hunt_cron.clone();
        let job = Job::new_async(cron.as_str(), |_uuid, _l| {
            Box::pin(async move {
                match run_hunt_once_from_env().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        added = summary.added,
                        total = summary.total_after,
                        "scheduled hunt complete"
                    ),
                    Err(err) => warn!(%err, "scheduled hunt failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    async fn load_query_registry(&self) -> Result<QueryRegistry> {
        let path = self.config.workspace_root.join("queries.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    async fn write_run_report(&self, summary: &HuntSummary) -> Result<()> {
        let reports_dir = self.config.workspace_root.join("reports");
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;
        let path = reports_dir.join(format!("{}.json", summary.run_id));
        let bytes = serde_json::to_vec_pretty(summary).context("serializing run report")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }
}

pub fn pipeline_from_env(offline: bool) -> Result<HuntPipeline> {
    let config = HuntConfig::from_env();
    let workspace_root = config.workspace_root.clone();
    let fixtures_root = workspace_root.join("fixtures");
    let rules_path = workspace_root.join("rules.yaml");

    let mut pipeline = HuntPipeline::new(config)?;
    if offline {
        pipeline = pipeline.with_provider(Box::new(FixtureProvider::new(fixtures_root)));
    }
    if rules_path.exists() {
        pipeline =
            pipeline.with_qualifier(Box::new(RuleQualifier::from_workspace_root(&workspace_root)?));
    }
    Ok(pipeline)
}

pub async fn run_hunt_once_from_env() -> Result<HuntSummary> {
    pipeline_from_env(false)?.run_once().await
}

pub async fn run_hunt_once_offline_from_env() -> Result<HuntSummary> {
    pipeline_from_env(true)?.run_once().await
}

/// Builds the cron scheduler and parks until ctrl-c. Errors when scheduling
/// is disabled so the caller can print a hint instead of hanging silently.
pub async fn run_scheduler_from_env() -> Result<()> {
    let pipeline = pipeline_from_env(false)?;
    let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
        anyhow::bail!("scheduler disabled; set JOBHOUND_SCHEDULER_ENABLED=1");
    };
    sched.start().await.context("starting scheduler")?;
    info!(cron = %pipeline.config.hunt_cron, "scheduler running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

pub async fn report_store_markdown_from_env() -> Result<String> {
    let config = HuntConfig::from_env();
    report_store_markdown(&config.store_path).await
}

/// Renders a plain status/score summary of the current store. Presentation
/// only: the store itself stays in recency order.
pub async fn report_store_markdown(store_path: &Path) -> Result<String> {
    let report = LeadStore::new(store_path).load().await;

    let mut by_status: BTreeMap<&'static str, usize> = BTreeMap::new();
    for lead in &report.leads {
        *by_status.entry(status_label(lead.status)).or_default() += 1;
    }
    let mut ranked: Vec<&Lead> = report.leads.iter().collect();
    ranked.sort_by(|a, b| b.score.unwrap_or(0).cmp(&a.score.unwrap_or(0)));

    let mut lines = vec![
        "# Jobhound Lead Store".to_string(),
        String::new(),
        format!("- Store: `{}`", store_path.display()),
        format!("- Leads: {}", report.leads.len()),
    ];
    if report.dropped_records > 0 {
        lines.push(format!(
            "- Malformed records dropped at load: {}",
            report.dropped_records
        ));
    }
    for (status, count) in &by_status {
        lines.push(format!("- {status}: {count}"));
    }
    lines.push(String::new());
    lines.push("## Top leads".to_string());
    for lead in ranked.iter().take(10) {
        let score = lead
            .score
            .map_or_else(|| "--".to_string(), |s| s.to_string());
        lines.push(format!(
            "- [{}] {} — {} ({})",
            score, lead.title, lead.company, lead.url
        ));
    }
    Ok(lines.join("\n"))
}

fn status_label(status: LeadStatus) -> &'static str {
    match status {
        LeadStatus::New => "New",
        LeadStatus::Old => "Old",
        LeadStatus::BestArchived => "Best_Archived",
    }
}
