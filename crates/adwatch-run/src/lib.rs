//! Run orchestration: configuration, the per-query/per-source loop, and
//! the optional cron scheduler.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use adwatch_adapters::extractor_for_source;
use adwatch_adapters::ListingExtractor;
use adwatch_core::{
    chunk_message, dedupe_by_url, filter_novel, Report, SearchArea, SourceName, MAX_FRAGMENT_LEN,
};
use adwatch_notify::{Notifier, NotifyError, TwilioConfig, TwilioNotifier};
use adwatch_storage::{HttpSession, JsonlSeenStore, PageArchive, SeenStore, SessionConfig};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "adwatch-run";

/// Search plan loaded from `watch.yaml`: which sources run, which queries,
/// and the shared geographic parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    #[serde(default)]
    pub search_ksl: bool,
    #[serde(default)]
    pub search_facebook_marketplace: bool,
    #[serde(default)]
    pub search_craigslist: bool,
    pub queries: Vec<String>,
    #[serde(default)]
    pub area: SearchArea,
}

impl WatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.queries.is_empty() {
            bail!("watch config needs at least one query");
        }
        if let Some(empty) = self.queries.iter().find(|q| q.trim().is_empty()) {
            bail!("watch config contains an empty query: {empty:?}");
        }
        Ok(())
    }

    /// Enabled sources in the fixed run order.
    pub fn enabled_sources(&self) -> Vec<SourceName> {
        SourceName::ALL
            .into_iter()
            .filter(|source| match source {
                SourceName::Ksl => self.search_ksl,
                SourceName::FacebookMarketplace => self.search_facebook_marketplace,
                SourceName::Craigslist => self.search_craigslist,
            })
            .collect()
    }
}

pub async fn load_watch_config(path: &Path) -> Result<WatchConfig> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let config: WatchConfig =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Deployment-level settings read from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub watch_config_path: PathBuf,
    pub seen_dir: PathBuf,
    pub archive_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub watch_cron: String,
    pub twilio: Option<TwilioConfig>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let twilio = match (
            std::env::var("TWILIO_ACCOUNT_SID"),
            std::env::var("TWILIO_AUTH_TOKEN"),
            std::env::var("FROM_NUMBER"),
            std::env::var("TO_NUMBER"),
        ) {
            (Ok(account_sid), Ok(auth_token), Ok(from_number), Ok(to_number)) => {
                Some(TwilioConfig {
                    account_sid,
                    auth_token,
                    from_number,
                    to_number,
                })
            }
            _ => None,
        };

        Self {
            watch_config_path: std::env::var("ADWATCH_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./watch.yaml")),
            seen_dir: std::env::var("ADWATCH_SEEN_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/seen")),
            archive_dir: match std::env::var("ADWATCH_ARCHIVE_DIR") {
                Ok(dir) if dir.is_empty() => None,
                Ok(dir) => Some(PathBuf::from(dir)),
                Err(_) => Some(PathBuf::from("./data/pages")),
            },
            user_agent: std::env::var("ADWATCH_USER_AGENT")
                .unwrap_or_else(|_| "adwatch-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("ADWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            scheduler_enabled: std::env::var("ADWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            // Six-field cron: every 15 minutes, matching the original
            // deployment schedule.
            watch_cron: std::env::var("ADWATCH_CRON")
                .unwrap_or_else(|_| "0 */15 * * * *".to_string()),
            twilio,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn notifier(&self) -> Result<TwilioNotifier> {
        let twilio = self
            .twilio
            .clone()
            .context("TWILIO_ACCOUNT_SID, TWILIO_AUTH_TOKEN, FROM_NUMBER and TO_NUMBER must be set")?;
        Ok(TwilioNotifier::new(twilio))
    }
}

/// Run-fatal failures. Per-source extraction and persistence problems are
/// isolated inside the run and reported through `RunSummary` instead.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("acquiring browsing session: {0}")]
    Session(#[source] anyhow::Error),
    #[error("sending notification fragment {index} of {total}: {source}")]
    Transport {
        index: usize,
        total: usize,
        #[source]
        source: NotifyError,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub queries: usize,
    pub sources_enabled: usize,
    pub listings_extracted: usize,
    pub novel_listings: usize,
    pub fragments_sent: usize,
    pub source_failures: Vec<String>,
}

/// Drives one run to a terminal state: acquire a session, walk every
/// (query, source) pair, record novelty before reporting it, then chunk
/// and send the aggregated notification. Collaborators are injected so
/// the store and transport can be doubled in tests.
pub struct RunOrchestrator {
    watch: WatchConfig,
    session_config: SessionConfig,
    seen_store: Arc<dyn SeenStore>,
    notifier: Arc<dyn Notifier>,
    archive: Option<PageArchive>,
    extractors: Vec<Box<dyn ListingExtractor>>,
}

impl RunOrchestrator {
    pub fn new(
        watch: WatchConfig,
        session_config: SessionConfig,
        seen_store: Arc<dyn SeenStore>,
        notifier: Arc<dyn Notifier>,
        archive: Option<PageArchive>,
    ) -> Self {
        let extractors = watch
            .enabled_sources()
            .into_iter()
            .map(extractor_for_source)
            .collect();
        Self {
            watch,
            session_config,
            seen_store,
            notifier,
            archive,
            extractors,
        }
    }

    pub fn with_extractors(mut self, extractors: Vec<Box<dyn ListingExtractor>>) -> Self {
        self.extractors = extractors;
        self
    }

    pub async fn run_once(&self) -> Result<RunSummary, RunError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, queries = self.watch.queries.len(), sources = self.extractors.len(),
            "run started");

        let session = HttpSession::new(self.session_config.clone()).map_err(RunError::Session)?;

        let mut seen_cache: HashMap<SourceName, HashSet<String>> = HashMap::new();
        let mut failed_sources: HashSet<SourceName> = HashSet::new();
        let mut source_failures: Vec<String> = Vec::new();
        let mut report = Report::new();
        let mut listings_extracted = 0usize;
        let mut novel_listings = 0usize;

        for query in &self.watch.queries {
            for extractor in &self.extractors {
                let source = extractor.source();
                if failed_sources.contains(&source) {
                    continue;
                }

                // Novelty is undecidable without the seen-set, so a read
                // failure abandons the source for the rest of the run.
                if !seen_cache.contains_key(&source) {
                    match self.seen_store.seen_urls(source).await {
                        Ok(urls) => {
                            seen_cache.insert(source, urls);
                        }
                        Err(err) => {
                            error!(%run_id, source = %source, query = %query, stage = "seen-read",
                                error = %err, "abandoning source for this run");
                            failed_sources.insert(source);
                            source_failures
                                .push(format!("{source}: seen-set read failed: {err}"));
                            continue;
                        }
                    }
                }

                let raw = match extractor
                    .extract(&session, self.archive.as_ref(), run_id, &self.watch.area, query)
                    .await
                {
                    Ok(raw) => raw,
                    Err(err) => {
                        warn!(%run_id, source = %source, query = %query, stage = "extract",
                            error = %err, "skipping source for this query");
                        source_failures.push(format!("{source}/{query}: extraction failed: {err}"));
                        continue;
                    }
                };
                listings_extracted += raw.len();

                let seen = seen_cache.get_mut(&source).expect("seen-set cached above");
                let novel = dedupe_by_url(filter_novel(&raw, seen));

                // Record before reporting: a crash between the two loses
                // the listing from future notifications instead of
                // duplicating it.
                let mut recorded = Vec::with_capacity(novel.len());
                for listing in novel {
                    match self.seen_store.record_seen(source, &listing).await {
                        Ok(()) => {
                            seen.insert(listing.url.clone());
                            recorded.push(listing);
                        }
                        Err(err) => {
                            error!(%run_id, source = %source, query = %query, stage = "record",
                                url = %listing.url, error = %err,
                                "record failed; listing withheld until a later run");
                            source_failures.push(format!(
                                "{source}/{query}: recording {} failed: {err}",
                                listing.url
                            ));
                        }
                    }
                }

                novel_listings += recorded.len();
                report.append_query_results(query, &recorded);
            }
        }

        // The session is not needed for sending; release it first.
        drop(session);

        let mut fragments_sent = 0usize;
        if !report.is_empty() {
            let fragments = chunk_message(&report.render(), MAX_FRAGMENT_LEN);
            let total = fragments.len();
            info!(%run_id, fragments = total, listings = report.listing_count(),
                "sending aggregated notification");
            for (index, fragment) in fragments.iter().enumerate() {
                self.notifier
                    .send(fragment)
                    .await
                    .map_err(|source| RunError::Transport {
                        index: index + 1,
                        total,
                        source,
                    })?;
                fragments_sent += 1;
            }
        } else {
            info!(%run_id, "no novel listings; nothing to send");
        }

        let finished_at = Utc::now();
        info!(%run_id, novel_listings, fragments_sent,
            failures = source_failures.len(), "run finished");

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            queries: self.watch.queries.len(),
            sources_enabled: self.extractors.len(),
            listings_extracted,
            novel_listings,
            fragments_sent,
            source_failures,
        })
    }
}

/// Builds the production orchestrator from the environment + `watch.yaml`.
pub async fn orchestrator_from_env(app: &AppConfig) -> Result<RunOrchestrator> {
    let watch = load_watch_config(&app.watch_config_path).await?;
    let seen_store = JsonlSeenStore::new(app.seen_dir.clone());
    let notifier = app.notifier()?;
    let archive = app.archive_dir.clone().map(PageArchive::new);
    Ok(RunOrchestrator::new(
        watch,
        app.session_config(),
        Arc::new(seen_store),
        Arc::new(notifier),
        archive,
    ))
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    let app = AppConfig::from_env();
    let orchestrator = orchestrator_from_env(&app).await?;
    orchestrator.run_once().await.map_err(Into::into)
}

/// When enabled, schedules the pipeline on the configured cron. Overlap
/// prevention is the deployment's concern; each tick completes one run.
pub async fn maybe_build_scheduler(
    app: &AppConfig,
    orchestrator: Arc<RunOrchestrator>,
) -> Result<Option<JobScheduler>> {
    if !app.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = app.watch_cron.clone();
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            match orchestrator.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id,
                    novel = summary.novel_listings, "scheduled run finished"),
                Err(err) => error!(error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
