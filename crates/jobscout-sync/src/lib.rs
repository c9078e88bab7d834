//! Search orchestration: concurrent pagination, early stop, detail enrichment.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use jobscout_adapters::{board_for_id, JobBoard};
use jobscout_core::{AliasNotFound, Job, ParseError, SearchQuery};
use jobscout_http::{
    BackoffPolicy, FetchError, HttpClientConfig, PageFetcher, RateLimitConfig, RateLimiter, ReqwestTransport,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

mod enrich;
mod pagination;

pub use enrich::DetailEnricher;
pub use pagination::{
    plan_offsets, OffsetRegistry, PageOutcome, PageReport, PageStatus, PaginationBoundary, StopPolicy,
};

pub const CRATE_NAME: &str = "jobscout-sync";

#[derive(Debug, Clone)]
pub struct ScraperConfig {
    pub board: String,
    pub user_agent: String,
    pub http_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub rate_limit: RateLimitConfig,
    pub stop_policy: StopPolicy,
    pub separate_detail_limiter: bool,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            board: "linkedin".to_string(),
            user_agent: "jobscout/0.1".to_string(),
            http_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            stop_policy: StopPolicy::default(),
            separate_detail_limiter: false,
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|v| v.trim().parse().ok())
}

impl ScraperConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from any `name -> value` source; unparseable values
    /// keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let secs = |name: &str, fallback: Duration| {
            parsed::<u64>(&lookup, name)
                .map(Duration::from_secs)
                .unwrap_or(fallback)
        };

        Self {
            board: lookup("JOBSCOUT_BOARD").unwrap_or(defaults.board),
            user_agent: lookup("JOBSCOUT_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout: secs("JOBSCOUT_HTTP_TIMEOUT_SECS", defaults.http_timeout),
            backoff: BackoffPolicy {
                max_retries: parsed(&lookup, "JOBSCOUT_MAX_RETRIES").unwrap_or(defaults.backoff.max_retries),
                base_delay: secs("JOBSCOUT_RETRY_DELAY_SECS", defaults.backoff.base_delay),
                max_delay: secs("JOBSCOUT_RETRY_MAX_DELAY_SECS", defaults.backoff.max_delay),
            },
            rate_limit: RateLimitConfig {
                permits: parsed(&lookup, "JOBSCOUT_RATE_LIMIT_PERMITS").unwrap_or(defaults.rate_limit.permits),
                period: secs("JOBSCOUT_RATE_LIMIT_PERIOD_SECS", defaults.rate_limit.period),
            },
            stop_policy: parsed(&lookup, "JOBSCOUT_STOP_POLICY").unwrap_or(defaults.stop_policy),
            separate_detail_limiter: lookup("JOBSCOUT_SEPARATE_DETAIL_LIMITER")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.separate_detail_limiter),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("scrape task failed: {0}")]
    TaskFailed(String),
}

impl ScrapeError {
    pub fn alias_not_found(&self) -> Option<&AliasNotFound> {
        match self {
            ScrapeError::Fetch(FetchError::Parse {
                source: ParseError::Alias(alias),
                ..
            }) => Some(alias),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchReport {
    pub run_id: Uuid,
    pub board: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jobs: Vec<Job>,
    pub pages: Vec<PageReport>,
    pub missing_details: usize,
}

impl SearchReport {
    pub fn page(&self, offset: usize) -> Option<&PageStatus> {
        self.pages.iter().find(|p| p.offset == offset).map(|p| &p.status)
    }
}

pub struct JobScraper {
    board: Arc<dyn JobBoard>,
    fetcher: PageFetcher,
    detail_fetcher: PageFetcher,
    stop_policy: StopPolicy,
}

impl JobScraper {
    /// Listing and detail fetches share `fetcher` and therefore its limiter.
    pub fn new(board: Arc<dyn JobBoard>, fetcher: PageFetcher) -> Self {
        Self {
            board,
            detail_fetcher: fetcher.clone(),
            fetcher,
            stop_policy: StopPolicy::default(),
        }
    }

    pub fn with_stop_policy(mut self, stop_policy: StopPolicy) -> Self {
        self.stop_policy = stop_policy;
        self
    }

    pub fn with_detail_fetcher(mut self, detail_fetcher: PageFetcher) -> Self {
        self.detail_fetcher = detail_fetcher;
        self
    }

    pub fn from_config(config: &ScraperConfig) -> anyhow::Result<Self> {
        let board = board_for_id(&config.board)
            .with_context(|| format!("unknown job board {:?}", config.board))?;
        let transport = ReqwestTransport::new(&HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
        })?;
        let fetcher = PageFetcher::new(
            Arc::new(transport),
            Arc::new(RateLimiter::new(config.rate_limit)),
            config.backoff,
        );

        let mut scraper = Self::new(board, fetcher).with_stop_policy(config.stop_policy);
        if config.separate_detail_limiter {
            let sibling = Arc::new(RateLimiter::new(config.rate_limit));
            scraper.detail_fetcher = scraper.fetcher.with_limiter(sibling);
        }
        Ok(scraper)
    }

    pub fn board(&self) -> &Arc<dyn JobBoard> {
        &self.board
    }

    pub fn plan_offsets(&self, limit: usize) -> Vec<usize> {
        plan_offsets(limit, self.board.page_size(), self.board.start_limit())
    }

    /// Runs one search. Jobs come back in offset order, then markup order
    /// within a page; duplicates across pages are kept.
    pub async fn search(&self, query: &SearchQuery, fetch_details: bool) -> Result<SearchReport, ScrapeError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let paginated = pagination::paginate(
            Arc::clone(&self.board),
            self.fetcher.clone(),
            query,
            self.stop_policy,
            run_id,
        )
        .await?;

        let (jobs, missing_details) = if fetch_details {
            let enriched = DetailEnricher::new(Arc::clone(&self.board), self.detail_fetcher.clone())
                .enrich_counted(query, paginated.jobs, run_id)
                .await?;
            (enriched.jobs, enriched.missing_details)
        } else {
            (paginated.jobs, 0)
        };

        Ok(SearchReport {
            run_id,
            board: self.board.board_id().to_string(),
            started_at,
            finished_at: Utc::now(),
            jobs,
            pages: paginated.pages,
            missing_details,
        })
    }

    pub async fn scrape(&self, query: &SearchQuery, fetch_details: bool) -> Result<Vec<Job>, ScrapeError> {
        self.search(query, fetch_details).await.map(|report| report.jobs)
    }
}

pub async fn run_search_from_env(query: &SearchQuery, fetch_details: bool) -> anyhow::Result<SearchReport> {
    let config = ScraperConfig::from_env();
    let scraper = JobScraper::from_config(&config)?;
    scraper
        .search(query, fetch_details)
        .await
        .with_context(|| format!("searching {} for {:?}", config.board, query.keywords))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn config_defaults_match_the_board_quota() {
        let config = ScraperConfig::from_lookup(|_| None);
        assert_eq!(config.board, "linkedin");
        assert_eq!(config.http_timeout, Duration::from_secs(10));
        assert_eq!(config.backoff.max_retries, 5);
        assert_eq!(config.backoff.base_delay, Duration::from_secs(5));
        assert_eq!(config.rate_limit.permits, 5);
        assert_eq!(config.rate_limit.period, Duration::from_secs(8));
        assert_eq!(config.stop_policy, StopPolicy::Boundary);
        assert!(!config.separate_detail_limiter);
    }

    #[test]
    fn config_reads_overrides_and_ignores_garbage() {
        let config = ScraperConfig::from_lookup(lookup_from(&[
            ("JOBSCOUT_MAX_RETRIES", "3"),
            ("JOBSCOUT_RETRY_DELAY_SECS", "soon"),
            ("JOBSCOUT_RATE_LIMIT_PERMITS", "10"),
            ("JOBSCOUT_RATE_LIMIT_PERIOD_SECS", "60"),
            ("JOBSCOUT_STOP_POLICY", "first-empty"),
            ("JOBSCOUT_SEPARATE_DETAIL_LIMITER", "true"),
            ("JOBSCOUT_USER_AGENT", "scout-test"),
        ]));
        assert_eq!(config.backoff.max_retries, 3);
        assert_eq!(config.backoff.base_delay, Duration::from_secs(5));
        assert_eq!(config.rate_limit.permits, 10);
        assert_eq!(config.rate_limit.period, Duration::from_secs(60));
        assert_eq!(config.stop_policy, StopPolicy::FirstEmpty);
        assert!(config.separate_detail_limiter);
        assert_eq!(config.user_agent, "scout-test");
    }

    #[test]
    fn from_config_rejects_unknown_boards() {
        let config = ScraperConfig {
            board: "monster".to_string(),
            ..ScraperConfig::default()
        };
        assert!(JobScraper::from_config(&config).is_err());
    }

    #[test]
    fn from_config_plans_linkedin_offsets() {
        let scraper = JobScraper::from_config(&ScraperConfig::default()).expect("scraper");
        assert_eq!(scraper.board().board_id(), "linkedin");
        assert_eq!(scraper.plan_offsets(100), vec![0, 25, 50, 75]);
        assert_eq!(scraper.plan_offsets(2000).len(), 40);
    }
}
