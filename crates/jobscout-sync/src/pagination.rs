//! Concurrent listing pagination with early termination.
//!
//! Every planned offset gets its own task up front; the shared rate limiter is
//! what actually bounds how many requests are in flight. When the end of the
//! result set is found, tasks for higher offsets are cancelled.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;

use jobscout_adapters::JobBoard;
use jobscout_core::{Job, SearchQuery};
use jobscout_http::{FetchError, PageFetcher};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::ScrapeError;

/// When an empty listing page ends pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum StopPolicy {
    /// An empty page ends pagination once every lower offset has settled and
    /// no higher offset has returned records.
    #[default]
    Boundary,
    /// The lowest empty page seen so far ends pagination immediately, even if
    /// lower offsets are still in flight.
    FirstEmpty,
}

impl FromStr for StopPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "boundary" => Ok(StopPolicy::Boundary),
            "first-empty" | "first_empty" => Ok(StopPolicy::FirstEmpty),
            other => Err(format!("unknown stop policy {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    Records,
    Empty,
    Exhausted,
}

/// Early-stop bookkeeping shared by every page task of one search.
#[derive(Debug)]
pub struct PaginationBoundary {
    policy: StopPolicy,
    page_size: usize,
    end: usize,
    frontier: usize,
    settled: BTreeSet<usize>,
    pending_empty: BTreeSet<usize>,
    highest_non_empty: Option<usize>,
}

impl PaginationBoundary {
    pub fn new(policy: StopPolicy, page_size: usize, limit: usize) -> Self {
        Self {
            policy,
            page_size: page_size.max(1),
            end: limit,
            frontier: 0,
            settled: BTreeSet::new(),
            pending_empty: BTreeSet::new(),
            highest_non_empty: None,
        }
    }

    /// Lowest offset known to be past the end of the result set, or the
    /// planned limit while nothing is known.
    pub fn end(&self) -> usize {
        self.end
    }

    /// Records what the page at `offset` produced. Returns `Some(cutoff)` when
    /// every offset above `cutoff` has become redundant.
    pub fn observe(&mut self, offset: usize, outcome: PageOutcome) -> Option<usize> {
        match self.policy {
            StopPolicy::FirstEmpty => {
                if outcome == PageOutcome::Empty && offset < self.end {
                    self.end = offset;
                    return Some(offset);
                }
                None
            }
            StopPolicy::Boundary => self.observe_boundary(offset, outcome),
        }
    }

    fn observe_boundary(&mut self, offset: usize, outcome: PageOutcome) -> Option<usize> {
        match outcome {
            PageOutcome::Records => {
                self.settled.insert(offset);
                self.highest_non_empty = Some(self.highest_non_empty.map_or(offset, |h| h.max(offset)));
                let spurious: Vec<usize> = self.pending_empty.range(..offset).copied().collect();
                for empty in spurious {
                    warn!(empty, later = offset, "empty page followed by records; not treating it as the end");
                    self.pending_empty.remove(&empty);
                    self.settled.insert(empty);
                }
                if self.highest_non_empty == Some(offset) {
                    let next = offset + self.page_size;
                    if next < self.end && self.pending_empty.contains(&next) {
                        return Some(self.confirm_end(next));
                    }
                }
            }
            PageOutcome::Exhausted => {
                self.settled.insert(offset);
            }
            PageOutcome::Empty => {
                if offset >= self.end {
                    return None;
                }
                match self.highest_non_empty {
                    Some(h) if h > offset => {
                        warn!(offset, "empty page below a non-empty one; not treating it as the end");
                        self.settled.insert(offset);
                    }
                    Some(h) if h + self.page_size == offset => return Some(self.confirm_end(offset)),
                    _ => {
                        self.pending_empty.insert(offset);
                    }
                }
            }
        }

        // Without records directly below it, a pending empty page ends the
        // results once every lower offset has settled.
        while self.settled.contains(&self.frontier) {
            self.frontier += self.page_size;
        }

        if self.frontier < self.end && self.pending_empty.contains(&self.frontier) {
            return Some(self.confirm_end(self.frontier));
        }
        None
    }

    fn confirm_end(&mut self, offset: usize) -> usize {
        self.end = offset;
        self.pending_empty.clear();
        offset
    }
}

/// One cancellation handle per planned offset, all children of a root token.
#[derive(Debug)]
pub struct OffsetRegistry {
    root: CancellationToken,
    tokens: BTreeMap<usize, CancellationToken>,
}

impl OffsetRegistry {
    pub fn new(offsets: &[usize]) -> Self {
        let root = CancellationToken::new();
        let tokens = offsets
            .iter()
            .map(|offset| (*offset, root.child_token()))
            .collect();
        Self { root, tokens }
    }

    pub fn token(&self, offset: usize) -> CancellationToken {
        self.tokens
            .get(&offset)
            .cloned()
            .unwrap_or_else(|| self.root.child_token())
    }

    /// Cancels every offset strictly above `cutoff`. Idempotent.
    pub fn cancel_beyond(&self, cutoff: usize) -> usize {
        let mut cancelled = 0;
        for token in self.tokens.range(cutoff.saturating_add(1)..).map(|(_, t)| t) {
            if !token.is_cancelled() {
                token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn cancel_all(&self) {
        self.root.cancel();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PageStatus {
    Fetched { records: usize },
    Cancelled,
    Exhausted { attempts: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageReport {
    pub offset: usize,
    pub status: PageStatus,
}

enum PageTaskResult {
    Fetched(Vec<Job>),
    Cancelled,
    Exhausted(usize),
}

struct PageTaskContext {
    board: Arc<dyn JobBoard>,
    fetcher: PageFetcher,
    query: SearchQuery,
    boundary: Mutex<PaginationBoundary>,
    registry: OffsetRegistry,
}

impl PageTaskContext {
    async fn settle(&self, offset: usize, outcome: PageOutcome) {
        let cutoff = self.boundary.lock().await.observe(offset, outcome);
        if let Some(cutoff) = cutoff {
            let cancelled = self.registry.cancel_beyond(cutoff);
            info!(cutoff, cancelled, "end of results found; cancelling later pages");
        }
    }
}

async fn run_page(ctx: Arc<PageTaskContext>, offset: usize) -> Result<(usize, PageTaskResult), FetchError> {
    let token = ctx.registry.token(offset);
    let fetched = tokio::select! {
        biased;
        _ = token.cancelled() => {
            debug!("page cancelled");
            return Ok((offset, PageTaskResult::Cancelled));
        }
        fetched = ctx.board.fetch_listing(&ctx.fetcher, &ctx.query, offset) => fetched,
    };

    match fetched {
        Ok(jobs) => {
            debug!(records = jobs.len(), "page fetched");
            let outcome = if jobs.is_empty() {
                PageOutcome::Empty
            } else {
                PageOutcome::Records
            };
            ctx.settle(offset, outcome).await;
            Ok((offset, PageTaskResult::Fetched(jobs)))
        }
        Err(FetchError::TooManyRetries { attempts, .. }) => {
            warn!(attempts, "page gave up after retries; contributing no records");
            ctx.settle(offset, PageOutcome::Exhausted).await;
            Ok((offset, PageTaskResult::Exhausted(attempts)))
        }
        Err(err) => Err(err),
    }
}

/// Offsets `0, page_size, 2 * page_size, ...` below `min(limit, start_limit)`.
pub fn plan_offsets(limit: usize, page_size: usize, start_limit: usize) -> Vec<usize> {
    (0..limit.min(start_limit)).step_by(page_size.max(1)).collect()
}

pub(crate) struct Paginated {
    pub jobs: Vec<Job>,
    pub pages: Vec<PageReport>,
}

pub(crate) async fn paginate(
    board: Arc<dyn JobBoard>,
    fetcher: PageFetcher,
    query: &SearchQuery,
    policy: StopPolicy,
    run_id: Uuid,
) -> Result<Paginated, ScrapeError> {
    let offsets = plan_offsets(query.limit, board.page_size(), board.start_limit());
    let limit = offsets.last().map_or(0, |last| last + board.page_size());
    let board_id = board.board_id();
    info!(%run_id, board = board_id, pages = offsets.len(), "starting pagination");

    let ctx = Arc::new(PageTaskContext {
        boundary: Mutex::new(PaginationBoundary::new(policy, board.page_size(), limit)),
        registry: OffsetRegistry::new(&offsets),
        board,
        fetcher,
        query: query.clone(),
    });

    let mut tasks = JoinSet::new();
    for offset in &offsets {
        let span = info_span!("listing_page", %run_id, board = board_id, offset = *offset);
        tasks.spawn(run_page(Arc::clone(&ctx), *offset).instrument(span));
    }

    let mut results = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok((offset, result))) => {
                results.insert(offset, result);
            }
            Ok(Err(err)) => {
                ctx.registry.cancel_all();
                tasks.abort_all();
                return Err(ScrapeError::Fetch(err));
            }
            Err(join_err) => {
                ctx.registry.cancel_all();
                tasks.abort_all();
                return Err(ScrapeError::TaskFailed(join_err.to_string()));
            }
        }
    }

    let mut jobs = Vec::new();
    let mut pages = Vec::with_capacity(results.len());
    for (offset, result) in results {
        let status = match result {
            PageTaskResult::Fetched(page_jobs) => {
                let records = page_jobs.len();
                jobs.extend(page_jobs);
                PageStatus::Fetched { records }
            }
            PageTaskResult::Cancelled => PageStatus::Cancelled,
            PageTaskResult::Exhausted(attempts) => PageStatus::Exhausted { attempts },
        };
        pages.push(PageReport { offset, status });
    }

    info!(%run_id, jobs = jobs.len(), "pagination finished");
    Ok(Paginated { jobs, pages })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_follow_page_size_up_to_the_cap() {
        assert_eq!(plan_offsets(100, 25, 1000), vec![0, 25, 50, 75]);
        assert_eq!(plan_offsets(60, 25, 1000), vec![0, 25, 50]);
        assert_eq!(plan_offsets(5000, 25, 1000).len(), 40);
        assert_eq!(plan_offsets(5000, 25, 1000).last(), Some(&975));
        assert!(plan_offsets(0, 25, 1000).is_empty());
    }

    #[test]
    fn stop_policy_parses_env_spellings() {
        assert_eq!("boundary".parse(), Ok(StopPolicy::Boundary));
        assert_eq!(" First-Empty ".parse(), Ok(StopPolicy::FirstEmpty));
        assert!("eager".parse::<StopPolicy>().is_err());
    }

    #[test]
    fn boundary_confirms_an_empty_page_contiguous_with_records() {
        let mut boundary = PaginationBoundary::new(StopPolicy::Boundary, 25, 100);
        assert_eq!(boundary.observe(0, PageOutcome::Records), None);
        assert_eq!(boundary.observe(25, PageOutcome::Records), None);
        assert_eq!(boundary.observe(50, PageOutcome::Empty), Some(50));
        assert_eq!(boundary.end(), 50);
        assert_eq!(boundary.observe(75, PageOutcome::Empty), None);
    }

    #[test]
    fn boundary_confirms_without_waiting_for_lower_offsets() {
        let mut boundary = PaginationBoundary::new(StopPolicy::Boundary, 25, 100);
        assert_eq!(boundary.observe(25, PageOutcome::Records), None);
        assert_eq!(boundary.observe(50, PageOutcome::Empty), Some(50));
        assert_eq!(boundary.end(), 50);
        assert_eq!(boundary.observe(0, PageOutcome::Records), None);
    }

    #[test]
    fn boundary_confirms_when_records_arrive_just_below_a_pending_empty() {
        let mut boundary = PaginationBoundary::new(StopPolicy::Boundary, 25, 100);
        assert_eq!(boundary.observe(50, PageOutcome::Empty), None);
        assert_eq!(boundary.end(), 100);
        assert_eq!(boundary.observe(25, PageOutcome::Records), Some(50));
        assert_eq!(boundary.observe(0, PageOutcome::Records), None);
    }

    #[test]
    fn boundary_holds_a_gapped_empty_page_until_the_gap_settles() {
        let mut boundary = PaginationBoundary::new(StopPolicy::Boundary, 25, 125);
        assert_eq!(boundary.observe(0, PageOutcome::Records), None);
        assert_eq!(boundary.observe(75, PageOutcome::Empty), None);
        assert_eq!(boundary.observe(25, PageOutcome::Records), None);
        assert_eq!(boundary.observe(50, PageOutcome::Records), Some(75));
    }

    #[test]
    fn boundary_discards_an_empty_page_below_later_records() {
        let mut boundary = PaginationBoundary::new(StopPolicy::Boundary, 25, 100);
        assert_eq!(boundary.observe(25, PageOutcome::Empty), None);
        assert_eq!(boundary.observe(50, PageOutcome::Records), None);
        assert_eq!(boundary.observe(0, PageOutcome::Records), None);
        assert_eq!(boundary.end(), 100);
        assert_eq!(boundary.observe(75, PageOutcome::Empty), Some(75));
    }

    #[test]
    fn boundary_ignores_empty_pages_below_known_records() {
        let mut boundary = PaginationBoundary::new(StopPolicy::Boundary, 25, 100);
        assert_eq!(boundary.observe(50, PageOutcome::Records), None);
        assert_eq!(boundary.observe(25, PageOutcome::Empty), None);
        assert_eq!(boundary.observe(0, PageOutcome::Records), None);
        assert_eq!(boundary.end(), 100);
    }

    #[test]
    fn boundary_moves_past_exhausted_offsets() {
        let mut boundary = PaginationBoundary::new(StopPolicy::Boundary, 25, 100);
        assert_eq!(boundary.observe(0, PageOutcome::Records), None);
        assert_eq!(boundary.observe(50, PageOutcome::Empty), None);
        assert_eq!(boundary.observe(25, PageOutcome::Exhausted), Some(50));
    }

    #[test]
    fn empty_first_page_ends_everything() {
        let mut boundary = PaginationBoundary::new(StopPolicy::Boundary, 25, 100);
        assert_eq!(boundary.observe(0, PageOutcome::Empty), Some(0));
    }

    #[test]
    fn first_empty_policy_cuts_at_the_lowest_empty_seen() {
        let mut boundary = PaginationBoundary::new(StopPolicy::FirstEmpty, 25, 100);
        assert_eq!(boundary.observe(75, PageOutcome::Empty), Some(75));
        assert_eq!(boundary.observe(50, PageOutcome::Empty), Some(50));
        assert_eq!(boundary.observe(75, PageOutcome::Empty), None);
        assert_eq!(boundary.observe(0, PageOutcome::Records), None);
        assert_eq!(boundary.end(), 50);
    }

    #[test]
    fn registry_cancels_strictly_above_the_cutoff_once() {
        let registry = OffsetRegistry::new(&[0, 25, 50, 75]);
        assert_eq!(registry.cancel_beyond(25), 2);
        assert!(!registry.token(0).is_cancelled());
        assert!(!registry.token(25).is_cancelled());
        assert!(registry.token(50).is_cancelled());
        assert!(registry.token(75).is_cancelled());
        assert_eq!(registry.cancel_beyond(25), 0);

        registry.cancel_all();
        assert!(registry.token(0).is_cancelled());
    }
}
