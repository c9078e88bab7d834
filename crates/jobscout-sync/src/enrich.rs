//! Best-effort detail enrichment: one detail fetch per listed job.

use std::sync::Arc;

use jobscout_adapters::JobBoard;
use jobscout_core::{Job, JobDetails, SearchQuery};
use jobscout_http::{FetchError, PageFetcher};
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::ScrapeError;

pub struct DetailEnricher {
    board: Arc<dyn JobBoard>,
    fetcher: PageFetcher,
}

pub(crate) struct Enriched {
    pub jobs: Vec<Job>,
    pub missing_details: usize,
}

impl DetailEnricher {
    pub fn new(board: Arc<dyn JobBoard>, fetcher: PageFetcher) -> Self {
        Self { board, fetcher }
    }

    /// Fetches details for every job concurrently and attaches them in place.
    ///
    /// A job whose detail fetch runs out of retries keeps `details: None`.
    /// Any other failure aborts the remaining fetches and is returned.
    pub async fn enrich(&self, query: &SearchQuery, jobs: Vec<Job>, run_id: Uuid) -> Result<Vec<Job>, ScrapeError> {
        self.enrich_counted(query, jobs, run_id).await.map(|e| e.jobs)
    }

    pub(crate) async fn enrich_counted(
        &self,
        query: &SearchQuery,
        mut jobs: Vec<Job>,
        run_id: Uuid,
    ) -> Result<Enriched, ScrapeError> {
        info!(%run_id, jobs = jobs.len(), "fetching job details");

        let mut tasks = JoinSet::new();
        for (index, job) in jobs.iter().enumerate() {
            let board = Arc::clone(&self.board);
            let fetcher = self.fetcher.clone();
            let query = query.clone();
            let job = job.clone();
            let span = info_span!("job_detail", %run_id, url = %job.link);
            tasks.spawn(
                async move {
                    let details = board.fetch_detail(&fetcher, &query, &job).await;
                    (index, details)
                }
                .instrument(span),
            );
        }

        let mut details: Vec<Option<JobDetails>> = vec![None; jobs.len()];
        let mut missing_details = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(found))) => details[index] = Some(found),
                Ok((index, Err(err @ FetchError::TooManyRetries { .. }))) => {
                    warn!(url = %jobs[index].link, error = %err, "leaving job without details");
                    missing_details += 1;
                }
                Ok((_, Err(err))) => {
                    tasks.abort_all();
                    return Err(ScrapeError::Fetch(err));
                }
                Err(join_err) => {
                    tasks.abort_all();
                    return Err(ScrapeError::TaskFailed(join_err.to_string()));
                }
            }
        }

        for (job, found) in jobs.iter_mut().zip(details) {
            job.details = found;
        }

        info!(%run_id, missing_details, "job details fetched");
        Ok(Enriched {
            jobs,
            missing_details,
        })
    }
}
