// src/client.rs
//! # Resilient source client
//!
//! Wraps one `SourceProvider` with everything a flaky government API needs:
//! retry with jittered backoff, request pacing, and the per-source circuit
//! breaker. The breaker counts *call* outcomes (a call that succeeds after
//! internal retries is one success), so a source that recovers under retry
//! never trips the circuit.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, error, warn};

use crate::model::{SourceName, UnifiedRecord};
use crate::resilience::breaker::{Admit, CircuitBreaker};
use crate::resilience::{RequestPacer, RetryPolicy};
use crate::sources::types::{FetchError, SourcePage, SourceProvider, SourceQuery};
use crate::sources::SourceConfig;

/// Safety ceiling for runaway pagination; portals occasionally report
/// `has_more` forever.
pub const DEFAULT_PAGE_CEILING: u32 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The breaker is open; the network was never touched. The orchestrator
    /// turns this into a "source skipped" entry, not a hard failure.
    #[error("source {source_name} skipped: circuit open")]
    CircuitOpen { source_name: SourceName },
    #[error("source {source} unavailable: {last}")]
    Unavailable {
        source: SourceName,
        #[source]
        last: FetchError,
    },
}

pub struct ResilientSourceClient {
    provider: Arc<dyn SourceProvider>,
    config: SourceConfig,
    policy: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
    pacer: RequestPacer,
}

impl ResilientSourceClient {
    pub fn new(
        provider: Arc<dyn SourceProvider>,
        config: SourceConfig,
        mut policy: RetryPolicy,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        if let Some(max_retries) = config.max_retries {
            policy.max_retries = max_retries;
        }
        let pacer = RequestPacer::new(config.rate_limit_rps);
        Self {
            provider,
            config,
            policy,
            breaker,
            pacer,
        }
    }

    pub fn source(&self) -> SourceName {
        self.config.code
    }

    /// Fetch one page, retrying transient failures. Exactly one breaker
    /// outcome is recorded per call regardless of how many attempts ran.
    pub async fn fetch_page(
        &self,
        query: &SourceQuery,
        page: u32,
    ) -> Result<SourcePage, ClientError> {
        let source = self.source();
        match self.breaker.preflight() {
            Admit::ShortCircuit => {
                counter!("source_skipped_circuit_total", "source" => source.code()).increment(1);
                return Err(ClientError::CircuitOpen { source_name: source });
            }
            Admit::Allow | Admit::Probe => {}
        }

        let mut attempt: u32 = 0;
        loop {
            self.pacer.acquire().await;
            match self.provider.fetch_page(query, page).await {
                Ok(p) => {
                    self.breaker.on_success();
                    counter!("source_pages_total", "source" => source.code()).increment(1);
                    return Ok(p);
                }
                Err(e) if self.policy.should_retry(attempt, &e) => {
                    let delay = self.policy.delay_for_error(attempt, &e);
                    counter!("source_fetch_retries_total", "source" => source.code()).increment(1);
                    debug!(
                        target: "source",
                        source = %source,
                        page,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.breaker.on_failure();
                    counter!("source_failures_total", "source" => source.code()).increment(1);
                    if e.is_transient() {
                        warn!(
                            target: "source",
                            source = %source,
                            page,
                            attempts = attempt + 1,
                            error = %e,
                            "retries exhausted"
                        );
                    } else {
                        // Non-retryable 4xx usually means a broken query or
                        // credentials, not a portal outage.
                        error!(
                            target: "source",
                            source = %source,
                            page,
                            error = %e,
                            "non-retryable failure"
                        );
                    }
                    return Err(ClientError::Unavailable { source, last: e });
                }
            }
        }
    }

    /// Fresh cursor for one walk over the result pages. Never shared across
    /// callers; every call restarts from page 1.
    pub fn cursor<'c>(&'c self, query: SourceQuery, max_pages: u32) -> PageCursor<'c> {
        PageCursor {
            client: self,
            query,
            next_page: 1,
            done: false,
            fetched: 0,
            total_reported: None,
            max_pages: max_pages.max(1),
        }
    }

    /// Drive a cursor to completion and collect every record.
    pub async fn fetch_all(
        &self,
        query: SourceQuery,
        max_pages: u32,
    ) -> Result<Vec<UnifiedRecord>, ClientError> {
        let mut cursor = self.cursor(query, max_pages);
        let mut out = Vec::new();
        while let Some(page) = cursor.next_page().await {
            out.extend(page?.records);
        }
        Ok(out)
    }
}

/// Lazily walks a source's pages in strictly increasing order, stopping at
/// the end of results, the first error, or the page ceiling.
pub struct PageCursor<'c> {
    client: &'c ResilientSourceClient,
    query: SourceQuery,
    next_page: u32,
    done: bool,
    fetched: usize,
    total_reported: Option<u64>,
    max_pages: u32,
}

impl PageCursor<'_> {
    pub async fn next_page(&mut self) -> Option<Result<SourcePage, ClientError>> {
        if self.done {
            return None;
        }
        if self.next_page > self.max_pages {
            warn!(
                target: "source",
                source = %self.client.source(),
                pages = self.max_pages,
                fetched = self.fetched,
                total_reported = ?self.total_reported,
                "page ceiling reached before source reported end of results"
            );
            self.done = true;
            return None;
        }

        let page_no = self.next_page;
        match self.client.fetch_page(&self.query, page_no).await {
            Ok(page) => {
                self.fetched += page.records.len();
                if page.total_reported.is_some() {
                    self.total_reported = page.total_reported;
                }
                self.next_page += 1;
                self.done = !page.has_more;
                Some(Ok(page))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
