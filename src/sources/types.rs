// src/sources/types.rs
use crate::model::UnifiedRecord;

/// Parameters forwarded to every source, already validated by the
/// orchestrator. Providers translate these into portal-specific query strings.
#[derive(Debug, Clone)]
pub struct SourceQuery {
    pub date_from: chrono::NaiveDate,
    pub date_to: chrono::NaiveDate,
    /// Uppercase UF codes; empty means nationwide.
    pub states: Vec<String>,
    pub page_size: u32,
}

/// One page of results from a source.
#[derive(Debug, Clone)]
pub struct SourcePage {
    pub records: Vec<UnifiedRecord>,
    pub current_page: u32,
    /// Total item count as reported by the portal, when it reports one.
    pub total_reported: Option<u64>,
    pub has_more: bool,
}

/// Failure modes of a single page fetch. `is_transient` encodes the retry
/// table: connection trouble, timeouts, and a fixed set of HTTP statuses are
/// retryable; everything else fails the call immediately.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out")]
    Timeout,
    #[error("http status {status}")]
    Http {
        status: u16,
        /// Parsed `Retry-After` seconds, only meaningful for 429.
        retry_after: Option<u64>,
    },
    #[error("decoding response failed: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Connect(_) | FetchError::Timeout => true,
            FetchError::Http { status, .. } => {
                matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
            }
            FetchError::Decode(_) => false,
        }
    }

    /// Map a reqwest failure into the taxonomy. Status-bearing responses are
    /// handled separately by `from_status` because reqwest surfaces them on
    /// the response, not as errors.
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if e.is_connect() {
            FetchError::Connect(e.to_string())
        } else if e.is_decode() {
            FetchError::Decode(e.to_string())
        } else {
            FetchError::Connect(e.to_string())
        }
    }

    pub fn from_status(status: u16, retry_after: Option<u64>) -> Self {
        FetchError::Http {
            status,
            retry_after,
        }
    }
}

/// Extract `Retry-After` as whole seconds. HTTP-date forms are rare on the
/// portals we talk to and are ignored.
pub fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

#[async_trait::async_trait]
pub trait SourceProvider: Send + Sync {
    /// Fetch a single page (1-based). Implementations do the network call and
    /// mapping; retries and pacing live in the client wrapper.
    async fn fetch_page(&self, query: &SourceQuery, page: u32) -> Result<SourcePage, FetchError>;

    fn source(&self) -> crate::model::SourceName;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses_match_retry_table() {
        for status in [408u16, 429, 500, 502, 503, 504] {
            assert!(
                FetchError::from_status(status, None).is_transient(),
                "{status} should be transient"
            );
        }
        for status in [400u16, 401, 403, 404, 422] {
            assert!(
                !FetchError::from_status(status, None).is_transient(),
                "{status} should be fatal"
            );
        }
    }

    #[test]
    fn connect_and_timeout_are_transient_decode_is_not() {
        assert!(FetchError::Connect("refused".into()).is_transient());
        assert!(FetchError::Timeout.is_transient());
        assert!(!FetchError::Decode("bad json".into()).is_transient());
    }
}
