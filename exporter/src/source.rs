//! Ledger source adapters.
//!
//! A [`LedgerSource`] hands out ledgers one at a time, in order, for a
//! requested range. Transient upstream failures are the adapter's problem;
//! the pipeline treats every fetch error as fatal.

use std::time::Duration;

use async_trait::async_trait;
use error_stack::{Report, Result, ResultExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::codec::Ledger;

#[derive(Debug)]
pub enum SourceError {
    /// Request to the ledger node failed.
    Request,
    /// Response could not be deserialized.
    DeserializeResponse,
    /// The requested range cannot be served.
    Prepare,
    /// Cancelled while waiting for a ledger.
    Cancelled,
}

impl error_stack::Context for SourceError {}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Request => f.write_str("ledger source: request failed"),
            SourceError::DeserializeResponse => {
                f.write_str("ledger source: failed to deserialize response")
            }
            SourceError::Prepare => f.write_str("ledger source: failed to prepare range"),
            SourceError::Cancelled => f.write_str("ledger source: cancelled"),
        }
    }
}

pub trait SourceResultExt {
    fn is_cancelled(&self) -> bool;
}

impl SourceResultExt for Report<SourceError> {
    fn is_cancelled(&self) -> bool {
        matches!(self.current_context(), SourceError::Cancelled)
    }
}

/// Range of ledgers to export, inclusive on both ends.
///
/// An unbounded range streams until cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerRange {
    pub start: u32,
    pub end: Option<u32>,
}

impl LedgerRange {
    pub fn bounded(start: u32, end: u32) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn unbounded(start: u32) -> Self {
        Self { start, end: None }
    }

    pub fn is_bounded(&self) -> bool {
        self.end.is_some()
    }

    /// Whether `sequence` still falls inside the range.
    pub fn contains(&self, sequence: u32) -> bool {
        sequence >= self.start && self.end.map(|end| sequence <= end).unwrap_or(true)
    }
}

impl std::fmt::Display for LedgerRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.end {
            Some(end) => write!(f, "[{}, {}]", self.start, end),
            None => write!(f, "[{}, ..]", self.start),
        }
    }
}

/// Supplies ledgers one at a time, in order, for a requested range.
#[async_trait]
pub trait LedgerSource: Send + Sync {
    /// Instruct the source to make the range available. Idempotent; called
    /// once before the first `get_ledger`.
    async fn prepare(&self, range: LedgerRange) -> Result<(), SourceError>;

    /// Fetch the ledger with the given sequence, waiting until it is
    /// available upstream or cancellation is observed.
    ///
    /// A successful fetch always returns a ledger whose sequence equals the
    /// requested one.
    async fn get_ledger(
        &self,
        ct: &CancellationToken,
        sequence: u32,
    ) -> Result<Ledger, SourceError>;

    /// Latest sequence committed upstream (the network tip).
    async fn latest_sequence(&self) -> Result<u32, SourceError>;

    async fn close(&self) -> Result<(), SourceError>;
}

#[derive(Debug, Clone)]
pub struct HttpLedgerSourceOptions {
    /// Base URL of the ledger node.
    pub url: String,
    /// How long to wait before retrying a ledger that is not yet available.
    pub poll_interval: Duration,
}

/// Ledger source backed by a ledger node's HTTP API.
///
/// The node exposes `GET /ledgers/{sequence}` returning the raw encoded
/// ledger, `GET /latest` returning the tip, and `POST /prepare` to start
/// replaying a range.
#[derive(Clone)]
pub struct HttpLedgerSource {
    client: Client,
    url: String,
    poll_interval: Duration,
}

#[derive(Debug, Serialize)]
struct PrepareRequest {
    start: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    end: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct LatestResponse {
    sequence: u32,
}

impl HttpLedgerSource {
    pub fn new(options: HttpLedgerSourceOptions) -> Self {
        let url = options.url.trim_end_matches('/').to_string();
        Self {
            client: Client::new(),
            url,
            poll_interval: options.poll_interval,
        }
    }

    /// Fetch a single ledger, returning `None` if it is not yet available.
    async fn get_ledger_once(&self, sequence: u32) -> Result<Option<Ledger>, SourceError> {
        let url = format!("{}/ledgers/{}", self.url, sequence);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .change_context(SourceError::Request)?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(Report::new(SourceError::Request))
                .attach_printable_lazy(|| format!("status: {}", response.status()))
                .attach_printable_lazy(|| format!("sequence: {}", sequence));
        }

        let body = response
            .bytes()
            .await
            .change_context(SourceError::Request)?;

        Ok(Some(Ledger::new(sequence, body.to_vec())))
    }
}

#[async_trait]
impl LedgerSource for HttpLedgerSource {
    async fn prepare(&self, range: LedgerRange) -> Result<(), SourceError> {
        let request = PrepareRequest {
            start: range.start,
            end: range.end,
        };

        let response = self
            .client
            .post(format!("{}/prepare", self.url))
            .json(&request)
            .send()
            .await
            .change_context(SourceError::Prepare)?;

        if !response.status().is_success() {
            return Err(Report::new(SourceError::Prepare))
                .attach_printable_lazy(|| format!("status: {}", response.status()))
                .attach_printable_lazy(|| format!("range: {}", range));
        }

        Ok(())
    }

    async fn get_ledger(
        &self,
        ct: &CancellationToken,
        sequence: u32,
    ) -> Result<Ledger, SourceError> {
        loop {
            if let Some(ledger) = self.get_ledger_once(sequence).await? {
                return Ok(ledger);
            }

            // Not yet available upstream; wait one interval or bail out.
            tokio::select! {
                _ = ct.cancelled() => {
                    return Err(Report::new(SourceError::Cancelled))
                        .attach_printable_lazy(|| format!("sequence: {}", sequence));
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn latest_sequence(&self) -> Result<u32, SourceError> {
        let response = self
            .client
            .get(format!("{}/latest", self.url))
            .send()
            .await
            .change_context(SourceError::Request)?;

        if !response.status().is_success() {
            return Err(Report::new(SourceError::Request))
                .attach_printable_lazy(|| format!("status: {}", response.status()));
        }

        let latest: LatestResponse = response
            .json()
            .await
            .change_context(SourceError::DeserializeResponse)?;

        Ok(latest.sequence)
    }

    async fn close(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

pub mod testing {
    use async_trait::async_trait;
    use error_stack::{Report, Result};
    use tokio_util::sync::CancellationToken;

    use crate::codec::Ledger;

    use super::{LedgerRange, LedgerSource, SourceError};

    /// Deterministic ledger payload used by tests.
    pub fn ledger_data(sequence: u32) -> Vec<u8> {
        format!("ledger-{}", sequence).into_bytes()
    }

    /// In-memory source with ledgers up to a fixed tip.
    ///
    /// Requests beyond the tip behave like a real source: they block until
    /// cancellation.
    #[derive(Clone)]
    pub struct InMemoryLedgerSource {
        latest: u32,
    }

    impl InMemoryLedgerSource {
        pub fn new(latest: u32) -> Self {
            Self { latest }
        }
    }

    #[async_trait]
    impl LedgerSource for InMemoryLedgerSource {
        async fn prepare(&self, _range: LedgerRange) -> Result<(), SourceError> {
            Ok(())
        }

        async fn get_ledger(
            &self,
            ct: &CancellationToken,
            sequence: u32,
        ) -> Result<Ledger, SourceError> {
            if sequence > self.latest {
                ct.cancelled().await;
                return Err(Report::new(SourceError::Cancelled));
            }
            Ok(Ledger::new(sequence, ledger_data(sequence)))
        }

        async fn latest_sequence(&self) -> Result<u32, SourceError> {
            Ok(self.latest)
        }

        async fn close(&self) -> Result<(), SourceError> {
            Ok(())
        }
    }

    /// Source that fails every fetch. Used to exercise fatal error paths.
    #[derive(Clone)]
    pub struct ErroringLedgerSource;

    #[async_trait]
    impl LedgerSource for ErroringLedgerSource {
        async fn prepare(&self, _range: LedgerRange) -> Result<(), SourceError> {
            Ok(())
        }

        async fn get_ledger(
            &self,
            _ct: &CancellationToken,
            _sequence: u32,
        ) -> Result<Ledger, SourceError> {
            Err(Report::new(SourceError::Request))
        }

        async fn latest_sequence(&self) -> Result<u32, SourceError> {
            Ok(u32::MAX)
        }

        async fn close(&self) -> Result<(), SourceError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::testing::{ledger_data, InMemoryLedgerSource};
    use super::{LedgerRange, LedgerSource, SourceResultExt};

    #[test]
    fn test_range_display() {
        assert_eq!(LedgerRange::bounded(2, 255).to_string(), "[2, 255]");
        assert_eq!(LedgerRange::unbounded(2).to_string(), "[2, ..]");
    }

    #[test]
    fn test_range_contains() {
        let bounded = LedgerRange::bounded(2, 10);
        assert!(bounded.contains(2));
        assert!(bounded.contains(10));
        assert!(!bounded.contains(1));
        assert!(!bounded.contains(11));

        let unbounded = LedgerRange::unbounded(2);
        assert!(unbounded.contains(u32::MAX));
    }

    #[tokio::test]
    async fn test_in_memory_source() {
        let source = InMemoryLedgerSource::new(100);
        let ct = CancellationToken::new();

        let ledger = source.get_ledger(&ct, 42).await.unwrap();
        assert_eq!(ledger.sequence, 42);
        assert_eq!(ledger.data, ledger_data(42));
        assert_eq!(source.latest_sequence().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_in_memory_source_cancellation() {
        let source = InMemoryLedgerSource::new(100);
        let ct = CancellationToken::new();
        ct.cancel();

        // Past the tip the source blocks until cancellation.
        let report = source.get_ledger(&ct, 101).await.unwrap_err();
        assert!(report.is_cancelled());
    }
}
