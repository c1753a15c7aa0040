use crate::collector::DependencyCollector;
use crate::connection_string::ConnectionString;
use crate::pipeline::TelemetrySink;
use crate::uploader::{HttpClient, HttpSink};
use crate::{Error, ParseError};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_MAX_BATCH_SIZE: usize = 100;
const DEFAULT_RETRY_BUDGET: usize = 3;

/// How much call detail ends up in telemetry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CollectionMode {
    /// Report target, timing and result code only.
    Basic,
    /// Additionally report the command text and, on failure, the provider error message as the
    /// `ErrorMessage` property.
    Rich,
}

/// Configures and builds a [`DependencyCollector`].
pub struct CollectorBuilder {
    connection: ConnectionString,
    flush_interval: Duration,
    max_batch_size: usize,
    retry_budget: usize,
    mode: CollectionMode,
    suppressed: Vec<String>,
    sink: Option<Arc<dyn TelemetrySink>>,
}

impl CollectorBuilder {
    /// Start a builder from a telemetry connection string
    /// (`InstrumentationKey=...;IngestionEndpoint=...`).
    pub fn from_connection_string(connection_string: impl AsRef<str>) -> Result<Self, ParseError> {
        Ok(Self {
            connection: connection_string.as_ref().parse()?,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            retry_budget: DEFAULT_RETRY_BUDGET,
            mode: CollectionMode::Rich,
            suppressed: Vec::new(),
            sink: None,
        })
    }

    /// How long completed records may sit in the queue before a delivery attempt.
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Deliver as soon as this many records are queued, even before the flush interval elapses.
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    /// How many times a transiently failing delivery is retried before the batch is dropped.
    pub fn with_retry_budget(mut self, retry_budget: usize) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    /// Set the collection mode. Default: [`CollectionMode::Rich`].
    pub fn with_collection_mode(mut self, mode: CollectionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Never instrument calls whose data source contains this substring (case-insensitive).
    ///
    /// The ingestion endpoint host is always suppressed, so the collector's own delivery traffic
    /// cannot recursively generate telemetry.
    pub fn with_suppressed_target(mut self, target: impl Into<String>) -> Self {
        self.suppressed.push(target.into().to_lowercase());
        self
    }

    /// Deliver over HTTP with the given client.
    pub fn with_client<C: HttpClient>(mut self, client: C) -> Self {
        self.sink = Some(Arc::new(HttpSink::new(
            client,
            self.connection.ingestion_endpoint.clone(),
        )));
        self
    }

    /// Deliver to a custom sink. Mostly useful for tests.
    pub fn with_sink(mut self, sink: impl TelemetrySink) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Build the collector and spawn its delivery worker. Must be called within a tokio runtime.
    pub fn build(self) -> Result<DependencyCollector, Error> {
        let sink = self.sink.ok_or(Error::MissingSink)?;
        let mut suppressed = self.suppressed;
        if let Some(host) = self.connection.ingestion_endpoint.host() {
            suppressed.push(host.to_lowercase());
        }
        let config = ResolvedConfig {
            instrumentation_key: self.connection.instrumentation_key,
            mode: self.mode,
            suppressed,
            flush_interval: self.flush_interval,
            max_batch_size: self.max_batch_size,
            retry_budget: self.retry_budget,
        };
        Ok(DependencyCollector::new(config, sink))
    }
}

impl Debug for CollectorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorBuilder")
            .field("connection", &self.connection)
            .field("flush_interval", &self.flush_interval)
            .field("max_batch_size", &self.max_batch_size)
            .field("retry_budget", &self.retry_budget)
            .field("mode", &self.mode)
            .field("suppressed", &self.suppressed)
            .finish()
    }
}

#[derive(Debug)]
pub(crate) struct ResolvedConfig {
    pub(crate) instrumentation_key: String,
    pub(crate) mode: CollectionMode,
    suppressed: Vec<String>,
    pub(crate) flush_interval: Duration,
    pub(crate) max_batch_size: usize,
    pub(crate) retry_budget: usize,
}

impl ResolvedConfig {
    pub(crate) fn is_suppressed(&self, data_source: &str) -> bool {
        let data_source = data_source.to_lowercase();
        self.suppressed
            .iter()
            .any(|pattern| data_source.contains(pattern))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(suppressed: Vec<String>) -> ResolvedConfig {
        ResolvedConfig {
            instrumentation_key: "ikey".into(),
            mode: CollectionMode::Rich,
            suppressed,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }

    #[test]
    fn suppression_is_substring_and_case_insensitive() {
        let config = resolved(vec!["dc.services.visualstudio.com".into()]);
        assert!(config.is_suppressed("tcp:DC.Services.VisualStudio.com,443"));
        assert!(!config.is_suppressed(r".\SQLEXPRESS"));
    }

    #[test]
    fn build_without_sink_fails() {
        let result = CollectorBuilder::from_connection_string("InstrumentationKey=key")
            .unwrap()
            .build();
        assert!(matches!(result, Err(Error::MissingSink)));
    }
}
