//! A remote dependency collection agent for [Azure Application Insights].
//!
//! [Azure Application Insights]: https://docs.microsoft.com/en-us/azure/azure-monitor/app/app-insights-overview
//!
//! **Disclaimer**: This is not an official Microsoft product.
//!
//! The collector instruments outbound SQL calls made by an application, measures their latency,
//! classifies success or failure, and reports one `RemoteDependencyData` telemetry item per
//! logical call to an ingestion endpoint. Delivery is batched and happens on a background task;
//! the instrumented call path never waits for the network.
//!
//! # Usage
//!
//! ```rust,no_run
//! use dependency_collector::{DependencyCollector, SqlCommand, SqlConnection};
//! # #[derive(Debug)]
//! # struct SqlError;
//! # impl std::fmt::Display for SqlError {
//! #     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "err") }
//! # }
//! # impl dependency_collector::ProviderError for SqlError {
//! #     fn error_number(&self) -> i32 { 208 }
//! # }
//!
//! # #[derive(Debug)]
//! # struct NullSink;
//! # #[async_trait::async_trait]
//! # impl dependency_collector::TelemetrySink for NullSink {
//! #     async fn transmit(
//! #         &self,
//! #         _items: Vec<dependency_collector::Envelope>,
//! #     ) -> Result<(), dependency_collector::Error> {
//! #         Ok(())
//! #     }
//! # }
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! // With the `reqwest-client` feature, `.with_sink(NullSink)` below becomes
//! // `.with_client(reqwest::Client::new())`.
//! let collector = DependencyCollector::builder("InstrumentationKey=...")?
//!     .with_sink(NullSink)
//!     .build()?;
//!
//! let connection = SqlConnection::new(r"Data Source=.\SQLEXPRESS;Initial Catalog=RDDTestDatabase")?;
//! let command = SqlCommand::stored_procedure(&connection, "GetTopTenMessages");
//!
//! // The call's own result and errors pass through unchanged.
//! let rows: Result<u32, SqlError> = collector.execute(&command, || Ok(10));
//! # drop(rows);
//!
//! collector.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Call shapes
//!
//! Providers expose the same logical call through several API shapes. The collector normalizes
//! all of them to one start/end pair and reports exactly one record per logical call:
//!
//! | Provider API shape                   | Collector entry point                 |
//! | ------------------------------------ | ------------------------------------- |
//! | `ExecuteReader()` etc., synchronous  | [`DependencyCollector::execute`]      |
//! | `ExecuteReaderAsync()` etc., awaited | [`DependencyCollector::execute_async`]|
//! | `BeginExecuteReader`/`EndExecuteReader` with 0-3 auxiliary arguments | [`DependencyCollector::begin_execute`] / [`DependencyCollector::end_execute`] |
//!
//! # Correlation
//!
//! Wrap one logical unit of work in an [`OperationScope`]: executions of the same command within
//! one scope, including nested hook firings from layered provider APIs, merge into a single
//! record. Concurrent scopes on independent connections never affect each other. A call that is
//! started but never completed (a dropped [`PendingCall`], a cancelled future) is reported as a
//! failed record rather than silently lost.
#![deny(missing_docs, unreachable_pub, missing_debug_implementations)]
#![cfg_attr(test, deny(warnings))]

mod collector;
mod config;
mod connection_string;
mod convert;
mod correlation;
mod error;
mod interceptor;
mod models;
mod pipeline;
mod uploader;

pub use collector::{DependencyCollector, OperationScope};
pub use config::{CollectionMode, CollectorBuilder};
pub use connection_string::ParseError;
pub use error::Error;
pub use interceptor::{
    BeginEndArity, CallShape, CommandText, PendingCall, ProviderError, SqlCommand, SqlConnection,
};
pub use models::Envelope;
pub use pipeline::TelemetrySink;
pub use uploader::{HttpClient, HttpError, HttpSink};
