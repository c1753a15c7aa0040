use crate::collector::{outcome_of, Inner, OperationScope};
use crate::connection_string::SqlConnectionString;
use crate::correlation::{CallOutcome, CallToken};
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// The provider API shape that initiated a call.
///
/// Every shape normalizes to one start/end pair; the shape itself only matters for diagnostics.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallShape {
    /// Direct synchronous execution.
    Sync,
    /// Asynchronous execution awaited via a future.
    Async,
    /// Classic two-phase begin/end invocation.
    BeginEnd(BeginEndArity),
}

/// Number of auxiliary arguments (callback, state, behavior) passed to a begin-style overload.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BeginEndArity {
    /// `BeginExecute()`
    Zero,
    /// `BeginExecute(callback)`
    One,
    /// `BeginExecute(callback, state)`
    Two,
    /// `BeginExecute(callback, state, behavior)`
    Three,
}

/// Errors raised by an instrumented provider call.
///
/// The interceptor uses this to classify a failed call: the error number becomes the telemetry
/// result code and the display message becomes the `ErrorMessage` property in rich collection
/// mode. The error itself always propagates to the caller unchanged.
pub trait ProviderError: fmt::Display {
    /// Provider-specific error number, e.g. 208 for "Invalid object name".
    fn error_number(&self) -> i32;
}

/// A database connection identity, parsed from a SQL provider connection string.
///
/// The id is process-unique; correlation uses it to keep concurrent calls on independent
/// connections apart.
#[derive(Clone, Debug)]
pub struct SqlConnection {
    pub(crate) id: u64,
    parsed: SqlConnectionString,
}

impl SqlConnection {
    /// Parse a provider connection string (`Data Source=...;Initial Catalog=...`).
    pub fn new(connection_string: impl AsRef<str>) -> Result<Self, crate::ParseError> {
        let parsed: SqlConnectionString = connection_string.as_ref().parse()?;
        Ok(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            parsed,
        })
    }

    /// The server part of the connection, matched against the suppression list.
    pub fn data_source(&self) -> &str {
        &self.parsed.data_source
    }

    /// Human-readable identity of the remote dependency, reported as the telemetry target.
    pub fn resource_identity(&self) -> String {
        self.parsed.resource_identity()
    }
}

/// The text of an instrumented command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandText {
    /// A SQL statement.
    Text(String),
    /// A stored procedure invoked by name.
    StoredProcedure(String),
}

impl CommandText {
    pub(crate) fn as_str(&self) -> &str {
        match self {
            CommandText::Text(text) => text,
            CommandText::StoredProcedure(name) => name,
        }
    }
}

/// One command on a connection. Executing the same command several times within one operation
/// scope merges into a single telemetry record.
#[derive(Clone, Debug)]
pub struct SqlCommand {
    pub(crate) id: u64,
    pub(crate) connection: SqlConnection,
    pub(crate) text: CommandText,
}

impl SqlCommand {
    /// A command running a SQL statement.
    pub fn text(connection: &SqlConnection, statement: impl Into<String>) -> Self {
        Self::new(connection, CommandText::Text(statement.into()))
    }

    /// A command invoking a stored procedure by name.
    pub fn stored_procedure(connection: &SqlConnection, name: impl Into<String>) -> Self {
        Self::new(connection, CommandText::StoredProcedure(name.into()))
    }

    fn new(connection: &SqlConnection, text: CommandText) -> Self {
        Self {
            id: NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed),
            connection: connection.clone(),
            text,
        }
    }

    /// The statement or stored procedure name.
    pub fn command_text(&self) -> &str {
        self.text.as_str()
    }
}

/// An in-flight two-phase call, returned by `begin_execute`.
///
/// Completing it with `end_execute` records the call outcome. Dropping it without completing
/// reports the call as abandoned; it is never silently lost.
pub struct PendingCall {
    pub(crate) inner: Arc<Inner>,
    pub(crate) token: Option<CallToken>,
    // Present when the call was begun outside an explicit scope; dropping it finalizes the
    // implicit scope and hands the record to the pipeline.
    pub(crate) owned_scope: Option<OperationScope>,
}

impl PendingCall {
    /// Record the outcome of the call. The result is inspected only; ownership stays with the
    /// caller.
    pub fn end<T, E: ProviderError>(mut self, result: &Result<T, E>) {
        if let Some(token) = self.token.take() {
            self.inner.correlation.complete(token, outcome_of(result));
        }
        self.owned_scope.take();
    }

    pub(crate) fn noop(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            token: None,
            owned_scope: None,
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            tracing::debug!("two-phase call dropped without end_execute; reporting as abandoned");
            self.inner
                .correlation
                .complete(token, CallOutcome::abandoned());
        }
    }
}

impl Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("instrumented", &self.token.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> SqlConnection {
        SqlConnection::new(r"Data Source=.\SQLEXPRESS;Initial Catalog=RDDTestDatabase").unwrap()
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = connection();
        let b = connection();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn command_text_accessors() {
        let connection = connection();
        let query = SqlCommand::text(&connection, "SELECT 1");
        let proc = SqlCommand::stored_procedure(&connection, "GetTopTenMessages");
        assert_eq!("SELECT 1", query.command_text());
        assert_eq!("GetTopTenMessages", proc.command_text());
        assert_ne!(query.id, proc.id);
    }

    #[test]
    fn resource_identity_reports_server_and_database() {
        assert_eq!(
            r".\SQLEXPRESS | RDDTestDatabase",
            connection().resource_identity()
        );
    }
}
