use crate::config::{CollectionMode, CollectorBuilder, ResolvedConfig};
use crate::convert::{duration_to_string, time_to_string};
use crate::correlation::{CallOutcome, CompletedCall, CorrelationEngine};
use crate::interceptor::{BeginEndArity, CallShape, PendingCall, ProviderError, SqlCommand};
use crate::models::{Data, Envelope, RemoteDependencyData, Sanitize};
use crate::pipeline::{DeliveryPipeline, TelemetrySink};
use crate::ParseError;
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;

const DEPENDENCY_TYPE: &str = "SQL";
const ENVELOPE_NAME: &str = "Microsoft.ApplicationInsights.RemoteDependency";

/// Instruments outbound SQL calls and reports one telemetry record per logical call.
///
/// The collector never changes what the instrumented call returns: results and provider errors
/// pass through unchanged, and a failure to instrument (for example a suppressed target) means
/// the call simply runs uninstrumented.
#[derive(Clone)]
pub struct DependencyCollector {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: ResolvedConfig,
    pub(crate) correlation: CorrelationEngine,
    pub(crate) pipeline: DeliveryPipeline,
}

impl DependencyCollector {
    /// Start configuring a collector from a telemetry connection string.
    pub fn builder(connection_string: impl AsRef<str>) -> Result<CollectorBuilder, ParseError> {
        CollectorBuilder::from_connection_string(connection_string)
    }

    pub(crate) fn new(config: ResolvedConfig, sink: Arc<dyn TelemetrySink>) -> Self {
        let pipeline = DeliveryPipeline::start(
            sink,
            config.flush_interval,
            config.max_batch_size,
            config.retry_budget,
        );
        Self {
            inner: Arc::new(Inner {
                config,
                correlation: CorrelationEngine::default(),
                pipeline,
            }),
        }
    }

    /// Open a logical unit of work.
    ///
    /// All calls made through the returned scope that share a connection and command merge into
    /// one telemetry record; the records are handed to the delivery pipeline when the scope is
    /// dropped.
    pub fn operation(&self) -> OperationScope {
        OperationScope {
            inner: self.inner.clone(),
            scope_id: self.inner.correlation.open_scope(),
        }
    }

    /// Instrument a synchronous call. The call gets its own one-call scope.
    pub fn execute<T, E, F>(&self, command: &SqlCommand, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: ProviderError,
    {
        self.operation().execute(command, operation)
    }

    /// Instrument an asynchronous call. The call gets its own one-call scope.
    ///
    /// Timing is attributed from the original start no matter which thread resumes the future;
    /// dropping the returned future mid-flight reports the call as abandoned.
    pub async fn execute_async<T, E, Fut>(&self, command: &SqlCommand, future: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: ProviderError,
    {
        self.operation().execute_async(command, future).await
    }

    /// Start instrumenting a two-phase call in its own one-call scope.
    pub fn begin_execute(&self, command: &SqlCommand, arity: BeginEndArity) -> PendingCall {
        let scope = self.operation();
        let token = scope.start(command, CallShape::BeginEnd(arity));
        PendingCall {
            inner: self.inner.clone(),
            token,
            owned_scope: Some(scope),
        }
    }

    /// Complete a two-phase call with the result of the provider's end call.
    pub fn end_execute<T, E: ProviderError>(&self, pending: PendingCall, result: &Result<T, E>) {
        pending.end(result);
    }

    /// Deliver everything queued so far and wait for the attempt to finish.
    pub async fn flush(&self) {
        self.inner.pipeline.flush().await;
    }

    /// Drain the queue and stop the delivery worker.
    pub async fn shutdown(&self) {
        self.inner.pipeline.shutdown().await;
    }
}

impl Debug for DependencyCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyCollector")
            .field("config", &self.inner.config)
            .finish()
    }
}

/// One logical unit of work; see [`DependencyCollector::operation`].
pub struct OperationScope {
    inner: Arc<Inner>,
    scope_id: u64,
}

impl OperationScope {
    /// Instrument a synchronous call within this scope.
    pub fn execute<T, E, F>(&self, command: &SqlCommand, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: ProviderError,
    {
        let token = self.start(command, CallShape::Sync);
        let result = operation();
        if let Some(token) = token {
            self.inner.correlation.complete(token, outcome_of(&result));
        }
        result
    }

    /// Instrument an asynchronous call within this scope.
    pub async fn execute_async<T, E, Fut>(&self, command: &SqlCommand, future: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        E: ProviderError,
    {
        let token = self.start(command, CallShape::Async);
        let result = future.await;
        if let Some(token) = token {
            self.inner.correlation.complete(token, outcome_of(&result));
        }
        result
    }

    /// Start instrumenting a two-phase call within this scope.
    ///
    /// If the scope closes before [`PendingCall::end`] runs, the call is reported as abandoned.
    pub fn begin_execute(&self, command: &SqlCommand, arity: BeginEndArity) -> PendingCall {
        let token = self.start(command, CallShape::BeginEnd(arity));
        match token {
            Some(token) => PendingCall {
                inner: self.inner.clone(),
                token: Some(token),
                owned_scope: None,
            },
            None => PendingCall::noop(self.inner.clone()),
        }
    }

    fn start(
        &self,
        command: &SqlCommand,
        shape: CallShape,
    ) -> Option<crate::correlation::CallToken> {
        if self.inner.config.is_suppressed(command.connection.data_source()) {
            tracing::debug!(
                data_source = command.connection.data_source(),
                "target suppressed; call runs uninstrumented"
            );
            return None;
        }
        Some(self.inner.correlation.start(self.scope_id, command, shape))
    }
}

impl Drop for OperationScope {
    fn drop(&mut self) {
        for call in self.inner.correlation.close_scope(self.scope_id) {
            let mut envelope = build_envelope(call, &self.inner.config);
            envelope.sanitize();
            self.inner.pipeline.enqueue(envelope);
        }
    }
}

impl Debug for OperationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationScope")
            .field("scope_id", &self.scope_id)
            .finish()
    }
}

pub(crate) fn outcome_of<T, E: ProviderError>(result: &Result<T, E>) -> CallOutcome {
    match result {
        Ok(_) => CallOutcome::Success,
        Err(err) => CallOutcome::Failure {
            result_code: err.error_number().to_string(),
            message: err.to_string(),
        },
    }
}

fn build_envelope(call: CompletedCall, config: &ResolvedConfig) -> Envelope {
    let rich = config.mode == CollectionMode::Rich;
    let (success, result_code, error_message) = match call.outcome {
        CallOutcome::Success => (true, "0".to_string(), None),
        CallOutcome::Failure {
            result_code,
            message,
        } => (false, result_code, Some(message)),
    };

    let mut properties = BTreeMap::new();
    if rich {
        if let Some(message) = error_message {
            properties.insert("ErrorMessage".to_string(), message);
        }
    }

    let data = if rich {
        Some(call.command_text.clone())
    } else {
        None
    };
    // Stored procedures are best identified by name; ad-hoc statements by their target.
    let name = if call.stored_procedure {
        call.command_text
    } else {
        call.target.clone()
    };

    tracing::trace!(shape = ?call.shape, success, "finalized dependency record");

    Envelope {
        name: ENVELOPE_NAME.into(),
        time: time_to_string(call.start_time),
        sample_rate: Some(100.0),
        i_key: Some(config.instrumentation_key.clone()),
        tags: None,
        data: Some(Data::RemoteDependency(RemoteDependencyData {
            ver: 2,
            name,
            id: None,
            result_code: Some(result_code),
            duration: duration_to_string(call.duration),
            success: Some(success),
            data,
            target: Some(call.target),
            type_: Some(DEPENDENCY_TYPE.into()),
            properties: Some(properties).filter(|p| !p.is_empty()),
        })),
    }
}
