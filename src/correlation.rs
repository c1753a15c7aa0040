//! Maps raw interception events back to one telemetry record per logical call.
//!
//! The correlation key is (scope, connection, command). The first hook firing for a key owns the
//! record; nested or repeated firings for the same key within one scope merge into the owner.
//! Records are finalized when their scope closes.

use crate::interceptor::{CallShape, SqlCommand};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

/// Result classification of a completed logical call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum CallOutcome {
    /// The call returned normally. Result code "0".
    Success,
    /// The call raised a provider error.
    Failure {
        result_code: String,
        message: String,
    },
}

impl CallOutcome {
    /// Outcome for a call that was started but never completed.
    pub(crate) fn abandoned() -> Self {
        CallOutcome::Failure {
            result_code: "ABANDONED".into(),
            message: "call abandoned before completion".into(),
        }
    }
}

/// Handle for one hook firing, returned by `start` and consumed by `complete`.
#[derive(Debug)]
pub(crate) struct CallToken {
    scope_id: u64,
    key: CallKey,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
struct CallKey {
    connection: u64,
    command: u64,
}

struct CallState {
    shape: CallShape,
    target: String,
    command_text: String,
    stored_procedure: bool,
    start_time: SystemTime,
    started: Instant,
    ended: Option<Instant>,
    // Hook firings currently open for this key. Nested firings raise it above 1.
    open: u32,
    outcome: Option<CallOutcome>,
}

#[derive(Default)]
struct ScopeState {
    calls: HashMap<CallKey, CallState>,
    // Emission order: first start wins.
    order: Vec<CallKey>,
}

/// A finalized logical call, ready to become a telemetry envelope.
#[derive(Clone, Debug)]
pub(crate) struct CompletedCall {
    pub(crate) target: String,
    pub(crate) command_text: String,
    pub(crate) stored_procedure: bool,
    pub(crate) start_time: SystemTime,
    pub(crate) duration: Duration,
    pub(crate) outcome: CallOutcome,
    pub(crate) shape: CallShape,
}

#[derive(Default)]
pub(crate) struct CorrelationEngine {
    next_scope_id: AtomicU64,
    // Only ever locked for map bookkeeping, never across an instrumented call.
    scopes: Mutex<HashMap<u64, ScopeState>>,
}

impl CorrelationEngine {
    pub(crate) fn open_scope(&self) -> u64 {
        let scope_id = self.next_scope_id.fetch_add(1, Ordering::Relaxed);
        self.scopes
            .lock()
            .expect("correlation map lock poisoned")
            .insert(scope_id, ScopeState::default());
        scope_id
    }

    /// Record a hook firing for `command` within `scope_id`.
    ///
    /// A firing for a key that is already tracked merges into the existing record instead of
    /// creating a second one.
    pub(crate) fn start(&self, scope_id: u64, command: &SqlCommand, shape: CallShape) -> CallToken {
        let key = CallKey {
            connection: command.connection.id,
            command: command.id,
        };
        let mut scopes = self.scopes.lock().expect("correlation map lock poisoned");
        let scope = scopes.entry(scope_id).or_default();
        match scope.calls.get_mut(&key) {
            Some(call) => {
                call.open += 1;
                tracing::trace!(
                    scope_id,
                    ?shape,
                    "merging hook firing into existing call record"
                );
            }
            None => {
                scope.calls.insert(
                    key,
                    CallState {
                        shape,
                        target: command.connection.resource_identity(),
                        command_text: command.command_text().to_string(),
                        stored_procedure: matches!(
                            command.text,
                            crate::interceptor::CommandText::StoredProcedure(_)
                        ),
                        start_time: SystemTime::now(),
                        started: Instant::now(),
                        ended: None,
                        open: 1,
                        outcome: None,
                    },
                );
                scope.order.push(key);
            }
        }
        CallToken { scope_id, key }
    }

    /// Record the completion of a hook firing. The first failure wins the merged outcome.
    pub(crate) fn complete(&self, token: CallToken, outcome: CallOutcome) {
        let mut scopes = self.scopes.lock().expect("correlation map lock poisoned");
        let call = scopes
            .get_mut(&token.scope_id)
            .and_then(|scope| scope.calls.get_mut(&token.key));
        let call = match call {
            Some(call) => call,
            None => {
                tracing::debug!("call completed after its scope closed; dropping completion");
                return;
            }
        };
        call.open = call.open.saturating_sub(1);
        call.ended = Some(Instant::now());
        match &call.outcome {
            Some(CallOutcome::Failure { .. }) => {}
            _ => call.outcome = Some(outcome),
        }
    }

    /// Close a scope and finalize every call it tracked, in start order.
    ///
    /// Calls still open at this point are reported as abandoned failures, never dropped.
    pub(crate) fn close_scope(&self, scope_id: u64) -> Vec<CompletedCall> {
        let scope = self
            .scopes
            .lock()
            .expect("correlation map lock poisoned")
            .remove(&scope_id);
        let mut scope = match scope {
            Some(scope) => scope,
            None => return Vec::new(),
        };
        let mut completed = Vec::with_capacity(scope.order.len());
        for key in scope.order.drain(..) {
            let call = scope.calls.remove(&key).expect("ordered key must exist");
            let outcome = if call.open > 0 {
                match call.outcome {
                    Some(failure @ CallOutcome::Failure { .. }) => failure,
                    _ => CallOutcome::abandoned(),
                }
            } else {
                call.outcome.unwrap_or_else(CallOutcome::abandoned)
            };
            let end = call.ended.unwrap_or_else(Instant::now);
            completed.push(CompletedCall {
                target: call.target,
                command_text: call.command_text,
                stored_procedure: call.stored_procedure,
                start_time: call.start_time,
                duration: end.saturating_duration_since(call.started),
                outcome,
                shape: call.shape,
            });
        }
        completed
    }
}

impl std::fmt::Debug for CorrelationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationEngine").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::{SqlCommand, SqlConnection};

    fn command() -> SqlCommand {
        let connection =
            SqlConnection::new(r"Data Source=.\SQLEXPRESS;Initial Catalog=RDDTestDatabase").unwrap();
        SqlCommand::text(&connection, "SELECT TOP 10 * FROM apm.Messages")
    }

    #[test]
    fn one_call_one_record() {
        let engine = CorrelationEngine::default();
        let scope = engine.open_scope();
        let token = engine.start(scope, &command(), CallShape::Sync);
        engine.complete(token, CallOutcome::Success);
        let completed = engine.close_scope(scope);
        assert_eq!(1, completed.len());
        assert_eq!(CallOutcome::Success, completed[0].outcome);
    }

    #[test]
    fn sequential_executions_of_one_command_merge() {
        let engine = CorrelationEngine::default();
        let scope = engine.open_scope();
        let command = command();
        let first = engine.start(scope, &command, CallShape::Sync);
        engine.complete(first, CallOutcome::Success);
        let second = engine.start(scope, &command, CallShape::Sync);
        engine.complete(second, CallOutcome::Success);
        let completed = engine.close_scope(scope);
        assert_eq!(1, completed.len());
    }

    #[test]
    fn nested_firings_merge_into_the_outermost() {
        let engine = CorrelationEngine::default();
        let scope = engine.open_scope();
        let command = command();
        // An async wrapper internally issuing a begin/end pair fires the hooks twice.
        let outer = engine.start(scope, &command, CallShape::Async);
        let inner = engine.start(
            scope,
            &command,
            CallShape::BeginEnd(crate::interceptor::BeginEndArity::Two),
        );
        engine.complete(inner, CallOutcome::Success);
        engine.complete(outer, CallOutcome::Success);
        let completed = engine.close_scope(scope);
        assert_eq!(1, completed.len());
        assert_eq!(CallShape::Async, completed[0].shape);
    }

    #[test]
    fn first_failure_wins_the_merged_outcome() {
        let engine = CorrelationEngine::default();
        let scope = engine.open_scope();
        let command = command();
        let first = engine.start(scope, &command, CallShape::Sync);
        engine.complete(
            first,
            CallOutcome::Failure {
                result_code: "208".into(),
                message: "Invalid object name 'apm.Database1212121'.".into(),
            },
        );
        let second = engine.start(scope, &command, CallShape::Sync);
        engine.complete(second, CallOutcome::Success);
        let completed = engine.close_scope(scope);
        assert_eq!(1, completed.len());
        match &completed[0].outcome {
            CallOutcome::Failure { result_code, .. } => assert_eq!("208", result_code),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn distinct_commands_report_separately() {
        let engine = CorrelationEngine::default();
        let scope = engine.open_scope();
        let connection =
            SqlConnection::new(r"Data Source=.\SQLEXPRESS;Initial Catalog=RDDTestDatabase").unwrap();
        let first_command = SqlCommand::text(&connection, "SELECT 1");
        let second_command = SqlCommand::text(&connection, "SELECT 2");
        let first = engine.start(scope, &first_command, CallShape::Sync);
        engine.complete(first, CallOutcome::Success);
        let second = engine.start(scope, &second_command, CallShape::Sync);
        engine.complete(second, CallOutcome::Success);
        let completed = engine.close_scope(scope);
        assert_eq!(2, completed.len());
    }

    #[test]
    fn concurrent_scopes_never_cross_contaminate() {
        let engine = std::sync::Arc::new(CorrelationEngine::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    let scope = engine.open_scope();
                    let token = engine.start(scope, &command(), CallShape::Sync);
                    engine.complete(token, CallOutcome::Success);
                    engine.close_scope(scope).len()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(1, handle.join().unwrap());
        }
    }

    #[test]
    fn open_call_at_scope_close_is_abandoned() {
        let engine = CorrelationEngine::default();
        let scope = engine.open_scope();
        let _token = engine.start(scope, &command(), CallShape::Sync);
        let completed = engine.close_scope(scope);
        assert_eq!(1, completed.len());
        assert_eq!(CallOutcome::abandoned(), completed[0].outcome);
    }
}
