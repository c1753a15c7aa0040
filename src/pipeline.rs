//! Background batching and delivery of finalized telemetry records.
//!
//! Interception threads hand envelopes to an unbounded channel and return immediately; a worker
//! task batches them and flushes on a timer or when the batch fills up. Transient delivery
//! failures are retried with exponential backoff; after the retry budget the batch is dropped
//! and logged, never surfaced to the instrumented application.

use crate::{models::Envelope, Error};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

/// Destination for finalized telemetry envelopes.
///
/// The HTTP ingestion sink is the production implementation; tests inject an in-memory recorder.
#[async_trait]
pub trait TelemetrySink: Send + Sync + 'static {
    /// Deliver one batch. Return [`Error::UploadRetryable`] or [`Error::UploadConnection`] for
    /// failures worth retrying.
    async fn transmit(&self, items: Vec<Envelope>) -> Result<(), Error>;
}

enum Command {
    Item(Envelope),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

pub(crate) struct DeliveryPipeline {
    sender: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeliveryPipeline {
    /// Spawn the delivery worker. Must be called within a tokio runtime.
    pub(crate) fn start(
        sink: Arc<dyn TelemetrySink>,
        flush_interval: Duration,
        max_batch_size: usize,
        retry_budget: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(
            receiver,
            sink,
            flush_interval,
            max_batch_size,
            retry_budget,
        ));
        Self {
            sender,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue an envelope. Never blocks; after shutdown the envelope is dropped with a log line.
    pub(crate) fn enqueue(&self, envelope: Envelope) {
        if self.sender.send(Command::Item(envelope)).is_err() {
            tracing::debug!("telemetry item dropped; pipeline already shut down");
        }
    }

    /// Deliver everything queued so far and wait for the attempt to finish.
    pub(crate) async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender.send(Command::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Drain the queue and stop the worker.
    pub(crate) async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender.send(Command::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
        if let Some(worker) = self.worker.lock().await.take() {
            let _ = worker.await;
        }
    }
}

impl Debug for DeliveryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryPipeline").finish()
    }
}

async fn run_worker(
    mut receiver: mpsc::UnboundedReceiver<Command>,
    sink: Arc<dyn TelemetrySink>,
    flush_interval: Duration,
    max_batch_size: usize,
    retry_budget: usize,
) {
    // Queued items are Pending; moving into `batch` makes them Batched; `deliver` takes them to
    // Sent or Dropped.
    let mut batch: Vec<Envelope> = Vec::new();
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            command = receiver.recv() => match command {
                Some(Command::Item(envelope)) => {
                    batch.push(envelope);
                    if batch.len() >= max_batch_size {
                        deliver(&sink, &mut batch, retry_budget).await;
                    }
                }
                Some(Command::Flush(ack)) => {
                    deliver(&sink, &mut batch, retry_budget).await;
                    let _ = ack.send(());
                }
                Some(Command::Shutdown(ack)) => {
                    // Drain anything enqueued before the shutdown command.
                    while let Ok(Command::Item(envelope)) = receiver.try_recv() {
                        batch.push(envelope);
                    }
                    deliver(&sink, &mut batch, retry_budget).await;
                    let _ = ack.send(());
                    break;
                }
                None => {
                    deliver(&sink, &mut batch, retry_budget).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    deliver(&sink, &mut batch, retry_budget).await;
                }
            }
        }
    }
}

async fn deliver(sink: &Arc<dyn TelemetrySink>, batch: &mut Vec<Envelope>, retry_budget: usize) {
    if batch.is_empty() {
        return;
    }
    let items = std::mem::take(batch);
    let count = items.len();
    let attempt = || {
        let sink = Arc::clone(sink);
        let items = items.clone();
        async move { sink.transmit(items).await }
    };
    let result = attempt
        .retry(ExponentialBuilder::default().with_max_times(retry_budget))
        .when(Error::is_retryable)
        .notify(|err, after| {
            tracing::debug!("telemetry upload failed, retrying in {:?}: {}", after, err);
        })
        .await;
    match result {
        Ok(()) => tracing::trace!("delivered {} telemetry items", count),
        Err(err) => tracing::warn!("dropping {} telemetry items: {}", count, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Data, RemoteDependencyData};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn envelope(name: &str) -> Envelope {
        Envelope {
            name: name.into(),
            time: "2020-06-21T10:40:00.000Z".into(),
            sample_rate: Some(100.0),
            i_key: None,
            tags: None,
            data: Some(Data::RemoteDependency(RemoteDependencyData::default())),
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        batches: StdMutex<Vec<usize>>,
    }

    #[async_trait]
    impl TelemetrySink for RecordingSink {
        async fn transmit(&self, items: Vec<Envelope>) -> Result<(), Error> {
            self.batches.lock().unwrap().push(items.len());
            Ok(())
        }
    }

    struct FlakySink {
        failures_left: AtomicUsize,
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl TelemetrySink for FlakySink {
        async fn transmit(&self, items: Vec<Envelope>) -> Result<(), Error> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok()
            {
                return Err(Error::UploadRetryable("503".into()));
            }
            self.delivered.fetch_add(items.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    struct RejectingSink;

    #[async_trait]
    impl TelemetrySink for RejectingSink {
        async fn transmit(&self, _items: Vec<Envelope>) -> Result<(), Error> {
            Err(Error::Upload("400: No retry possible".into()))
        }
    }

    #[tokio::test]
    async fn flush_delivers_queued_items() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = DeliveryPipeline::start(sink.clone(), Duration::from_secs(60), 100, 0);
        pipeline.enqueue(envelope("a"));
        pipeline.enqueue(envelope("b"));
        pipeline.flush().await;
        assert_eq!(vec![2], *sink.batches.lock().unwrap());
    }

    #[tokio::test]
    async fn full_batch_flushes_without_ticker() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = DeliveryPipeline::start(sink.clone(), Duration::from_secs(60), 2, 0);
        pipeline.enqueue(envelope("a"));
        pipeline.enqueue(envelope("b"));
        // The size-triggered flush happens on the worker; flush() is only used as a barrier.
        pipeline.flush().await;
        assert_eq!(2, *sink.batches.lock().unwrap().first().unwrap());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let sink = Arc::new(FlakySink {
            failures_left: AtomicUsize::new(2),
            delivered: AtomicUsize::new(0),
        });
        let pipeline = DeliveryPipeline::start(sink.clone(), Duration::from_secs(60), 100, 5);
        pipeline.enqueue(envelope("a"));
        pipeline.flush().await;
        assert_eq!(1, sink.delivered.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn permanent_failures_drop_the_batch_without_hanging() {
        let pipeline =
            DeliveryPipeline::start(Arc::new(RejectingSink), Duration::from_secs(60), 100, 3);
        pipeline.enqueue(envelope("a"));
        pipeline.flush().await;
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_does_not_panic() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline = DeliveryPipeline::start(sink, Duration::from_secs(60), 100, 0);
        pipeline.shutdown().await;
        pipeline.enqueue(envelope("late"));
    }
}
