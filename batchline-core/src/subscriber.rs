//! The batched event subscription pipeline.
//!
//! Raw inputs flow through three stages, each a single task, connected by
//! bounded channels:
//!
//! ```text
//! source ──▶ decode ──▶ batch ──▶ dispatch ──▶ consumer sink
//! ```
//!
//! The decode stage filters and decodes one input at a time; the batch stage
//! groups jobs into size- and time-bounded batches; the dispatch stage
//! partitions each batch by originating sender, drops partitions of
//! superseded senders, and delivers the current sender's partition to the
//! sink — an ordered list of decoded events plus a resumable position, or a
//! single error. Every queue is bounded, so a slow sink suspends the source's
//! delivery calls rather than buffering without limit.
//!
//! Shutdown is drain-based: [`Pipeline::complete`] closes the input, lets
//! everything already accepted flow through in order, and resolves once the
//! dispatch stage has gone idle.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    time::{Duration, Instant, sleep_until},
};

use crate::{
    consumer::{EventConsumer, EventSink, SubscriberError},
    event::{DecodeError, Envelope, EventDecoder, StoredEvent},
    source::{EventSource, EventSubscription, SenderBinding, SenderId},
};

/// Floor applied to the consumer-supplied batch delay.
const MIN_BATCH_DELAY: Duration = Duration::from_millis(100);

/// Error returned when feeding a pipeline that is completing or drained.
#[derive(Clone, Copy, Debug, Error)]
#[error("subscriber no longer accepts input")]
pub struct Closed;

/// The unit of work flowing through the pipeline.
///
/// Each field is written by exactly one stage before the job moves on:
/// `sender` and either `stored` or `fault` at the entry point, `interested`
/// and `envelope` (or a decode `fault`) in the decode stage. Moves through
/// the channels enforce the single-writer discipline.
struct Job<E> {
    sender: SenderId,
    stored: Option<StoredEvent>,
    envelope: Option<Envelope<E>>,
    fault: Option<SubscriberError>,
    interested: bool,
}

impl<E> Job<E> {
    fn event(sender: SenderId, stored: StoredEvent) -> Self {
        Self {
            sender,
            stored: Some(stored),
            envelope: None,
            fault: None,
            interested: false,
        }
    }

    fn failed(sender: SenderId, error: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            sender,
            stored: None,
            envelope: None,
            fault: Some(SubscriberError::Source(error)),
            interested: false,
        }
    }
}

type Batch<E> = Vec<Job<E>>;

/// Input side of a [`Pipeline`], handed to an event source.
///
/// Both calls resolve only once the decode stage has accepted the job; while
/// its bounded queue is full the caller stays suspended, which is how
/// backpressure propagates from a slow consumer all the way to the source's
/// upstream reads.
pub struct SubscriberHandle<E> {
    job_tx: Arc<Mutex<Option<mpsc::Sender<Job<E>>>>>,
}

impl<E> Clone for SubscriberHandle<E> {
    fn clone(&self) -> Self {
        Self {
            job_tx: Arc::clone(&self.job_tx),
        }
    }
}

impl<E> SubscriberHandle<E> {
    /// Feed one observed event into the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] once [`Pipeline::complete`] has been requested.
    pub async fn on_event(&self, sender: SenderId, stored: StoredEvent) -> Result<(), Closed> {
        self.send(Job::event(sender, stored)).await
    }

    /// Feed one source-reported error into the pipeline.
    ///
    /// The error bypasses decoding and is attributed to `sender` like any
    /// other job, so a failure on a superseded subscription cannot abort the
    /// live one.
    ///
    /// # Errors
    ///
    /// Returns [`Closed`] once [`Pipeline::complete`] has been requested.
    pub async fn on_error(
        &self,
        sender: SenderId,
        error: Box<dyn std::error::Error + Send + Sync>,
    ) -> Result<(), Closed> {
        self.send(Job::failed(sender, error)).await
    }

    async fn send(&self, job: Job<E>) -> Result<(), Closed> {
        let tx = {
            let guard = self.job_tx.lock().expect("subscriber input lock poisoned");
            guard.clone()
        };
        match tx {
            Some(tx) => tx.send(job).await.map_err(|_| Closed),
            None => Err(Closed),
        }
    }

    fn close(&self) {
        self.job_tx
            .lock()
            .expect("subscriber input lock poisoned")
            .take();
    }
}

/// The staged decode → batch → dispatch pipeline.
///
/// Spawned unbound: until [`bind`](Self::bind) establishes a current sender,
/// every delivered job is treated as stale and discarded. Most callers want
/// [`BatchSubscriber::subscribe`], which wires a pipeline to a source and
/// binds it in one step.
pub struct Pipeline<E> {
    input: SubscriberHandle<E>,
    binding: SenderBinding,
    drained: watch::Receiver<bool>,
}

impl<E: Send + 'static> Pipeline<E> {
    /// Spawn the pipeline's stage tasks.
    ///
    /// The decode queue holds `batch_size` jobs (clamped to at least 1) and
    /// the stage hands decoded jobs to the batcher through a queue of twice
    /// that, so decoding keeps running while a full batch drains downstream.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn spawn<D, C, S>(decoder: D, consumer: C, sink: S) -> Self
    where
        D: EventDecoder<Event = E>,
        C: EventConsumer,
        S: EventSink<Event = E>,
    {
        let batch_size = consumer.batch_size().max(1);
        let batch_delay = consumer.batch_delay().max(MIN_BATCH_DELAY);

        let (job_tx, job_rx) = mpsc::channel(batch_size);
        let (decoded_tx, decoded_rx) = mpsc::channel(batch_size * 2);
        let (batch_tx, batch_rx) = mpsc::channel(2);
        let (drained_tx, drained_rx) = watch::channel(false);
        let binding = SenderBinding::new();

        tokio::spawn(decode_stage(decoder, consumer, job_rx, decoded_tx));
        tokio::spawn(batch_stage(batch_size, batch_delay, decoded_rx, batch_tx));
        tokio::spawn(dispatch_stage(binding.clone(), sink, batch_rx, drained_tx));

        Self {
            input: SubscriberHandle {
                job_tx: Arc::new(Mutex::new(Some(job_tx))),
            },
            binding,
            drained: drained_rx,
        }
    }

    /// A handle feeding this pipeline, for registration with a source.
    #[must_use]
    pub fn handle(&self) -> SubscriberHandle<E> {
        self.input.clone()
    }

    /// Bind the current sender, superseding any previous one.
    ///
    /// Jobs from previously bound senders still in flight are discarded by
    /// the dispatch stage rather than delivered.
    pub fn bind(&self, sender: SenderId) {
        self.binding.bind(sender);
    }

    /// The currently bound sender, if any.
    #[must_use]
    pub fn sender(&self) -> Option<SenderId> {
        self.binding.current()
    }

    /// Request graceful shutdown and wait for the drain to finish.
    ///
    /// Closes the input — further [`SubscriberHandle`] calls return
    /// [`Closed`] — while everything already accepted continues through the
    /// batch and dispatch stages in order. Resolves once the dispatch stage
    /// has delivered the last in-flight batch. Idempotent.
    pub async fn complete(&self) {
        self.input.close();
        let mut drained = self.drained.clone();
        if drained.wait_for(|drained| *drained).await.is_err() {
            tracing::warn!("dispatch stage stopped without signalling drain");
        }
    }
}

/// Applies the interest predicate, then decodes.
///
/// One job at a time, in arrival order. Decode failures never escape: an
/// unknown kind leaves the job empty (dropped downstream, position still
/// counts), anything else becomes the job's fault for per-sender attribution
/// in the dispatch stage.
async fn decode_stage<D, C, E>(
    decoder: D,
    consumer: C,
    mut jobs: mpsc::Receiver<Job<E>>,
    decoded: mpsc::Sender<Job<E>>,
) where
    D: EventDecoder<Event = E>,
    C: EventConsumer,
    E: Send + 'static,
{
    while let Some(mut job) = jobs.recv().await {
        if let Some(stored) = &job.stored {
            job.interested = consumer.handles(stored);
            if job.interested {
                match decoder.decode(stored) {
                    Ok(event) => {
                        job.envelope = Some(Envelope {
                            event,
                            position: stored.position.clone(),
                            stream_number: stored.stream_number,
                        });
                    }
                    Err(DecodeError::UnknownKind { kind, .. }) => {
                        tracing::trace!(%kind, "no known mapping, skipping event");
                    }
                    Err(error) => {
                        job.fault = Some(SubscriberError::Decode(error));
                    }
                }
            }
        }
        if decoded.send(job).await.is_err() {
            break;
        }
    }
}

/// Groups jobs into batches bounded by size and delay.
///
/// A window opens when its first job arrives and closes on whichever comes
/// first: the batch reaching `batch_size` or `batch_delay` elapsing. An
/// empty window never fires, so no empty batches are emitted. On input
/// close, the partial batch is flushed before the stage exits.
async fn batch_stage<E: Send>(
    batch_size: usize,
    batch_delay: Duration,
    mut jobs: mpsc::Receiver<Job<E>>,
    batches: mpsc::Sender<Batch<E>>,
) {
    let mut pending: Batch<E> = Vec::with_capacity(batch_size);
    'collect: loop {
        let Some(first) = jobs.recv().await else {
            break;
        };
        let deadline = Instant::now() + batch_delay;
        pending.push(first);

        while pending.len() < batch_size {
            tokio::select! {
                job = jobs.recv() => match job {
                    Some(job) => pending.push(job),
                    None => break 'collect,
                },
                () = sleep_until(deadline) => break,
            }
        }

        tracing::trace!(jobs = pending.len(), "emitting batch");
        let batch = std::mem::replace(&mut pending, Vec::with_capacity(batch_size));
        if batches.send(batch).await.is_err() {
            return;
        }
    }

    if !pending.is_empty() {
        tracing::trace!(jobs = pending.len(), "flushing final batch");
        let _ = batches.send(pending).await;
    }
}

/// Delivers batches to the sink, one at a time.
///
/// Partitions each batch by sender, preserving arrival order, discards
/// partitions of superseded senders, and waits for each sink call to resolve
/// before touching the next batch.
async fn dispatch_stage<E, S>(
    binding: SenderBinding,
    sink: S,
    mut batches: mpsc::Receiver<Batch<E>>,
    drained: watch::Sender<bool>,
) where
    S: EventSink<Event = E>,
    E: Send + 'static,
{
    while let Some(batch) = batches.recv().await {
        for (sender, group) in partition_by_sender(batch) {
            if binding.is_current(sender) {
                deliver(&sink, group).await;
            } else {
                tracing::debug!(?sender, jobs = group.len(), "discarding stale partition");
            }
        }
    }
    tracing::debug!("pipeline drained");
    let _ = drained.send(true);
}

/// Group a batch's jobs by sender, keeping arrival order within each group
/// and ordering groups by first appearance.
fn partition_by_sender<E>(batch: Batch<E>) -> Vec<(SenderId, Batch<E>)> {
    let mut groups: Vec<(SenderId, Batch<E>)> = Vec::new();
    for job in batch {
        match groups.iter_mut().find(|(sender, _)| *sender == job.sender) {
            Some((_, group)) => group.push(job),
            None => groups.push((job.sender, vec![job])),
        }
    }
    groups
}

/// Deliver one sender's partition: the first fault in arrival order wins and
/// suppresses the partition's events; otherwise the decoded envelopes go out
/// with the last job's position, even when every event was filtered or had
/// no known mapping — the checkpoint must advance regardless.
async fn deliver<E, S>(sink: &S, mut group: Batch<E>)
where
    S: EventSink<Event = E>,
{
    if let Some(fault) = group.iter_mut().find_map(|job| job.fault.take()) {
        sink.on_error(fault).await;
        return;
    }

    let Some(position) = group
        .last()
        .and_then(|job| job.stored.as_ref())
        .map(|stored| stored.position.clone())
    else {
        return;
    };

    let events: Vec<Envelope<E>> = group.into_iter().filter_map(|job| job.envelope).collect();
    sink.on_events(events, position).await;
}

/// A pipeline wired to one live source subscription.
///
/// This is the front object a consumer host interacts with: it subscribes
/// the pipeline to a source, keeps the subscription handle for pass-through
/// control calls, and tracks which sender is current so resubscription
/// leaves stale in-flight jobs undelivered.
///
/// ```ignore
/// let subscriber = BatchSubscriber::subscribe(&source, decoder, consumer, sink);
///
/// // ... events flow until shutdown:
/// subscriber.complete().await;
/// subscriber.unsubscribe();
/// ```
pub struct BatchSubscriber<E, Sub> {
    pipeline: Pipeline<E>,
    subscription: Sub,
}

impl<E, Sub> BatchSubscriber<E, Sub>
where
    E: Send + 'static,
    Sub: EventSubscription,
{
    /// Spawn a pipeline, subscribe it to `source`, and bind the
    /// subscription's sender.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    #[must_use]
    pub fn subscribe<Src, D, C, S>(source: &Src, decoder: D, consumer: C, sink: S) -> Self
    where
        Src: EventSource<Subscription = Sub>,
        D: EventDecoder<Event = E>,
        C: EventConsumer,
        S: EventSink<Event = E>,
    {
        let pipeline = Pipeline::spawn(decoder, consumer, sink);
        let subscription = source.subscribe(pipeline.handle());
        pipeline.bind(subscription.sender());
        tracing::debug!(sender = ?subscription.sender(), "batch subscriber bound");
        Self {
            pipeline,
            subscription,
        }
    }

    /// Identity of the live subscription.
    #[must_use]
    pub fn sender(&self) -> SenderId {
        self.subscription.sender()
    }

    /// Nudge the source to re-check for new data. Pass-through.
    pub fn wake_up(&self) {
        self.subscription.wake_up();
    }

    /// Release the source subscription. Pass-through.
    pub fn unsubscribe(&self) {
        self.subscription.unsubscribe();
    }

    /// Drop the current subscription and establish a fresh one.
    ///
    /// The new subscription gets a new sender, which becomes the bound one;
    /// jobs from the old subscription still in flight are discarded by the
    /// dispatch stage instead of reaching the sink.
    pub fn resubscribe<Src>(&mut self, source: &Src)
    where
        Src: EventSource<Subscription = Sub>,
    {
        self.subscription.unsubscribe();
        let subscription = source.subscribe(self.pipeline.handle());
        self.pipeline.bind(subscription.sender());
        tracing::debug!(sender = ?subscription.sender(), "batch subscriber rebound");
        self.subscription = subscription;
    }

    /// A handle feeding the underlying pipeline.
    #[must_use]
    pub fn handle(&self) -> SubscriberHandle<E> {
        self.pipeline.handle()
    }

    /// Request graceful shutdown and wait for the drain to finish.
    ///
    /// See [`Pipeline::complete`].
    pub async fn complete(&self) {
        self.pipeline.complete().await;
    }
}
