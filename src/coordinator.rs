//! Single-owner coordinator task.
//!
//! The coordinator owns a [`Batcher`] and serialises every subscribe,
//! delivery, cancellation and timer event through one mailbox. Sources talk
//! to it through a [`SourceLink`]; consumers receive each merged cycle as an
//! immutable [`Batch`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};

use crate::batch::{Batcher, INITIAL_DEMAND, Receipt};
use crate::entity::Entity;
use crate::filter::FilterChain;
use crate::merge::{SourceId, Snapshot};

/// One emitted cycle. Shared read-only between consumers.
pub type Batch = Arc<[Entity]>;

/// How emitted batches are spread over attached consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dispatcher {
    /// Every consumer receives every batch.
    #[default]
    Broadcast,
    /// Each batch goes to one consumer, round-robin.
    Partition,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Length of the batch window opened by the first delivery.
    pub timeout: Duration,
    pub dispatcher: Dispatcher,
    pub mailbox_capacity: usize,
    /// Batches buffered per consumer before it is considered lagging.
    pub consumer_capacity: usize,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            dispatcher: Dispatcher::Broadcast,
            mailbox_capacity: 256,
            consumer_capacity: 4,
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("coordinator is no longer running")]
    Stopped,
    #[error("merge cycle failed: {0:#}")]
    Cycle(anyhow::Error),
}

#[derive(Debug)]
enum Message {
    Subscribe {
        source: SourceId,
        initial_demand: usize,
        demand: mpsc::UnboundedSender<usize>,
    },
    Deliver {
        source: SourceId,
        events: Vec<Snapshot>,
    },
    Cancel {
        source: SourceId,
        reason: String,
    },
    Shutdown,
}

/// Cloneable front door to a running [`Coordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Message>,
    next_source: Arc<AtomicU64>,
}

impl CoordinatorHandle {
    /// Attaches a new source. The coordinator grants it one unit of demand
    /// straight away.
    pub async fn subscribe(&self) -> Result<SourceLink, CoordinatorError> {
        self.subscribe_with_demand(INITIAL_DEMAND).await
    }

    pub async fn subscribe_with_demand(
        &self,
        initial_demand: usize,
    ) -> Result<SourceLink, CoordinatorError> {
        let source = SourceId(self.next_source.fetch_add(1, Ordering::Relaxed));
        let (demand_tx, demand_rx) = mpsc::unbounded_channel();
        self.send(Message::Subscribe {
            source,
            initial_demand,
            demand: demand_tx,
        })
        .await?;

        Ok(SourceLink {
            source,
            demand: demand_rx,
            tx: self.tx.clone(),
        })
    }

    /// Cancels a source from the coordinator side.
    pub async fn cancel(
        &self,
        source: SourceId,
        reason: impl Into<String>,
    ) -> Result<(), CoordinatorError> {
        self.send(Message::Cancel {
            source,
            reason: reason.into(),
        })
        .await
    }

    /// Stops the coordinator after the messages already queued. A pending
    /// batch window is dropped without emitting.
    pub async fn shutdown(&self) -> Result<(), CoordinatorError> {
        self.send(Message::Shutdown).await
    }

    async fn send(&self, message: Message) -> Result<(), CoordinatorError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| CoordinatorError::Stopped)
    }
}

/// The source side of a subscription.
#[derive(Debug)]
pub struct SourceLink {
    source: SourceId,
    demand: mpsc::UnboundedReceiver<usize>,
    tx: mpsc::Sender<Message>,
}

impl SourceLink {
    pub fn id(&self) -> SourceId {
        self.source
    }

    /// Waits for the next demand grant. `None` means the coordinator has
    /// cancelled this source or stopped.
    pub async fn next_demand(&mut self) -> Option<usize> {
        self.demand.recv().await
    }

    /// Pushes snapshots to the coordinator. Callers should not send more
    /// snapshots than they have been granted.
    pub async fn deliver(&self, events: Vec<Snapshot>) -> Result<(), CoordinatorError> {
        self.tx
            .send(Message::Deliver {
                source: self.source,
                events,
            })
            .await
            .map_err(|_| CoordinatorError::Stopped)
    }

    /// Detaches this source. Its last snapshot stops contributing.
    pub async fn disconnect(self, reason: &str) -> Result<(), CoordinatorError> {
        self.tx
            .send(Message::Cancel {
                source: self.source,
                reason: reason.to_string(),
            })
            .await
            .map_err(|_| CoordinatorError::Stopped)
    }
}

pub struct Coordinator {
    batcher: Batcher,
    settings: CoordinatorSettings,
    mailbox: mpsc::Receiver<Message>,
    links: HashMap<SourceId, mpsc::UnboundedSender<usize>>,
    consumers: Vec<mpsc::Sender<Batch>>,
    next_partition: usize,
}

impl Coordinator {
    pub fn new(settings: CoordinatorSettings, filters: FilterChain) -> (Self, CoordinatorHandle) {
        let (tx, mailbox) = mpsc::channel(settings.mailbox_capacity.max(1));
        let coordinator = Self {
            batcher: Batcher::new(filters),
            settings,
            mailbox,
            links: HashMap::new(),
            consumers: Vec::new(),
            next_partition: 0,
        };
        let handle = CoordinatorHandle {
            tx,
            next_source: Arc::new(AtomicU64::new(1)),
        };
        (coordinator, handle)
    }

    /// Registers a downstream consumer. Must be called before [`run`](Self::run).
    pub fn attach_consumer(&mut self) -> mpsc::Receiver<Batch> {
        let (tx, rx) = mpsc::channel(self.settings.consumer_capacity.max(1));
        self.consumers.push(tx);
        rx
    }

    /// Processes messages until shutdown or until every handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::Cycle`] if the filter chain fails. The
    /// cycle's output is discarded rather than emitted partially filtered.
    #[tracing::instrument(
        name = "coordinator",
        skip(self),
        fields(
            timeout_ms = self.settings.timeout.as_millis() as u64,
            dispatcher = ?self.settings.dispatcher,
            consumers = self.consumers.len(),
        )
    )]
    pub async fn run(mut self) -> Result<(), CoordinatorError> {
        info!("Coordinator started");
        let mut timer: Option<Pin<Box<Sleep>>> = None;

        loop {
            tokio::select! {
                message = self.mailbox.recv() => match message {
                    Some(Message::Shutdown) | None => break,
                    Some(message) => self.handle(message, &mut timer),
                },
                () = wait(&mut timer) => {
                    timer = None;
                    self.on_timer()?;
                }
            }
        }

        if timer.is_some() {
            debug!("Dropping pending batch timer");
        }
        info!(violations = self.batcher.violations(), "Coordinator stopped");
        Ok(())
    }

    fn handle(&mut self, message: Message, timer: &mut Option<Pin<Box<Sleep>>>) {
        match message {
            Message::Subscribe {
                source,
                initial_demand,
                demand,
            } => {
                let grant = self.batcher.subscribe_with_demand(source, initial_demand);
                self.links.insert(source, demand);
                self.grant(source, grant);
            }
            Message::Deliver { source, events } => match self.batcher.receive(source, events) {
                Receipt::ArmTimer => {
                    debug!(source = %source, timeout_ms = self.settings.timeout.as_millis() as u64, "Batch window opened");
                    *timer = Some(Box::pin(tokio::time::sleep(self.settings.timeout)));
                }
                Receipt::Batched | Receipt::Ignored => {}
            },
            Message::Cancel { source, reason } => {
                self.batcher.cancel(source, &reason);
                // dropping the sender ends the source's demand stream
                self.links.remove(&source);
            }
            Message::Shutdown => {}
        }
    }

    fn on_timer(&mut self) -> Result<(), CoordinatorError> {
        let cycle = match self.batcher.fire() {
            Ok(Some(cycle)) => cycle,
            Ok(None) => return Ok(()),
            Err(e) => {
                error!(error = %format!("{e:#}"), "Merge cycle failed");
                return Err(CoordinatorError::Cycle(e));
            }
        };

        self.emit(Batch::from(cycle.entities));

        for source in cycle.regrants {
            self.grant(source, INITIAL_DEMAND);
        }
        Ok(())
    }

    fn grant(&mut self, source: SourceId, demand: usize) {
        let delivered = self
            .links
            .get(&source)
            .is_some_and(|link| link.send(demand).is_ok());
        if !delivered {
            warn!(source = %source, "Source is gone; cancelling");
            self.links.remove(&source);
            self.batcher.cancel(source, "demand channel closed");
        }
    }

    fn emit(&mut self, batch: Batch) {
        if self.consumers.is_empty() {
            debug!(entities = batch.len(), "No consumers attached; batch dropped");
            return;
        }

        match self.settings.dispatcher {
            Dispatcher::Broadcast => {
                self.consumers
                    .retain(|consumer| offer(consumer, batch.clone()));
            }
            Dispatcher::Partition => {
                while !self.consumers.is_empty() {
                    let slot = self.next_partition % self.consumers.len();
                    if offer(&self.consumers[slot], batch.clone()) {
                        self.next_partition = slot + 1;
                        break;
                    }
                    self.consumers.remove(slot);
                }
            }
        }
    }
}

/// Hands `batch` to one consumer without waiting. Returns `false` once the
/// consumer has gone away; a full consumer skips this batch but stays
/// attached.
fn offer(consumer: &mpsc::Sender<Batch>, batch: Batch) -> bool {
    match consumer.try_send(batch) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Consumer is lagging; skipping batch");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            info!("Consumer closed; detaching");
            false
        }
    }
}

async fn wait(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}
