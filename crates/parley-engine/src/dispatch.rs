use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use parley_core::{IdentityError, InboundEvent, ThreadId};

use crate::error::EngineError;
use crate::handler::ChatHandler;

/// Routes inbound events to one FIFO worker per thread.
///
/// [`dispatch`](Self::dispatch) is synchronous: an event's place in its
/// thread's queue is fixed the moment it is accepted, so turns on one thread
/// run in arrival order while different threads run concurrently. A worker
/// retires once its queue is empty.
pub struct TurnDispatcher {
    handler: Arc<ChatHandler>,
    queues: Arc<DashMap<ThreadId, UnboundedSender<InboundEvent>>>,
    turns: TaskTracker,
}

impl TurnDispatcher {
    pub fn new(handler: Arc<ChatHandler>) -> Self {
        Self {
            handler,
            queues: Arc::new(DashMap::new()),
            turns: TaskTracker::new(),
        }
    }

    /// Validate and enqueue an event. Malformed events are rejected here,
    /// before anything is spawned.
    pub fn dispatch(&self, event: InboundEvent) -> Result<ThreadId, IdentityError> {
        let thread_id = event.identity()?.thread_id;
        event.clean_text()?;

        let mut event = event;
        loop {
            match self.queues.entry(thread_id.clone()) {
                Entry::Occupied(entry) => match entry.get().send(event) {
                    Ok(()) => return Ok(thread_id),
                    // worker died without retiring; replace it
                    Err(mpsc::error::SendError(returned)) => {
                        entry.remove();
                        event = returned;
                    }
                },
                Entry::Vacant(entry) => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let _ = tx.send(event);
                    entry.insert(tx);
                    self.spawn_worker(thread_id.clone(), rx);
                    return Ok(thread_id);
                }
            }
        }
    }

    /// Threads with a live worker.
    pub fn active_threads(&self) -> usize {
        self.queues.len()
    }

    /// Wait for every queued turn to finish.
    pub async fn drain(&self) {
        self.turns.close();
        info!(pending = self.turns.len(), "waiting for in-flight turns");
        self.turns.wait().await;
    }

    fn spawn_worker(&self, thread_id: ThreadId, rx: UnboundedReceiver<InboundEvent>) {
        let handler = self.handler.clone();
        let queues = self.queues.clone();
        let _ = self.turns.spawn(run_queue(handler, queues, thread_id, rx));
    }
}

async fn run_queue(
    handler: Arc<ChatHandler>,
    queues: Arc<DashMap<ThreadId, UnboundedSender<InboundEvent>>>,
    thread_id: ThreadId,
    mut rx: UnboundedReceiver<InboundEvent>,
) {
    loop {
        let event = match rx.try_recv() {
            Ok(event) => event,
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {
                // Senders only push while holding this entry, so an empty
                // queue seen under it stays empty.
                if queues.remove_if(&thread_id, |_, _| rx.is_empty()).is_some() {
                    debug!(thread_id = %thread_id, "turn worker retired");
                    break;
                }
                continue;
            }
        };
        match handler.handle_event(event).await {
            Ok(outcome) => debug!(thread_id = %outcome.thread_id, delivered = outcome.delivered, "turn complete"),
            Err(EngineError::Identity(e)) => debug!(error = %e, "dropping malformed event"),
            Err(e) => error!(thread_id = %thread_id, error = %e, "turn failed"),
        }
    }
}
