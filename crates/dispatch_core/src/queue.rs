//! Durable offer-task queue.
//!
//! One task per dispatch. The pending set lives in sled so tasks survive a
//! process crash; the in-process channel hands each task to exactly one
//! worker, which is the exclusive lease. Completion removes the persisted
//! entry; anything still persisted at startup is re-enqueued (at-least-once
//! redelivery, the record's conditional writes make replays no-ops).

use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::model::DispatchId;
use crate::store::StoreResult;

const QUEUE_TREE: &str = "offer_queue";

pub struct OfferQueue {
    pending: sled::Tree,
    tx: mpsc::UnboundedSender<DispatchId>,
    rx: Mutex<mpsc::UnboundedReceiver<DispatchId>>,
}

impl OfferQueue {
    /// Open the queue on the shared database and re-enqueue every task
    /// that was pending when the previous process stopped.
    pub fn open(db: &sled::Db) -> StoreResult<Self> {
        let pending = db.open_tree(QUEUE_TREE)?;
        let (tx, rx) = mpsc::unbounded_channel();

        for entry in pending.iter() {
            let (key, _) = entry?;
            let raw = String::from_utf8_lossy(&key);
            match DispatchId::parse(&raw) {
                Some(id) => {
                    // Receiver is held right here; the send cannot fail.
                    let _ = tx.send(id);
                }
                None => {
                    tracing::warn!(key = %raw, "dropping unparseable queue entry");
                    pending.remove(&key)?;
                }
            }
        }

        Ok(Self {
            pending,
            tx,
            rx: Mutex::new(rx),
        })
    }

    /// Persist and hand the task to the worker pool.
    pub fn enqueue(&self, id: &DispatchId) -> StoreResult<()> {
        self.pending.insert(id.to_string().as_bytes(), &[])?;
        self.pending.flush()?;
        if self.tx.send(*id).is_err() {
            // Workers are gone; the persisted entry is redelivered on the
            // next startup.
            tracing::debug!(dispatch = %id, "no live workers, task parked for restart");
        }
        Ok(())
    }

    /// Take the next task. Each id is delivered to exactly one caller.
    /// Returns `None` once the queue is closed.
    pub async fn next(&self) -> Option<DispatchId> {
        self.rx.lock().await.recv().await
    }

    /// Drop the persisted entry after the task ran to a terminal state.
    pub fn complete(&self, id: &DispatchId) -> StoreResult<()> {
        self.pending.remove(id.to_string().as_bytes())?;
        Ok(())
    }

    /// Hand a failed task back to the pool; the persisted entry is still
    /// in place, so a crash in between loses nothing.
    pub fn redeliver(&self, id: &DispatchId) {
        if self.tx.send(*id).is_err() {
            tracing::debug!(dispatch = %id, "no live workers, task parked for restart");
        }
    }

    /// Number of persisted, not-yet-completed tasks.
    pub fn depth(&self) -> usize {
        self.pending.len()
    }
}
