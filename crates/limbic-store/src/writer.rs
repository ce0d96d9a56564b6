//! Single-writer queue.
//!
//! One dedicated thread owns the writing [`MemoryStore`] and applies jobs in
//! submission order, one transaction at a time. Callers on any task await a
//! oneshot reply bounded by the configured write timeout.

use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use limbic_core::{MemoryTurn, StorageConfig, TurnId, TurnRecord};

use crate::error::{Result, StoreError};
use crate::retry::{RetryPolicy, retry_blocking};
use crate::store::MemoryStore;

enum WriteOp {
    Turn(Box<TurnRecord>),
    Embedding {
        turn_id: TurnId,
        model: String,
        vector: Vec<f32>,
    },
    Checkpoint,
}

enum WriteReply {
    Turn(MemoryTurn),
    Done,
}

struct Job {
    op: WriteOp,
    reply: oneshot::Sender<Result<WriteReply>>,
}

pub struct WriteQueue {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    write_timeout: Duration,
}

impl WriteQueue {
    pub fn spawn(store: MemoryStore, cfg: &StorageConfig) -> Result<Self> {
        let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));
        let policy = RetryPolicy::from(&cfg.retry);
        let worker = std::thread::Builder::new()
            .name("limbic-writer".into())
            .spawn(move || run(store, policy, rx))?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            write_timeout: Duration::from_millis(cfg.write_timeout_ms),
        })
    }

    /// Write one turn atomically, retrying transient failures. A timeout
    /// does not cancel the job; it may still commit afterwards.
    pub async fn write_turn(&self, record: TurnRecord) -> Result<MemoryTurn> {
        match self.submit(WriteOp::Turn(Box::new(record))).await? {
            WriteReply::Turn(turn) => Ok(turn),
            WriteReply::Done => Err(StoreError::InvalidData("unexpected writer reply".into())),
        }
    }

    pub async fn put_embedding(&self, turn_id: TurnId, model: String, vector: Vec<f32>) -> Result<()> {
        self.submit(WriteOp::Embedding {
            turn_id,
            model,
            vector,
        })
        .await
        .map(|_| ())
    }

    pub async fn checkpoint(&self) -> Result<()> {
        self.submit(WriteOp::Checkpoint).await.map(|_| ())
    }

    async fn submit(&self, op: WriteOp) -> Result<WriteReply> {
        let tx = self
            .tx
            .lock()
            .map_err(|_| StoreError::QueueClosed)?
            .clone()
            .ok_or(StoreError::QueueClosed)?;
        let (reply, rx) = oneshot::channel();

        let roundtrip = async {
            tx.send(Job { op, reply })
                .await
                .map_err(|_| StoreError::QueueClosed)?;
            rx.await.map_err(|_| StoreError::QueueClosed)?
        };
        tokio::time::timeout(self.write_timeout, roundtrip)
            .await
            .map_err(|_| StoreError::Timeout("write"))?
    }

    /// Stop accepting jobs, let the worker drain what is queued, and wait
    /// for it to exit. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
                .map_err(|_| StoreError::Io(std::io::Error::other("writer thread panicked")))?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().map(|tx| tx.is_none()).unwrap_or(true)
    }
}

fn run(store: MemoryStore, policy: RetryPolicy, mut rx: mpsc::Receiver<Job>) {
    let mut applied = 0u64;
    while let Some(job) = rx.blocking_recv() {
        let result = apply(&store, &policy, job.op);
        if let Err(e) = &result {
            error!(error = %e, "write job failed");
        }
        applied += 1;
        // Caller may have timed out and gone away
        let _ = job.reply.send(result);
    }
    if let Err(e) = store.checkpoint() {
        debug!(error = %e, "shutdown checkpoint skipped");
    }
    info!(applied, "write queue drained");
}

fn apply(store: &MemoryStore, policy: &RetryPolicy, op: WriteOp) -> Result<WriteReply> {
    match op {
        WriteOp::Turn(record) => {
            let turn = retry_blocking(policy, "write_turn", StoreError::is_transient, |_| {
                store.write_turn(&record)
            })?;
            debug!(turn_id = %turn.turn_id, "turn committed");
            Ok(WriteReply::Turn(turn))
        }
        WriteOp::Embedding {
            turn_id,
            model,
            vector,
        } => {
            retry_blocking(policy, "put_embedding", StoreError::is_transient, |_| {
                store.put_embedding(&turn_id, &model, &vector)
            })?;
            Ok(WriteReply::Done)
        }
        WriteOp::Checkpoint => {
            store.checkpoint()?;
            Ok(WriteReply::Done)
        }
    }
}
