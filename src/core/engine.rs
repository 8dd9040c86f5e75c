// Per-container engine task: exclusive owner of the container, executing
// requests strictly in arrival order. Each request carries its own reply
// channel, so every caller suspends once and resumes once.
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::core::container::{Container, ContainerInfo};
use crate::core::error::Error;
use crate::core::key::Key;
use crate::core::op::{Op, OpOutcome};

const REQUEST_QUEUE_DEPTH: usize = 32;

pub enum Request {
    Execute {
        table: String,
        op: Op,
        reply: oneshot::Sender<Result<OpOutcome, Error>>,
    },
    GetAll {
        table: String,
        reply: oneshot::Sender<Result<Vec<Value>, Error>>,
    },
    CursorNext {
        table: String,
        after: Option<Key>,
        reply: oneshot::Sender<Result<Option<(Key, Value)>, Error>>,
    },
    Info {
        reply: oneshot::Sender<ContainerInfo>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Spawn the engine task for an opened container. The task exits when the
/// last sender is dropped or a shutdown request arrives; either way the
/// container (and its file lock) is released before the task finishes.
pub fn spawn(container: Container) -> mpsc::Sender<Request> {
    let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    tokio::spawn(run(container, rx));
    tx
}

async fn run(mut container: Container, mut rx: mpsc::Receiver<Request>) {
    let mut shutdown_ack = None;
    while let Some(request) = rx.recv().await {
        match request {
            Request::Execute { table, op, reply } => {
                let result = container.execute(&table, op);
                if let Err(err) = &result {
                    tracing::warn!(table = %table, error = %err, "operation failed");
                }
                let _ = reply.send(result);
            }
            Request::GetAll { table, reply } => {
                let _ = reply.send(container.get_all(&table));
            }
            Request::CursorNext {
                table,
                after,
                reply,
            } => {
                let _ = reply.send(container.next_after(&table, after.as_ref()));
            }
            Request::Info { reply } => {
                let _ = reply.send(container.info());
            }
            Request::Shutdown { reply } => {
                shutdown_ack = Some(reply);
                break;
            }
        }
    }

    let path = container.path().to_path_buf();
    drop(container);
    if let Some(ack) = shutdown_ack {
        let _ = ack.send(());
    }
    tracing::debug!(path = %path.display(), "engine stopped");
}
