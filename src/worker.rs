//! Query dispatch: answer inline, or hand the record to background workers.
//!
//! In background mode records go through a bounded channel to a single
//! receive loop, which spawns one task per record while holding a
//! semaphore permit, so at most `server.workers` questions are answered
//! at once. A failed run is logged and the record stays pending; there is
//! no cancellation once a record is queued.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use pdf_rag_core::models::QueryRecord;

use crate::config::QueryMode;
use crate::pipeline::Pipeline;

const QUEUE_CAPACITY: usize = 256;

#[derive(Clone)]
pub enum QueryDispatcher {
    Inline,
    Background(mpsc::Sender<QueryRecord>),
}

impl QueryDispatcher {
    /// Build the dispatcher for `mode`. Background mode also spawns the
    /// worker loop and returns its handle.
    pub fn start(
        mode: QueryMode,
        pipeline: Arc<Pipeline>,
        workers: usize,
    ) -> (Self, Option<JoinHandle<()>>) {
        match mode {
            QueryMode::Inline => (QueryDispatcher::Inline, None),
            QueryMode::Background => {
                let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
                let handle = tokio::spawn(run_workers(pipeline, rx, workers));
                (QueryDispatcher::Background(tx), Some(handle))
            }
        }
    }

    /// Process a stored pending record.
    ///
    /// Inline: returns the completed record, or the pipeline error.
    /// Background: queues it and returns it unchanged (still pending).
    pub async fn dispatch(&self, pipeline: &Pipeline, record: QueryRecord) -> Result<QueryRecord> {
        match self {
            QueryDispatcher::Inline => pipeline.complete(record).await,
            QueryDispatcher::Background(tx) => {
                tx.send(record.clone())
                    .await
                    .map_err(|_| anyhow!("query worker has stopped"))?;
                Ok(record)
            }
        }
    }
}

async fn run_workers(pipeline: Arc<Pipeline>, mut rx: mpsc::Receiver<QueryRecord>, workers: usize) {
    let limit = Arc::new(Semaphore::new(workers.max(1)));

    while let Some(record) = rx.recv().await {
        let Ok(permit) = Arc::clone(&limit).acquire_owned().await else {
            break;
        };
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            let _permit = permit;
            let query_id = record.query_id.clone();
            let user_id = record.user_id.clone();
            match pipeline.complete(record).await {
                Ok(_) => debug!(user = %user_id, query_id = %query_id, "background query done"),
                Err(e) => warn!(
                    user = %user_id,
                    query_id = %query_id,
                    error = %e,
                    "background query failed; record left pending"
                ),
            }
        });
    }
    debug!("query queue closed");
}
