//! Write path from in-memory state to durable storage.
//!
//! Components serialize their state to JSON and hand it to a [`DurableMirror`].
//! An inline mirror writes before returning. A deferred mirror queues the blob
//! for a single writer task that performs the save on the blocking pool, so the
//! engine loop never waits on disk; writes stay in submission order and the
//! last snapshot wins.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::KeyValueStore;
use crate::error::PersistenceError;

/// Serialized list of restriction records.
pub const RESTRICTIONS_KEY: &str = "restrictions";
/// Serialized `Option<DateTime<Utc>>` of the focus countdown.
pub const FOCUS_END_KEY: &str = "focus_end_time";

/// A deferred write that the backend rejected.
#[derive(Debug)]
pub struct WriteFailure {
    pub key: String,
    pub error: PersistenceError,
}

struct WriteJob {
    key: String,
    blob: Vec<u8>,
}

#[derive(Clone)]
enum WriteMode {
    Inline,
    Deferred(mpsc::UnboundedSender<WriteJob>),
}

#[derive(Clone)]
pub struct DurableMirror {
    kv: Arc<dyn KeyValueStore>,
    mode: WriteMode,
}

impl DurableMirror {
    pub fn inline(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            mode: WriteMode::Inline,
        }
    }

    /// Spawn the writer task. Must be called inside a tokio runtime.
    ///
    /// `on_failure` runs on the blocking pool for every rejected write.
    pub fn deferred(
        kv: Arc<dyn KeyValueStore>,
        on_failure: impl Fn(WriteFailure) + Send + Sync + 'static,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteJob>();
        let on_failure = Arc::new(on_failure);
        let backend = kv.clone();
        let writer = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let backend = backend.clone();
                let on_failure = on_failure.clone();
                let joined = tokio::task::spawn_blocking(move || {
                    if let Err(error) = backend.save(&job.key, &job.blob) {
                        on_failure(WriteFailure {
                            key: job.key,
                            error,
                        });
                    }
                })
                .await;
                if let Err(e) = joined {
                    tracing::error!(error = %e, "durable write task failed to join");
                }
            }
            tracing::debug!("durable writer drained");
        });
        (
            Self {
                kv,
                mode: WriteMode::Deferred(tx),
            },
            writer,
        )
    }

    /// Read and decode `key`. Reads are always synchronous.
    pub fn load_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, PersistenceError> {
        let Some(blob) = self.kv.load(key)? else {
            return Ok(None);
        };
        serde_json::from_slice(&blob)
            .map(Some)
            .map_err(|source| PersistenceError::Codec {
                key: key.to_string(),
                source,
            })
    }

    /// Encode `value` and write it under `key`.
    ///
    /// For a deferred mirror `Ok` means the write was queued.
    pub fn save_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), PersistenceError> {
        let blob = serde_json::to_vec(value).map_err(|source| PersistenceError::Codec {
            key: key.to_string(),
            source,
        })?;
        match &self.mode {
            WriteMode::Inline => self.kv.save(key, &blob),
            WriteMode::Deferred(tx) => tx
                .send(WriteJob {
                    key: key.to_string(),
                    blob,
                })
                .map_err(|_| PersistenceError::Backend {
                    key: key.to_string(),
                    message: "durable writer has stopped".into(),
                }),
        }
    }
}
