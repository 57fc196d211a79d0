//! Uploads completed batches to the datalake destination.

use error_stack::{Result, ResultExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::batch::LedgerBatch;
use crate::codec;
use crate::datastore::DataStore;
use crate::error::ExportError;

/// Serializes, compresses and uploads batches, exactly once per key.
pub struct Uploader<D>
where
    D: DataStore,
{
    store: D,
}

impl<D> Uploader<D>
where
    D: DataStore + 'static,
{
    pub fn new(store: D) -> Self {
        Self { store }
    }

    /// Start consuming batches from the handoff.
    ///
    /// The task returns when the handoff is closed, or after draining the
    /// remaining batches once cancellation is observed.
    pub fn start(
        self,
        rx: mpsc::Receiver<LedgerBatch>,
        ct: CancellationToken,
    ) -> JoinHandle<Result<(), ExportError>> {
        tokio::spawn(self.do_loop(rx, ct))
    }

    async fn do_loop(
        self,
        mut rx: mpsc::Receiver<LedgerBatch>,
        ct: CancellationToken,
    ) -> Result<(), ExportError> {
        info!("starting uploader");

        loop {
            tokio::select! {
                biased;

                _ = ct.cancelled() => {
                    info!("uploader stopping, draining remaining batches");
                    while let Some(batch) = rx.recv().await {
                        let key = batch.key().to_string();
                        if let Err(err) = self.upload(batch).await {
                            // Keep draining: one bad object must not strand
                            // the batches already handed off.
                            warn!(key = %key, error = ?err, "failed to upload batch during shutdown");
                        }
                    }
                    info!("uploader stopped");
                    return Err(ExportError::Cancelled.into());
                }

                batch = rx.recv() => {
                    let Some(batch) = batch else {
                        info!("handoff closed, uploader done");
                        return Ok(());
                    };
                    let key = batch.key().to_string();
                    self.upload(batch)
                        .await
                        .attach_printable_lazy(|| format!("key: {}", key))?;
                }
            }
        }
    }

    /// Serialize, compress and upload a single batch.
    pub async fn upload(&self, batch: LedgerBatch) -> Result<(), ExportError> {
        let key = batch.key().to_string();
        info!(key = %key, ledgers = batch.ledger_count(), "uploading batch");

        let raw = codec::encode(&batch.into_data());
        let blob = codec::compress(&raw)?;

        let created = self
            .store
            .put_if_absent(&key, blob.into())
            .await
            .change_context(ExportError::Upload)?;

        if !created {
            info!(key = %key, "object already exists, skipping upload");
        }

        Ok(())
    }
}
