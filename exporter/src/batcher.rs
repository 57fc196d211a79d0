//! Drives the ledger source across a range and groups ledgers into batches.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use error_stack::{Report, Result, ResultExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::batch::LedgerBatch;
use crate::codec::Ledger;
use crate::error::ExportError;
use crate::layout::ExportOptions;
use crate::source::{LedgerRange, LedgerSource, SourceResultExt};

/// Capacity of the handoff between the batcher and the uploader.
///
/// A single in-flight batch keeps backpressure on the source while still
/// letting the uploader drain one pending item on shutdown.
const HANDOFF_CAPACITY: usize = 1;

/// Groups ledgers into batches aligned to the datalake grid and emits each
/// completed batch on the handoff, in strictly increasing start order.
pub struct Batcher<S>
where
    S: LedgerSource,
{
    source: S,
    options: ExportOptions,
    pending: HashMap<String, LedgerBatch>,
}

impl<S> Batcher<S>
where
    S: LedgerSource + 'static,
{
    pub fn new(source: S, options: ExportOptions) -> Self {
        Self {
            source,
            options,
            pending: HashMap::new(),
        }
    }

    /// Start exporting `range`, returning the handoff receiver and the task
    /// handle.
    ///
    /// The handoff is closed exactly once, when the range is exhausted or
    /// cancellation is observed. The uploader relies on this close to
    /// terminate.
    pub fn start(
        self,
        range: LedgerRange,
        ct: CancellationToken,
    ) -> (
        mpsc::Receiver<LedgerBatch>,
        JoinHandle<Result<(), ExportError>>,
    ) {
        let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);
        let handle = tokio::spawn(self.do_loop(range, tx, ct));
        (rx, handle)
    }

    async fn do_loop(
        mut self,
        range: LedgerRange,
        tx: mpsc::Sender<LedgerBatch>,
        ct: CancellationToken,
    ) -> Result<(), ExportError> {
        info!(%range, "starting batcher");

        let mut next = range.start;
        while range.contains(next) {
            // Cancellation is checked before the blocking fetch, not before
            // the emit: one pending emit may be in flight at cancellation and
            // the uploader's drain consumes it.
            if ct.is_cancelled() {
                info!("batcher stopping");
                return Err(Report::new(ExportError::Cancelled));
            }

            let ledger = match self.source.get_ledger(&ct, next).await {
                Ok(ledger) => ledger,
                Err(err) if err.is_cancelled() => {
                    info!("batcher stopping");
                    return Err(err.change_context(ExportError::Cancelled));
                }
                Err(err) => {
                    return Err(err.change_context(ExportError::Source))
                        .attach_printable("failed to fetch ledger from source")
                        .attach_printable_lazy(|| format!("sequence: {}", next));
                }
            };

            self.add_ledger(ledger, &tx)
                .await
                .attach_printable_lazy(|| format!("failed to add ledger {}", next))?;

            next += 1;
        }

        // Returning drops the sender, closing the handoff.
        Ok(())
    }

    /// Route a ledger into its batch, emitting the batch once complete.
    async fn add_ledger(
        &mut self,
        ledger: Ledger,
        tx: &mpsc::Sender<LedgerBatch>,
    ) -> Result<(), ExportError> {
        let sequence = ledger.sequence;
        let key = self.options.object_key(sequence)?;

        let batch = match self.pending.entry(key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let end = self.options.batch_end(sequence);
                debug!(key = %key, start = sequence, end, "opening batch");
                entry.insert(LedgerBatch::new(key.clone(), sequence, end))
            }
        };

        batch.add(ledger)?;

        if batch.is_complete() {
            if let Some(batch) = self.pending.remove(&key) {
                debug!(key = %key, ledgers = batch.ledger_count(), "batch complete");
                // Blocking send: backpressure from the uploader propagates
                // all the way to the source.
                tx.send(batch)
                    .await
                    .map_err(|_| Report::new(ExportError::Upload))
                    .attach_printable("handoff closed before the batch could be sent")?;
            }
        }

        Ok(())
    }
}
