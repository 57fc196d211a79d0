//! Command-line interface and pipeline assembly.

use std::path::PathBuf;

use clap::Parser;
use error_stack::{Report, Result, ResultExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::batcher::Batcher;
use crate::config::{resolve_range, Config, RangeRequest};
use crate::datastore::{DataStore, S3DataStore};
use crate::error::ExportError;
use crate::layout::ExportOptions;
use crate::manifest::Manifest;
use crate::source::{HttpLedgerSource, HttpLedgerSourceOptions, LedgerSource};
use crate::uploader::Uploader;

/// Export ledgers from a ledger node into an object-store datalake.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Starting ledger sequence, inclusive.
    #[arg(long, default_value_t = 0, conflicts_with = "from_last")]
    pub start: u32,
    /// Ending ledger sequence, inclusive. 0 exports until cancelled.
    #[arg(long, default_value_t = 0, conflicts_with = "from_last")]
    pub end: u32,
    /// Export the most recent ledgers, starting this many before the tip.
    #[arg(long)]
    pub from_last: Option<u32>,
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    pub config: PathBuf,
}

impl Cli {
    pub async fn run(self, ct: CancellationToken) -> Result<(), ExportError> {
        let config = Config::from_path(&self.config)?;
        let network_passphrase = config.network_passphrase()?;

        let source = HttpLedgerSource::new(HttpLedgerSourceOptions {
            url: config.ledger_source.url.clone(),
            poll_interval: config.ledger_source.poll_interval(),
        });

        let store = S3DataStore::new_from_url(&config.destination_url)
            .await
            .change_context(ExportError::Configuration)?;

        let request = RangeRequest {
            start: self.start,
            end: self.end,
            from_last: self.from_last,
        };

        run_export(
            source,
            store,
            config.exporter,
            network_passphrase,
            request,
            ct,
        )
        .await
    }
}

/// Assemble and supervise the export pipeline.
///
/// Validates the destination manifest, resolves the requested range against
/// the network tip, then runs the batcher and uploader to completion. A fatal
/// error in either worker cancels the shared token so the peer shuts down and
/// drains.
pub async fn run_export<S, D>(
    source: S,
    store: D,
    options: ExportOptions,
    network_passphrase: String,
    request: RangeRequest,
    ct: CancellationToken,
) -> Result<(), ExportError>
where
    S: LedgerSource + Clone + 'static,
    D: DataStore + Clone + 'static,
{
    Manifest::new(network_passphrase, &options)
        .ensure(&store)
        .await?;

    let tip = source
        .latest_sequence()
        .await
        .change_context(ExportError::Source)
        .attach_printable("failed to query the network tip")?;

    let range = resolve_range(request, &options, tip)?;

    source
        .prepare(range)
        .await
        .change_context(ExportError::Source)
        .attach_printable("failed to prepare the ledger source")?;

    let (batch_rx, batcher) = Batcher::new(source.clone(), options).start(range, ct.clone());
    let uploader = Uploader::new(store.clone()).start(batch_rx, ct.clone());

    let result = supervise(batcher, uploader, &ct).await;

    // Adapters close in reverse dependency order.
    if let Err(err) = store.close().await {
        warn!(error = ?err, "failed to close the data store");
    }
    if let Err(err) = source.close().await {
        warn!(error = ?err, "failed to close the ledger source");
    }

    result
}

/// Wait for both workers, cancelling the peer when one fails.
async fn supervise(
    mut batcher: JoinHandle<Result<(), ExportError>>,
    mut uploader: JoinHandle<Result<(), ExportError>>,
    ct: &CancellationToken,
) -> Result<(), ExportError> {
    let (batcher_result, uploader_result) = tokio::select! {
        result = &mut batcher => {
            let result = join_result("batcher", result);
            if result.is_err() {
                ct.cancel();
            }
            let uploader_result = join_result("uploader", uploader.await);
            (result, uploader_result)
        }
        result = &mut uploader => {
            let result = join_result("uploader", result);
            if result.is_err() {
                ct.cancel();
            }
            let batcher_result = join_result("batcher", batcher.await);
            (batcher_result, result)
        }
    };

    let mut cancelled = false;
    let mut fatal = None;
    for result in [batcher_result, uploader_result] {
        match result {
            Ok(()) => {}
            Err(err) if matches!(err.current_context(), ExportError::Cancelled) => {
                cancelled = true;
            }
            Err(err) => {
                if fatal.is_none() {
                    fatal = Some(err);
                }
            }
        }
    }

    if let Some(err) = fatal {
        // The cancellation reports from the teardown are expected; the first
        // fatal cause is the one worth surfacing.
        Err(err)
    } else if cancelled {
        Err(Report::new(ExportError::Cancelled))
    } else {
        Ok(())
    }
}

fn join_result(
    worker: &str,
    result: std::result::Result<Result<(), ExportError>, tokio::task::JoinError>,
) -> Result<(), ExportError> {
    match result {
        Ok(result) => result,
        Err(err) => Err(err)
            .change_context(ExportError::InvariantViolation)
            .attach_printable_lazy(|| format!("{} task panicked", worker)),
    }
}
