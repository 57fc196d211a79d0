//! Exporter configuration and ledger-range handling.

use std::path::Path;
use std::time::Duration;

use error_stack::{Report, Result, ResultExt};
use figment::providers::{Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ExportError;
use crate::layout::ExportOptions;
use crate::source::LedgerRange;

/// Minimum admissible start sequence. Sequence 1 is the genesis placeholder
/// of the network and is never exported.
pub const MIN_LEDGER_SEQUENCE: u32 = 2;

pub const MAINNET_PASSPHRASE: &str = "Meridian Public Network ; February 2021";
pub const TESTNET_PASSPHRASE: &str = "Meridian Test Network ; February 2021";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Network preset, `mainnet` or `testnet`.
    pub network: String,
    /// Overrides the passphrase implied by `network`.
    #[serde(default)]
    pub network_passphrase: Option<String>,
    /// Object-store destination, e.g. `s3://bucket/prefix`.
    pub destination_url: String,
    #[serde(default)]
    pub exporter: ExportOptions,
    pub ledger_source: LedgerSourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSourceConfig {
    /// Base URL of the ledger node.
    pub url: String,
    /// How long to wait before retrying a ledger that is not yet available.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl LedgerSourceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Self, ExportError> {
        let config: Config = Figment::new()
            .merge(Toml::file(path))
            .extract()
            .change_context(ExportError::Configuration)
            .attach_printable_lazy(|| format!("config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), ExportError> {
        if self.exporter.ledgers_per_file < 1 {
            return Err(Report::new(ExportError::Configuration))
                .attach_printable("exporter.ledgers_per_file must be at least 1");
        }
        if self.exporter.files_per_partition < 1 {
            return Err(Report::new(ExportError::Configuration))
                .attach_printable("exporter.files_per_partition must be at least 1");
        }
        Ok(())
    }

    /// Passphrase recorded in the datalake manifest.
    pub fn network_passphrase(&self) -> Result<String, ExportError> {
        if let Some(passphrase) = &self.network_passphrase {
            return Ok(passphrase.clone());
        }

        match self.network.as_str() {
            "mainnet" => Ok(MAINNET_PASSPHRASE.to_string()),
            "testnet" => Ok(TESTNET_PASSPHRASE.to_string()),
            other => Err(Report::new(ExportError::Configuration))
                .attach_printable_lazy(|| format!("unknown network preset: {}", other)),
        }
    }
}

/// Requested range from the command line, before normalization.
#[derive(Debug, Clone, Copy)]
pub struct RangeRequest {
    /// Starting sequence, inclusive.
    pub start: u32,
    /// Ending sequence, inclusive. 0 means unbounded.
    pub end: u32,
    /// Start this many ledgers before the network tip instead.
    pub from_last: Option<u32>,
}

/// Normalize the requested range against the layout grid and the network tip.
///
/// The start is aligned down to the nearest file boundary and clamped to
/// [`MIN_LEDGER_SEQUENCE`]; a bounded end is rounded up to the next boundary
/// so the final file can complete.
pub fn resolve_range(
    request: RangeRequest,
    options: &ExportOptions,
    tip: u32,
) -> Result<LedgerRange, ExportError> {
    let ledgers_per_file = options.ledgers_per_file;
    if ledgers_per_file < 1 {
        return Err(Report::new(ExportError::Configuration))
            .attach_printable("ledgers per file must be at least 1");
    }

    let (mut start, mut end) = match request.from_last {
        Some(from_last) => (tip.saturating_sub(from_last).max(MIN_LEDGER_SEQUENCE), 0),
        None => (request.start, request.end),
    };

    if end != 0 && end < start {
        return Err(Report::new(ExportError::Configuration)).attach_printable_lazy(|| {
            format!("invalid end ledger {}: must be >= start ledger {}", end, start)
        });
    }

    // Align the start down to the file grid, then clamp to the minimum.
    start = start / ledgers_per_file * ledgers_per_file;
    start = start.max(MIN_LEDGER_SEQUENCE);

    // Round a bounded end up to the next boundary so the last file completes.
    if end != 0 && ledgers_per_file > 1 && end % ledgers_per_file != 0 {
        end = (end / ledgers_per_file + 1) * ledgers_per_file;
    }

    if start > tip {
        return Err(Report::new(ExportError::Configuration)).attach_printable_lazy(|| {
            format!("start ledger {} is beyond the network tip {}", start, tip)
        });
    }

    let range = if end == 0 {
        LedgerRange::unbounded(start)
    } else {
        LedgerRange::bounded(start, end)
    };

    info!(requested = ?request, %range, "resolved ledger range");

    Ok(range)
}
