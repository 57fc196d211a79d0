//! Mapping from ledger sequences to datalake object keys.
//!
//! The key derivation is the canonical ground truth shared by the exporter
//! and by any offline reader of the datalake. It is pure: the key depends
//! only on the sequence number and the layout options.

use error_stack::{Report, Result, ResultExt};
use serde::{Deserialize, Serialize};

use crate::error::ExportError;

/// File extension carried by every exported object.
pub const OBJECT_SUFFIX: &str = ".pb.gz";

/// Options controlling how ledgers are grouped into objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportOptions {
    /// Ledgers per object.
    pub ledgers_per_file: u32,
    /// Objects per partition directory. 1 disables partition directories.
    pub files_per_partition: u32,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            ledgers_per_file: 64,
            files_per_partition: 10,
        }
    }
}

impl ExportOptions {
    /// Returns the number of ledgers in a partition.
    pub fn partition_size(&self) -> u32 {
        self.ledgers_per_file * self.files_per_partition
    }

    /// First sequence of the file containing `sequence`.
    pub fn file_start(&self, sequence: u32) -> u32 {
        sequence / self.ledgers_per_file * self.ledgers_per_file
    }

    /// First sequence of the partition containing `sequence`.
    pub fn partition_start(&self, sequence: u32) -> u32 {
        sequence / self.partition_size() * self.partition_size()
    }

    /// Derive the object key for the file containing `sequence`.
    pub fn object_key(&self, sequence: u32) -> Result<String, ExportError> {
        if self.ledgers_per_file < 1 {
            return Err(Report::new(ExportError::Configuration)).attach_printable_lazy(|| {
                format!(
                    "invalid ledgers per file ({}): must be at least 1",
                    self.ledgers_per_file
                )
            });
        }

        let mut key = String::new();

        if self.files_per_partition > 1 {
            let partition_start = self.partition_start(sequence);
            let partition_end = partition_start + self.partition_size() - 1;
            key.push_str(&format!("{}-{}/", partition_start, partition_end));
        }

        let file_start = self.file_start(sequence);
        let file_end = file_start + self.ledgers_per_file - 1;
        key.push_str(&file_start.to_string());

        // Multiple ledgers per file.
        if file_start != file_end {
            key.push_str(&format!("-{}", file_end));
        }
        key.push_str(OBJECT_SUFFIX);

        Ok(key)
    }

    /// Last sequence accepted by the batch starting at `start`, inclusive.
    ///
    /// The first file of the grid is special: when `start` is below
    /// `ledgers_per_file` the batch ends at `ledgers_per_file - 1`, so that
    /// its key stays aligned to the partition grid even though the chain
    /// genesis is not sequence 0.
    pub fn batch_end(&self, start: u32) -> u32 {
        if start < self.ledgers_per_file {
            self.ledgers_per_file - 1
        } else {
            start + self.ledgers_per_file - 1
        }
    }
}
