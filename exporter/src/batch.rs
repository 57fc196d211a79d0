//! In-memory accumulator for a single datalake object.

use error_stack::{Report, Result, ResultExt};

use crate::codec::{Ledger, LedgerBatchData};
use crate::error::ExportError;

/// A batch of consecutive ledgers destined for one object.
///
/// A batch is complete once it holds its last admissible sequence. Complete
/// batches are handed off to the uploader and never mutated again.
#[derive(Debug, Clone)]
pub struct LedgerBatch {
    key: String,
    start_sequence: u32,
    end_sequence: u32,
    ledgers: Vec<Ledger>,
}

impl LedgerBatch {
    pub fn new(key: String, start_sequence: u32, end_sequence: u32) -> Self {
        Self {
            key,
            start_sequence,
            end_sequence,
            ledgers: Vec::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn start_sequence(&self) -> u32 {
        self.start_sequence
    }

    pub fn end_sequence(&self) -> u32 {
        self.end_sequence
    }

    pub fn ledger_count(&self) -> usize {
        self.ledgers.len()
    }

    /// Sequence of the most recently added ledger.
    pub fn last_sequence(&self) -> Option<u32> {
        self.ledgers.last().map(|ledger| ledger.sequence)
    }

    /// Append the next ledger.
    ///
    /// Ledgers must arrive strictly sequentially with no gaps; anything else
    /// is a programmer error upstream and fails the batch.
    pub fn add(&mut self, ledger: Ledger) -> Result<(), ExportError> {
        let expected = match self.last_sequence() {
            Some(last) => last + 1,
            None => self.start_sequence,
        };

        if ledger.sequence != expected {
            return Err(Report::new(ExportError::InvariantViolation)).attach_printable_lazy(
                || {
                    format!(
                        "ledgers must be added sequentially: expected {}, got {}",
                        expected, ledger.sequence
                    )
                },
            );
        }

        self.ledgers.push(ledger);
        Ok(())
    }

    /// A batch is complete once its last admissible sequence was added.
    pub fn is_complete(&self) -> bool {
        self.last_sequence()
            .map(|last| last >= self.end_sequence)
            .unwrap_or(false)
    }

    /// Consume the batch into its wire frame.
    pub fn into_data(self) -> LedgerBatchData {
        LedgerBatchData {
            start_sequence: self.start_sequence,
            end_sequence: self.end_sequence,
            ledgers: self.ledgers,
        }
    }
}
