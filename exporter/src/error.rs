use std::process::ExitCode;

/// Error kinds surfaced by the export pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportError {
    /// Configuration or requested range violates an invariant. Fatal before any I/O.
    Configuration,
    /// Failure acquiring a ledger from the source. Fatal.
    Source,
    /// Sequential ordering broken inside a batch. Programmer error.
    InvariantViolation,
    /// Failure serializing or deserializing a batch frame.
    Serialize,
    /// Failure compressing or decompressing a batch body.
    Compress,
    /// Failure writing to the destination data store.
    Upload,
    /// Cooperative shutdown. Expected, not an operator-facing failure.
    Cancelled,
}

pub type Result<T> = error_stack::Result<T, ExportError>;

impl error_stack::Context for ExportError {}

impl std::fmt::Display for ExportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportError::Configuration => f.write_str("export error: invalid configuration"),
            ExportError::Source => f.write_str("export error: ledger source failure"),
            ExportError::InvariantViolation => {
                f.write_str("export error: batch ordering invariant violated")
            }
            ExportError::Serialize => f.write_str("export error: serialization failure"),
            ExportError::Compress => f.write_str("export error: compression failure"),
            ExportError::Upload => f.write_str("export error: upload failure"),
            ExportError::Cancelled => f.write_str("export cancelled"),
        }
    }
}

pub trait ReportExt {
    fn to_exit_code(&self) -> ExitCode;
}

impl<T> ReportExt for Result<T> {
    fn to_exit_code(&self) -> ExitCode {
        match self {
            Ok(_) => ExitCode::SUCCESS,
            Err(err) => match err.current_context() {
                ExportError::Cancelled => ExitCode::SUCCESS,
                ExportError::Configuration => {
                    eprintln!("{:?}", err);
                    ExitCode::from(2)
                }
                _ => {
                    eprintln!("{:?}", err);
                    ExitCode::FAILURE
                }
            },
        }
    }
}
