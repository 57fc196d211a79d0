pub mod batch;
pub mod batcher;
pub mod cli;
pub mod codec;
pub mod config;
pub mod datastore;
pub mod error;
pub mod layout;
pub mod manifest;
pub mod source;
pub mod uploader;

pub use self::batch::LedgerBatch;
pub use self::codec::Ledger;
pub use self::layout::ExportOptions;
pub use self::source::LedgerRange;
