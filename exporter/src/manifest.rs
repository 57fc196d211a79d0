//! Datalake manifest describing the layout of sibling objects.
//!
//! The manifest pins the key grid and compression for the whole datalake.
//! Exporting with a different layout into the same destination would corrupt
//! the grid, so startup fails fast on any mismatch.

use error_stack::{Report, Result, ResultExt};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::datastore::{DataStore, DataStoreResultExt};
use crate::error::ExportError;
use crate::layout::ExportOptions;

/// Key of the manifest object, at the datastore root.
pub const MANIFEST_KEY: &str = "manifest.json";

/// Version of the datalake schema, not of the exporter binary.
pub const SCHEMA_VERSION: u32 = 1;

/// Compression applied to every object body.
pub const COMPRESSION: &str = "gzip";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub network_passphrase: String,
    pub version: u32,
    pub compression: String,
    pub ledgers_per_file: u32,
    pub files_per_partition: u32,
}

impl Manifest {
    pub fn new(network_passphrase: String, options: &ExportOptions) -> Self {
        Self {
            network_passphrase,
            version: SCHEMA_VERSION,
            compression: COMPRESSION.to_string(),
            ledgers_per_file: options.ledgers_per_file,
            files_per_partition: options.files_per_partition,
        }
    }

    /// Validate the destination manifest, writing it when missing.
    pub async fn ensure<D>(&self, store: &D) -> Result<(), ExportError>
    where
        D: DataStore,
    {
        match store.get(MANIFEST_KEY).await {
            Ok(bytes) => self.check_existing(&bytes),
            Err(err) if err.is_not_found() => {
                let body = serde_json::to_vec_pretty(self)
                    .change_context(ExportError::Serialize)
                    .attach_printable("failed to serialize manifest")?;

                let created = store
                    .put_if_absent(MANIFEST_KEY, body.into())
                    .await
                    .change_context(ExportError::Upload)
                    .attach_printable("failed to write manifest")?;

                if created {
                    info!(key = MANIFEST_KEY, "wrote datalake manifest");
                    return Ok(());
                }

                // Lost the race to a concurrent exporter; validate its write.
                let bytes = store
                    .get(MANIFEST_KEY)
                    .await
                    .change_context(ExportError::Upload)
                    .attach_printable("failed to re-read manifest")?;
                self.check_existing(&bytes)
            }
            Err(err) => Err(err.change_context(ExportError::Upload))
                .attach_printable("failed to read manifest"),
        }
    }

    fn check_existing(&self, bytes: &[u8]) -> Result<(), ExportError> {
        let existing: Manifest = serde_json::from_slice(bytes)
            .change_context(ExportError::Configuration)
            .attach_printable("destination manifest is not valid json")?;

        if existing != *self {
            return Err(Report::new(ExportError::Configuration)).attach_printable_lazy(|| {
                format!(
                    "destination manifest does not match the configuration: existing {:?}, configured {:?}",
                    existing, self
                )
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::datastore::testing::InMemoryDataStore;
    use crate::error::ExportError;
    use crate::layout::ExportOptions;

    use super::{Manifest, MANIFEST_KEY};

    fn manifest() -> Manifest {
        Manifest::new(
            "Meridian Test Network ; February 2021".to_string(),
            &ExportOptions {
                ledgers_per_file: 64,
                files_per_partition: 10,
            },
        )
    }

    #[tokio::test]
    async fn test_ensure_writes_missing_manifest() {
        let store = InMemoryDataStore::new();

        manifest().ensure(&store).await.unwrap();

        let body = store.object(MANIFEST_KEY).unwrap();
        let written: Manifest = serde_json::from_slice(&body).unwrap();
        assert_eq!(written, manifest());

        // Field names are part of the format.
        let raw = String::from_utf8(body.to_vec()).unwrap();
        assert!(raw.contains("networkPassphrase"));
        assert!(raw.contains("ledgersPerFile"));
    }

    #[tokio::test]
    async fn test_ensure_accepts_matching_manifest() {
        let store = InMemoryDataStore::new();
        manifest().ensure(&store).await.unwrap();
        manifest().ensure(&store).await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_rejects_mismatch() {
        let store = InMemoryDataStore::new();
        manifest().ensure(&store).await.unwrap();

        let mut other = manifest();
        other.ledgers_per_file = 1;

        let report = other.ensure(&store).await.unwrap_err();
        assert!(matches!(
            report.current_context(),
            ExportError::Configuration
        ));
    }
}
