use std::collections::BTreeSet;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use meridian_exporter::cli::run_export;
use meridian_exporter::codec;
use meridian_exporter::config::RangeRequest;
use meridian_exporter::datastore::testing::InMemoryDataStore;
use meridian_exporter::error::ExportError;
use meridian_exporter::layout::ExportOptions;
use meridian_exporter::manifest::{Manifest, MANIFEST_KEY};
use meridian_exporter::source::testing::InMemoryLedgerSource;

const TIP: u32 = 1_000_000;
const PASSPHRASE: &str = "Meridian Test Network ; February 2021";

fn request(start: u32, end: u32) -> RangeRequest {
    RangeRequest {
        start,
        end,
        from_last: None,
    }
}

async fn export(
    options: ExportOptions,
    store: &InMemoryDataStore,
    request: RangeRequest,
) -> Result<(), ExportError> {
    let source = InMemoryLedgerSource::new(TIP);
    let ct = CancellationToken::new();

    run_export(
        source,
        store.clone(),
        options,
        PASSPHRASE.to_string(),
        request,
        ct,
    )
    .await
    .map_err(|report| *report.current_context())
}

/// Non-manifest keys currently in the store.
fn object_keys(store: &InMemoryDataStore) -> Vec<String> {
    store
        .keys()
        .into_iter()
        .filter(|key| key != MANIFEST_KEY)
        .collect()
}

#[tokio::test]
async fn test_export_single_ledger_files_with_partitions() {
    let options = ExportOptions {
        ledgers_per_file: 1,
        files_per_partition: 10,
    };
    let store = InMemoryDataStore::new();

    // Start 1 clamps to 2.
    export(options, &store, request(1, 20)).await.unwrap();

    let mut expected = BTreeSet::new();
    for sequence in 2..=20u32 {
        expected.insert(options.object_key(sequence).unwrap());
    }

    let actual: BTreeSet<String> = object_keys(&store).into_iter().collect();
    assert_eq!(actual, expected);
    assert_eq!(actual.len(), 19);
    assert!(store.object(MANIFEST_KEY).is_some());
}

#[tokio::test]
async fn test_export_partitioned_files() {
    let options = ExportOptions {
        ledgers_per_file: 64,
        files_per_partition: 10,
    };
    let store = InMemoryDataStore::new();

    export(options, &store, request(2, 255)).await.unwrap();

    let actual: BTreeSet<String> = object_keys(&store).into_iter().collect();
    let expected: BTreeSet<String> = [
        "0-639/0-63.pb.gz",
        "0-639/64-127.pb.gz",
        "0-639/128-191.pb.gz",
        "0-639/192-255.pb.gz",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    assert_eq!(actual, expected);

    // The first batch starts at the clamped genesis, not at the grid start.
    let blob = store.object("0-639/0-63.pb.gz").unwrap();
    let frame = codec::decode(&codec::decompress(&blob).unwrap()).unwrap();
    assert_eq!(frame.start_sequence, 2);
    assert_eq!(frame.end_sequence, 63);
    let sequences: Vec<u32> = frame.ledgers.iter().map(|ledger| ledger.sequence).collect();
    assert_eq!(sequences, (2..=63).collect::<Vec<u32>>());
}

#[tokio::test]
async fn test_export_rounds_bounded_end_up() {
    let options = ExportOptions {
        ledgers_per_file: 10,
        files_per_partition: 1,
    };
    let store = InMemoryDataStore::new();

    // [0, 5] normalizes to [2, 10]: the 0-9 file completes, the trailing
    // batch stays pending and is never written.
    export(options, &store, request(0, 5)).await.unwrap();

    assert_eq!(object_keys(&store), vec!["0-9.pb.gz"]);

    let blob = store.object("0-9.pb.gz").unwrap();
    let frame = codec::decode(&codec::decompress(&blob).unwrap()).unwrap();
    let sequences: Vec<u32> = frame.ledgers.iter().map(|ledger| ledger.sequence).collect();
    assert_eq!(sequences, (2..=9).collect::<Vec<u32>>());
}

#[tokio::test]
async fn test_export_single_object() {
    let options = ExportOptions {
        ledgers_per_file: 1,
        files_per_partition: 1,
    };
    let store = InMemoryDataStore::new();

    export(options, &store, request(2, 2)).await.unwrap();

    assert_eq!(object_keys(&store), vec!["2.pb.gz"]);

    let blob = store.object("2.pb.gz").unwrap();
    let frame = codec::decode(&codec::decompress(&blob).unwrap()).unwrap();
    assert_eq!(frame.ledgers.len(), 1);
    assert_eq!(frame.ledgers[0].sequence, 2);
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let options = ExportOptions {
        ledgers_per_file: 64,
        files_per_partition: 10,
    };
    let store = InMemoryDataStore::new();

    export(options, &store, request(2, 255)).await.unwrap();
    let keys = store.keys();
    let bodies: Vec<_> = keys.iter().map(|key| store.object(key).unwrap()).collect();

    // Re-running the full range, or any subset of it, writes nothing new.
    export(options, &store, request(2, 255)).await.unwrap();
    export(options, &store, request(64, 127)).await.unwrap();

    assert_eq!(store.keys(), keys);
    for (key, body) in keys.iter().zip(bodies) {
        assert_eq!(store.object(key).unwrap(), body);
    }
}

#[tokio::test]
async fn test_cancellation_drains_in_flight_batches() {
    let options = ExportOptions {
        ledgers_per_file: 64,
        files_per_partition: 10,
    };
    let store = InMemoryDataStore::new();
    let source = InMemoryLedgerSource::new(TIP);
    let ct = CancellationToken::new();

    let run = tokio::spawn(run_export(
        source,
        store.clone(),
        options,
        PASSPHRASE.to_string(),
        request(2, 0),
        ct.clone(),
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    ct.cancel();

    let report = run.await.unwrap().unwrap_err();
    assert!(matches!(
        report.current_context(),
        ExportError::Cancelled
    ));

    // Every object written is complete: the frame covers its whole range and
    // the ledgers are contiguous.
    let keys = object_keys(&store);
    assert!(!keys.is_empty());
    for key in keys {
        let blob = store.object(&key).unwrap();
        let frame = codec::decode(&codec::decompress(&blob).unwrap()).unwrap();
        let sequences: Vec<u32> =
            frame.ledgers.iter().map(|ledger| ledger.sequence).collect();
        let last = *sequences.last().unwrap();
        assert_eq!(last, frame.end_sequence, "partial object at {}", key);
        for window in sequences.windows(2) {
            assert_eq!(window[1], window[0] + 1, "gap in object {}", key);
        }
    }
}

#[tokio::test]
async fn test_export_from_last() {
    let options = ExportOptions {
        ledgers_per_file: 1,
        files_per_partition: 1,
    };
    let store = InMemoryDataStore::new();
    let source = InMemoryLedgerSource::new(100);
    let ct = CancellationToken::new();

    let run = tokio::spawn(run_export(
        source,
        store.clone(),
        options,
        PASSPHRASE.to_string(),
        RangeRequest {
            start: 0,
            end: 0,
            from_last: Some(10),
        },
        ct.clone(),
    ));

    // The source blocks past its tip; give the pipeline time to catch up.
    tokio::time::sleep(Duration::from_millis(200)).await;
    ct.cancel();

    let report = run.await.unwrap().unwrap_err();
    assert!(matches!(
        report.current_context(),
        ExportError::Cancelled
    ));

    let mut expected = BTreeSet::new();
    for sequence in 90..=100u32 {
        expected.insert(options.object_key(sequence).unwrap());
    }
    let actual: BTreeSet<String> = object_keys(&store).into_iter().collect();
    assert_eq!(actual, expected);
}

#[tokio::test]
async fn test_manifest_mismatch_fails_fast() {
    let options = ExportOptions {
        ledgers_per_file: 64,
        files_per_partition: 10,
    };
    let store = InMemoryDataStore::new();

    // Seed a manifest written with a different layout.
    let other = Manifest::new(
        PASSPHRASE.to_string(),
        &ExportOptions {
            ledgers_per_file: 1,
            files_per_partition: 1,
        },
    );
    store.insert(
        MANIFEST_KEY,
        serde_json::to_vec(&other).unwrap().into(),
    );

    let err = export(options, &store, request(2, 255)).await.unwrap_err();
    assert_eq!(err, ExportError::Configuration);

    // Nothing besides the seeded manifest was written.
    assert!(object_keys(&store).is_empty());
}

#[tokio::test]
async fn test_start_beyond_tip_fails() {
    let options = ExportOptions {
        ledgers_per_file: 1,
        files_per_partition: 1,
    };
    let store = InMemoryDataStore::new();
    let source = InMemoryLedgerSource::new(50);
    let ct = CancellationToken::new();

    let result = run_export(
        source,
        store.clone(),
        options,
        PASSPHRASE.to_string(),
        request(100, 0),
        ct,
    )
    .await;

    let report = result.unwrap_err();
    assert!(matches!(
        report.current_context(),
        ExportError::Configuration
    ));
    assert!(object_keys(&store).is_empty());
}
