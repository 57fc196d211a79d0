//! Object-store adapters for the datalake destination.
//!
//! Keys are opaque paths; adapters may prepend a fixed prefix. Exported
//! objects are only ever written with a conditional put, so re-runs over an
//! already-exported range never overwrite data.

use async_trait::async_trait;
use aws_sdk_s3::{config::http::HttpResponse, error::SdkError, primitives::ByteStream};
use bytes::Bytes;
use error_stack::{Report, Result, ResultExt};
use tracing::debug;
use url::Url;

#[derive(Debug)]
pub enum DataStoreError {
    /// Precondition failed: the object already exists.
    Precondition,
    /// Object not found.
    NotFound,
    /// Request error.
    Request,
    /// Invalid destination configuration.
    Configuration,
}

impl error_stack::Context for DataStoreError {}

impl std::fmt::Display for DataStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataStoreError::Precondition => f.write_str("data store: precondition failed"),
            DataStoreError::NotFound => f.write_str("data store: not found"),
            DataStoreError::Request => f.write_str("data store: request error"),
            DataStoreError::Configuration => {
                f.write_str("data store: invalid destination configuration")
            }
        }
    }
}

pub trait DataStoreResultExt {
    fn is_precondition(&self) -> bool;
    fn is_not_found(&self) -> bool;
}

impl DataStoreResultExt for Report<DataStoreError> {
    fn is_precondition(&self) -> bool {
        matches!(self.current_context(), DataStoreError::Precondition)
    }

    fn is_not_found(&self) -> bool {
        matches!(self.current_context(), DataStoreError::NotFound)
    }
}

/// Storage destination for exported objects.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, DataStoreError>;

    async fn get(&self, key: &str) -> Result<Bytes, DataStoreError>;

    /// Write the object only if it does not already exist.
    ///
    /// Returns `true` if the object was created, `false` if an object with
    /// the same key was already present.
    async fn put_if_absent(&self, key: &str, body: Bytes) -> Result<bool, DataStoreError>;

    async fn close(&self) -> Result<(), DataStoreError>;
}

/// Options for the S3 data store.
#[derive(Default, Clone, Debug)]
pub struct DataStoreOptions {
    /// The S3 bucket to use.
    pub bucket: String,
    /// Under which prefix to store the data.
    pub prefix: Option<String>,
}

/// Datalake destination backed by an S3-compatible object store.
#[derive(Clone)]
pub struct S3DataStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3DataStore {
    pub fn new(config: aws_config::SdkConfig, options: DataStoreOptions) -> Self {
        Self::new_from_config((&config).into(), options)
    }

    pub fn new_from_config(config: aws_sdk_s3::Config, options: DataStoreOptions) -> Self {
        let client = aws_sdk_s3::Client::from_conf(config);
        let prefix = normalize_prefix(options.prefix);

        Self {
            client,
            bucket: options.bucket,
            prefix,
        }
    }

    /// Connect to the destination described by an `s3://bucket/prefix` URL,
    /// using ambient AWS configuration for credentials and endpoint.
    pub async fn new_from_url(destination_url: &str) -> Result<Self, DataStoreError> {
        let parsed = Url::parse(destination_url)
            .change_context(DataStoreError::Configuration)
            .attach_printable_lazy(|| format!("destination url: {}", destination_url))?;

        if parsed.scheme() != "s3" {
            return Err(Report::new(DataStoreError::Configuration))
                .attach_printable("expected an s3:// destination url")
                .attach_printable_lazy(|| format!("destination url: {}", destination_url));
        }

        let bucket = parsed
            .host_str()
            .ok_or_else(|| Report::new(DataStoreError::Configuration))
            .attach_printable("destination url is missing the bucket name")?
            .to_string();

        let prefix = parsed.path().trim_matches('/').to_string();
        let prefix = (!prefix.is_empty()).then_some(prefix);

        let config = aws_config::load_from_env().await;

        Ok(Self::new(config, DataStoreOptions { bucket, prefix }))
    }

    /// Ensure the currently configured bucket exists.
    pub async fn ensure_bucket(&self) -> Result<(), DataStoreError> {
        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .change_to_data_store_context()
            .attach_printable("failed to create bucket")
            .attach_printable_lazy(|| format!("bucket name: {}", self.bucket))?;
        Ok(())
    }

    fn full_key(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path)
    }
}

#[async_trait]
impl DataStore for S3DataStore {
    #[tracing::instrument(name = "datastore_exists", skip(self))]
    async fn exists(&self, key: &str) -> Result<bool, DataStoreError> {
        let key = self.full_key(key);
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .change_to_data_store_context();

        match response {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err)
                .attach_printable("failed to check object existence")
                .attach_printable_lazy(|| format!("key: {}", key)),
        }
    }

    #[tracing::instrument(name = "datastore_get", skip(self))]
    async fn get(&self, key: &str) -> Result<Bytes, DataStoreError> {
        let key = self.full_key(key);
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .change_to_data_store_context()
            .attach_printable("failed to get object")
            .attach_printable_lazy(|| format!("key: {}", key))?;

        let body = response
            .body
            .collect()
            .await
            .change_context(DataStoreError::Request)
            .attach_printable("failed to read object body")?;

        Ok(body.into_bytes())
    }

    #[tracing::instrument(name = "datastore_put_if_absent", skip(self, body))]
    async fn put_if_absent(&self, key: &str, body: Bytes) -> Result<bool, DataStoreError> {
        let key = self.full_key(key);
        let response = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(body))
            .customize()
            .mutate_request(|request| {
                // If-None-Match: "*" seems to be better supported than If-Match: "".
                request.headers_mut().insert("If-None-Match", "*");
            })
            .send()
            .await
            .change_to_data_store_context();

        match response {
            Ok(_) => {
                debug!(key, "object created");
                Ok(true)
            }
            Err(err) if err.is_precondition() => {
                debug!(key, "object already exists");
                Ok(false)
            }
            Err(err) => Err(err)
                .attach_printable("failed to put object")
                .attach_printable_lazy(|| format!("key: {}", key)),
        }
    }

    async fn close(&self) -> Result<(), DataStoreError> {
        // The client holds no connection state worth tearing down.
        Ok(())
    }
}

fn normalize_prefix(prefix: Option<String>) -> String {
    match prefix {
        None => String::new(),
        Some(prefix) if prefix.is_empty() => String::new(),
        Some(prefix) if prefix.ends_with('/') => prefix,
        Some(prefix) => format!("{}/", prefix),
    }
}

trait ToDataStoreResult: Sized {
    type Ok;

    fn change_to_data_store_context(self) -> Result<Self::Ok, DataStoreError>;
}

impl<T, E> ToDataStoreResult for std::result::Result<T, SdkError<E, HttpResponse>>
where
    SdkError<E, HttpResponse>: error_stack::Context,
{
    type Ok = T;

    fn change_to_data_store_context(self) -> Result<T, DataStoreError> {
        match self {
            Ok(value) => Ok(value),
            Err(err) => match err.raw_response().map(|r| r.status().as_u16()) {
                Some(412) => Err(err).change_context(DataStoreError::Precondition),
                Some(404) => Err(err).change_context(DataStoreError::NotFound),
                _ => Err(err).change_context(DataStoreError::Request),
            },
        }
    }
}

pub mod testing {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use bytes::Bytes;
    use error_stack::{Report, Result};

    use super::{DataStore, DataStoreError};

    /// In-memory data store used by tests.
    #[derive(Clone, Default)]
    pub struct InMemoryDataStore {
        objects: Arc<Mutex<BTreeMap<String, Bytes>>>,
    }

    impl InMemoryDataStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Keys currently in the store, in lexicographic order.
        pub fn keys(&self) -> Vec<String> {
            self.objects
                .lock()
                .expect("lock poisoned")
                .keys()
                .cloned()
                .collect()
        }

        pub fn object(&self, key: &str) -> Option<Bytes> {
            self.objects.lock().expect("lock poisoned").get(key).cloned()
        }

        pub fn len(&self) -> usize {
            self.objects.lock().expect("lock poisoned").len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        /// Seed an object directly, bypassing the conditional put.
        pub fn insert(&self, key: &str, body: Bytes) {
            self.objects
                .lock()
                .expect("lock poisoned")
                .insert(key.to_string(), body);
        }
    }

    #[async_trait]
    impl DataStore for InMemoryDataStore {
        async fn exists(&self, key: &str) -> Result<bool, DataStoreError> {
            Ok(self.objects.lock().expect("lock poisoned").contains_key(key))
        }

        async fn get(&self, key: &str) -> Result<Bytes, DataStoreError> {
            self.objects
                .lock()
                .expect("lock poisoned")
                .get(key)
                .cloned()
                .ok_or_else(|| Report::new(DataStoreError::NotFound))
        }

        async fn put_if_absent(&self, key: &str, body: Bytes) -> Result<bool, DataStoreError> {
            let mut objects = self.objects.lock().expect("lock poisoned");
            if objects.contains_key(key) {
                return Ok(false);
            }
            objects.insert(key.to_string(), body);
            Ok(true)
        }

        async fn close(&self) -> Result<(), DataStoreError> {
            Ok(())
        }
    }
}
