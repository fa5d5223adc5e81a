//! One storage contract over the local filesystem, S3, Google Cloud Storage
//! and Azure Blob Storage.
//!
//! Every driver implements [`Storage`]; failures come back as a
//! [`StorageError`] whose [`kind`](StorageError::kind) is the same whatever
//! the backend.

pub mod adapters;
pub mod config;
pub mod manager;
pub mod model;
pub mod util;

pub use adapters::{
    AmazonWebServicesS3Storage, AzureBlobStorage, GoogleCloudStorage, LocalFileSystem,
    SignedUrlOptions, Storage,
};
pub use config::{ConfigError, DiskConfig, StorageConfig};
pub use manager::StorageManager;
pub use model::{
    content::{ByteStream, Content, ListStream},
    error::{ErrorKind, Result, StorageError},
    response::{
        ContentResponse, DeleteResponse, ExistsResponse, FileListEntry, Raw, Response,
        SignedUrlResponse, StatResponse,
    },
};
