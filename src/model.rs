pub mod azure;
pub mod content;
pub mod error;
pub mod gcs;
pub mod native;
pub mod response;
pub mod s3;
