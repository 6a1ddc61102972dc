//! Object storage for converted outputs.

mod config;
mod error;
mod http;
mod traits;

pub use config::StorageConfig;
pub use error::StorageError;
pub use http::HttpObjectStore;
pub use traits::ObjectStore;
