//! Upload of converted outputs to the object store.

mod dispatcher;
mod keys;

pub use dispatcher::{UploadDispatcher, UploadReport, UploadSettings};
pub use keys::remote_key;
