//! Converter module: the external service that processes recordings.
//!
//! [`ConversionService`] is the seam between the pipeline and whatever turns
//! a `.vrs` recording into MPS outputs. [`AriaCliService`] drives the aria
//! command line tool; tests use `testing::MockConversionService`.
//!
//! # Example
//!
//! ```ignore
//! use mps_relay_core::converter::{AriaCliService, AriaConfig, ConversionService};
//!
//! let service = AriaCliService::new(
//!     AriaConfig::default().with_credentials("me@example.com", "secret"),
//! );
//! service.validate().await?;
//! ```

mod aria;
mod config;
mod error;
pub mod output_parser;
mod traits;
mod types;

pub use aria::{AriaCliService, CliFlavor};
pub use config::{AriaConfig, EXECUTABLE_CANDIDATES, EXECUTABLE_ENV_VAR};
pub use error::ConversionError;
pub use traits::ConversionService;
pub use types::{ConversionRequest, FetchedOutputs, RemoteStatus, StageProgress};
