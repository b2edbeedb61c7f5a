//! CNPJ Loader Common Library
//!
//! Shared types, logging setup and error handling for the loader workspace.
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber configuration driven by `LOG_*` variables
//! - **Versions**: [`DatasetVersion`], the `YYYY-MM` release identifier
//!
//! # Example
//!
//! ```no_run
//! use cnpj_common::logging::{init_logging, LogConfig};
//! use cnpj_common::DatasetVersion;
//!
//! fn main() -> cnpj_common::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     let version: DatasetVersion = "2024-05".parse()?;
//!     tracing::info!(version = %version, "Starting load");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod version;

pub use error::{CommonError, Result};
pub use version::DatasetVersion;
