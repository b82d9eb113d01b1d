//! Core types, errors, and configuration shared by the keel crates.
//!
//! This crate holds the pieces every layer of the reconciliation engine
//! agrees on: the governing [`Declaration`], the [`ResourceIdentity`] used to
//! address cluster objects, the [`RolloutConfig`] surface, and the shared
//! [`Error`] taxonomy.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod declaration;
pub mod error;
pub mod manifest;
pub mod result;

pub use config::RolloutConfig;
pub use declaration::{Declaration, PAUSE_ANNOTATION};
pub use error::Error;
pub use manifest::{Manifest, ResourceIdentity};
pub use result::{Result, ResultExt};
