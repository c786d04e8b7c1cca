//! # Sweeper
//!
//! Sweeper tears down AWS resources listed in a resource document, the kind
//! of inventory an account scanner produces. Resources are deleted one kind at
//! a time in a fixed order, so that anything that holds on to another
//! resource is removed before the resource it depends on: instances before
//! their subnets and security groups, subnets and gateways before their VPC,
//! and buckets last.
//!
//! ## Concepts
//!
//! - **Resource document**: a TOML file mapping regions (and a global
//!   section) to resource ids per [`ResourceKind`]. See [`ResourceDocument`].
//! - **Operation**: something that implements [`Delete`] for one kind. The
//!   AWS operations live in [`aws`] and talk to the provider through the
//!   [`Invoke`] trait, which [`AwsCli`] implements by running the `aws`
//!   command line tool.
//! - **Engine**: [`Engine`] walks the document in deletion order, runs the
//!   registered operation per region and folds every [`DeletionOutcome`]
//!   into a [`RunReport`]. Cancelling the [`CancellationToken`] in
//!   [`RunOptions`] stops it between invocations.
//!
//! A failure to delete one resource never stops a run. It shows up in the
//! report instead.
//!
//! ## Error Handling
//!
//! Only loading the document or the configuration can fail a run. Those
//! errors are collected in [`Error`]. Failed external calls are reported
//! as [`CallError`] and are always recovered by the operations.

use snafu::prelude::*;

pub mod aws;
pub mod config;
pub mod document;
pub mod engine;
pub mod invoke;
pub mod kind;
pub mod ops;
pub mod outcome;
pub mod report;
#[cfg(test)]
mod test;

pub use config::{Config, ConfigError, Pacing, Retry};
pub use document::{LoadError, ResourceDocument};
pub use engine::{Engine, RunOptions};
pub use invoke::{AwsCli, Call, CallError, Invoke};
pub use kind::{ResourceKind, UnknownKind};
pub use ops::{Delete, DeleteRequest, Registry};
pub use outcome::DeletionOutcome;
pub use report::RunReport;
pub use tokio_util::sync::CancellationToken;

/// Errors that stop a run before anything is deleted.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Could not load the resource document: {source}"))]
    Load { source: LoadError },

    #[snafu(display("Invalid configuration: {source}"))]
    Config { source: ConfigError },
}

impl From<LoadError> for Error {
    fn from(source: LoadError) -> Self {
        Error::Load { source }
    }
}

impl From<ConfigError> for Error {
    fn from(source: ConfigError) -> Self {
        Error::Config { source }
    }
}
