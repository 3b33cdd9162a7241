//! Code shared between the pipeline control plane's server and CLI.

#![warn(missing_docs)]

pub use chrono;
#[macro_use]
pub extern crate diesel;
#[macro_use]
pub extern crate diesel_migrations;
pub use serde_json;

pub mod auth;
pub mod cafs;
pub mod config;
pub mod cor;
pub mod datum_view;
pub mod db;
pub mod errors;
pub mod gc;
pub mod job_store;
pub mod kv;
pub mod logs;
pub mod models;
pub mod pipeline_store;
pub mod rest_api;
#[allow(missing_docs, unused_imports)]
mod schema;
pub mod secret;
pub mod tracing_support;

/// Common imports used by most modules in this crate and its sibling
/// crates.
pub mod prelude {
    pub use anyhow::Context as _;
    pub use chrono::{NaiveDateTime, Utc};
    pub use diesel::{self, prelude::*, PgConnection};
    pub use serde::{Deserialize, Serialize};
    pub use std::{
        collections::HashMap,
        fmt,
        fs::File,
        io::Write,
        path::{Path, PathBuf},
    };
    pub use uuid::Uuid;

    pub use super::errors::{CoreError, DisplayCausesAndBacktraceExt};
    pub use super::models::*;
    pub use super::{Error, Result};
}

/// Error type for this crate's functions.
///
/// We use `anyhow` instead of a single enum because most of our errors are
/// one-off failures from calling into Postgres, CAFS or COR, and we mostly
/// care about preserving context for humans. Where callers need to match on
/// a specific error *kind*, see [`errors::CoreError`], which is carried
/// inside an `anyhow::Error` via `anyhow::Error::downcast_ref`.
pub type Error = anyhow::Error;

/// Result type for this crate's functions.
pub type Result<T> = ::std::result::Result<T, Error>;
