#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod auth;
pub mod client;
pub mod error;
pub mod http;
pub mod net;

pub use client::{OtaStatus, SyncClient, SyncConfig, SyncOutcome, UpdateDescriptor};
pub use error::{FatalCause, RetryCause, SyncError, SyncResult};
