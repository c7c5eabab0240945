//! Prelude module for convenient imports.
//!
//! ```
//! use nanoquery::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`QueryClient`] - The per-instance container and store factory
//! - [`QueryOptions`] / [`QueryError`] - Configuration and error vocabulary
//! - [`FetcherStore`] / [`FetcherState`] - The read path
//! - [`MutatorStore`] / [`MutatorState`] / [`MutationContext`] - The write path
//! - [`Atom`], [`KeyPart`], [`KeySpec`], [`KeySelector`], [`keys!`] - Key building

pub use crate::atom::Atom;
pub use crate::client::QueryClient;
pub use crate::config::{QueryOptions, RetryEvent};
pub use crate::error::QueryError;
pub use crate::fetcher::{FetcherState, FetcherStore};
pub use crate::key::{Key, KeyPart, KeySelector, KeySpec};
pub use crate::keys;
pub use crate::mutator::{MutationContext, MutatorState, MutatorStore};
