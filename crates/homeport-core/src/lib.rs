//! Shared account model for the Homeport file server.
//!
//! The user record, the permission vocabulary, and the [`UserStore`]
//! boundary that every credential and quota lookup goes through.

pub mod error;
pub mod password;
pub mod store;
pub mod types;

pub use error::{HomeportError, Result};
pub use store::{MemoryUserStore, UserStore, public_keys_match};
pub use types::{Permission, QuotaUsage, SYSTEM_ACCOUNT, User};
