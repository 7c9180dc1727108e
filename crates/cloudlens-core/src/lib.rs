//! Core library for `CloudLens`.
//!
//! This crate holds everything that does not depend on a particular HTTP
//! framework or cloud SDK:
//!
//! - [`vault`]: encrypted, tenant-scoped credential storage.
//! - [`provider`]: the adapter contract every cloud provider implements,
//!   plus the timeout and retry policy applied to each call.
//! - [`admission`]: per-identity token-bucket rate limiting.
//! - [`session`]: the streaming session state machine and polling loop.
//! - [`envelope`]: the outbound message format.

pub mod admission;
pub mod credential;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod provider;
pub mod session;
pub mod vault;
