//! OAuth credential lifecycle for one remote account
//!
//! - [`CredentialManager`] - Validates, refreshes and hands out bearer tokens
//! - [`AccountCredentials`] - Static client/secret/refresh material
//! - [`BearerToken`] - Read-only token snapshot tagged with its refresh generation

mod manager;
mod oauth;

pub use manager::{AccountCredentials, BearerToken, CredentialConfig, CredentialManager};
