//! External service contracts.

pub mod credential_store;

pub use credential_store::{
    CredentialBag, CredentialError, CredentialRef, CredentialStore, InMemoryCredentialStore,
    DEFAULT_ACCOUNT,
};
