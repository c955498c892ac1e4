pub mod credential_store;
mod encrypted_file;

pub use credential_store::{CredentialStore, SecretBackend, StorageError};
pub use encrypted_file::FileStoreError;
