use std::path::Path;

use keyring::Entry;
use thiserror::Error;

use super::encrypted_file::{EncryptedFileStore, FileStoreError};

const SERVICE_NAME: &str = "com.kiosk.sync";
const API_KEY_NAME: &str = "backend_api_key";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("keyring error: {0}")]
    KeyringError(#[from] keyring::Error),
    #[error("api key not found")]
    NotFound,
    #[error("encrypted file storage error: {0}")]
    File(FileStoreError),
    #[error("unknown secret backend: {0}")]
    UnknownBackend(String),
}

impl From<FileStoreError> for StorageError {
    fn from(err: FileStoreError) -> Self {
        match err {
            FileStoreError::Missing => StorageError::NotFound,
            other => StorageError::File(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecretBackend {
    Keyring,
    File,
    #[default]
    Auto,
}

impl SecretBackend {
    pub fn parse(value: &str) -> Result<Self, StorageError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "keyring" => Ok(Self::Keyring),
            "file" => Ok(Self::File),
            "auto" | "" => Ok(Self::Auto),
            other => Err(StorageError::UnknownBackend(other.to_string())),
        }
    }

    pub fn from_env() -> Result<Self, StorageError> {
        match std::env::var("KIOSK_SECRET_BACKEND") {
            Ok(value) => Self::parse(&value),
            Err(_) => Ok(Self::default()),
        }
    }
}

pub struct CredentialStore {
    backend: Backend,
}

enum Backend {
    Keyring(Entry),
    File(EncryptedFileStore),
}

impl CredentialStore {
    pub fn new() -> Result<Self, StorageError> {
        Self::with_backend(SecretBackend::from_env()?)
    }

    pub fn with_backend(preference: SecretBackend) -> Result<Self, StorageError> {
        let backend = match preference {
            SecretBackend::Keyring => Backend::Keyring(Entry::new(SERVICE_NAME, API_KEY_NAME)?),
            SecretBackend::File => Backend::File(EncryptedFileStore::new()?),
            SecretBackend::Auto => match usable_keyring() {
                Some(entry) => Backend::Keyring(entry),
                None => {
                    tracing::info!("keyring unavailable, using encrypted file storage");
                    Backend::File(EncryptedFileStore::new()?)
                }
            },
        };
        Ok(Self { backend })
    }

    /// File-backed store rooted at `dir`.
    pub fn file_in(dir: &Path) -> Result<Self, StorageError> {
        Ok(Self {
            backend: Backend::File(EncryptedFileStore::in_dir(dir)?),
        })
    }

    pub fn backend_name(&self) -> &'static str {
        match &self.backend {
            Backend::Keyring(_) => "keyring",
            Backend::File(_) => "file",
        }
    }

    pub fn save_api_key(&self, api_key: &str) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Keyring(entry) => {
                entry.set_password(api_key)?;
                Ok(())
            }
            Backend::File(store) => Ok(store.save(api_key)?),
        }
    }

    pub fn get_api_key(&self) -> Result<String, StorageError> {
        match &self.backend {
            Backend::Keyring(entry) => match entry.get_password() {
                Ok(api_key) => Ok(api_key),
                Err(keyring::Error::NoEntry) => Err(StorageError::NotFound),
                Err(err) => Err(StorageError::KeyringError(err)),
            },
            Backend::File(store) => Ok(store.load()?),
        }
    }

    pub fn delete_api_key(&self) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Keyring(entry) => match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(err) => Err(StorageError::KeyringError(err)),
            },
            Backend::File(store) => Ok(store.delete()?),
        }
    }

    pub fn has_api_key(&self) -> bool {
        match &self.backend {
            Backend::Keyring(entry) => entry.get_password().is_ok(),
            Backend::File(store) => store.has_secret(),
        }
    }
}

/// A keyring entry that answers lookups, missing or not.
fn usable_keyring() -> Option<Entry> {
    let entry = Entry::new(SERVICE_NAME, API_KEY_NAME).ok()?;
    match entry.get_password() {
        Ok(_) | Err(keyring::Error::NoEntry) => Some(entry),
        Err(err) => {
            tracing::debug!(error = %err, "keyring check failed");
            None
        }
    }
}
