use std::{
    fs::{self, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, aead::Aead};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

const STORAGE_DIR: &str = "kiosk-sync";
const SECRET_FILENAME: &str = "master.key";
const CIPHER_FILENAME: &str = "api_key.enc";
const FILE_MAGIC: &[u8; 4] = b"KSYN";
const FILE_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const SECRET_LEN: usize = 32;
const HEADER_LEN: usize = FILE_MAGIC.len() + 1 + NONCE_LEN + std::mem::size_of::<u32>();

/// API key sealed with ChaCha20-Poly1305 in the user config directory.
pub struct EncryptedFileStore {
    key: [u8; 32],
    cipher_path: PathBuf,
}

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("configuration directory unavailable for credential storage")]
    MissingConfigDir,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("master secret at {0} is malformed")]
    BadSecret(PathBuf),
    #[error("encryption error")]
    Encryption,
    #[error("decryption error")]
    Decryption,
    #[error("stored credential is missing")]
    Missing,
}

impl EncryptedFileStore {
    pub fn new() -> Result<Self, FileStoreError> {
        let mut dir = dirs::config_dir().ok_or(FileStoreError::MissingConfigDir)?;
        dir.push(STORAGE_DIR);
        Self::in_dir(&dir)
    }

    /// Opens the store under `dir`, creating the master secret on first use.
    pub fn in_dir(dir: &Path) -> Result<Self, FileStoreError> {
        fs::create_dir_all(dir)?;
        let secret = load_or_create_secret(&dir.join(SECRET_FILENAME))?;
        Ok(Self {
            key: derive_key(&secret),
            cipher_path: dir.join(CIPHER_FILENAME),
        })
    }

    pub fn has_secret(&self) -> bool {
        self.cipher_path.exists()
    }

    pub fn save(&self, secret: &str) -> Result<(), FileStoreError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), secret.as_bytes())
            .map_err(|_| FileStoreError::Encryption)?;
        let ciphertext_len =
            u32::try_from(ciphertext.len()).map_err(|_| FileStoreError::Encryption)?;

        let mut payload = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        payload.extend_from_slice(FILE_MAGIC);
        payload.push(FILE_VERSION);
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext_len.to_be_bytes());
        payload.extend_from_slice(&ciphertext);

        write_private(&self.cipher_path, &payload)
    }

    pub fn load(&self) -> Result<String, FileStoreError> {
        let mut data = Vec::new();
        match OpenOptions::new().read(true).open(&self.cipher_path) {
            Ok(mut file) => file.read_to_end(&mut data)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(FileStoreError::Missing);
            }
            Err(err) => return Err(err.into()),
        };

        if data.len() < HEADER_LEN
            || &data[..FILE_MAGIC.len()] != FILE_MAGIC
            || data[FILE_MAGIC.len()] != FILE_VERSION
        {
            return Err(FileStoreError::Decryption);
        }

        let nonce_start = FILE_MAGIC.len() + 1;
        let nonce_end = nonce_start + NONCE_LEN;
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&data[nonce_end..HEADER_LEN]);
        let ciphertext_len = u32::from_be_bytes(len_bytes) as usize;
        let Some(ciphertext) = data.get(HEADER_LEN..HEADER_LEN + ciphertext_len) else {
            return Err(FileStoreError::Decryption);
        };

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&data[nonce_start..nonce_end]), ciphertext)
            .map_err(|_| FileStoreError::Decryption)?;
        String::from_utf8(plaintext).map_err(|_| FileStoreError::Decryption)
    }

    pub fn delete(&self) -> Result<(), FileStoreError> {
        match fs::remove_file(&self.cipher_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn load_or_create_secret(path: &Path) -> Result<Vec<u8>, FileStoreError> {
    match fs::read(path) {
        Ok(secret) if secret.len() == SECRET_LEN => Ok(secret),
        Ok(_) => Err(FileStoreError::BadSecret(path.to_path_buf())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let mut secret = vec![0u8; SECRET_LEN];
            OsRng.fill_bytes(&mut secret);
            write_private(path, &secret)?;
            tracing::info!(path = %path.display(), "created credential master secret");
            Ok(secret)
        }
        Err(err) => Err(err.into()),
    }
}

fn write_private(path: &Path, data: &[u8]) -> Result<(), FileStoreError> {
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

fn derive_key(secret: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    let digest = Sha256::digest(secret);
    key.copy_from_slice(&digest);
    key
}

#[cfg(test)]
impl EncryptedFileStore {
    pub fn with_secret_for_tests(secret: &[u8], cipher_path: PathBuf) -> Self {
        Self {
            key: derive_key(secret),
            cipher_path,
        }
    }
}
