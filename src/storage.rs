//! Credential Storage Module
//!
//! "Remember me" support: keeps a username/password pair between runs so the
//! controller can log straight back in. On Windows the file is sealed with
//! DPAPI; elsewhere it is written as plain JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

const CREDENTIALS_KEY: &str = "credentials";

/// A remembered username/password pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where remembered credentials live.
pub trait CredentialStore: Send + Sync {
    /// Remembered credentials, if any.
    fn credentials(&self) -> Result<Option<Credentials>, StorageError>;

    fn set_credentials(&self, credentials: &Credentials) -> Result<(), StorageError>;

    fn clear_credentials(&self) -> Result<(), StorageError>;
}

/// A store that never remembers anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRemember;

impl CredentialStore for NoRemember {
    fn credentials(&self) -> Result<Option<Credentials>, StorageError> {
        Ok(None)
    }

    fn set_credentials(&self, _credentials: &Credentials) -> Result<(), StorageError> {
        Ok(())
    }

    fn clear_credentials(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// File-backed secure storage
pub struct SecureStorage {
    storage_path: PathBuf,
}

impl SecureStorage {
    /// Storage under the platform's local data directory
    pub fn new() -> Self {
        let storage_path = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("CouchAuth");
        Self::with_dir(storage_path)
    }

    /// Storage rooted at an explicit directory
    pub fn with_dir(storage_path: impl AsRef<Path>) -> Self {
        let storage_path = storage_path.as_ref().to_path_buf();

        if let Err(e) = std::fs::create_dir_all(&storage_path) {
            error!("Failed to create storage directory: {}", e);
        }

        debug!("Secure storage initialized at: {:?}", storage_path);

        Self { storage_path }
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.storage_path.join(format!("{}.dat", key))
    }

    /// Save a value under `key`
    pub fn save<T: Serialize>(&self, key: &str, data: &T) -> Result<(), StorageError> {
        let json = serde_json::to_vec(data).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let sealed = seal(&json)?;

        std::fs::write(self.file_path(key), sealed).map_err(|e| StorageError::Io(e.to_string()))?;

        info!("Saved data for key: {}", key);
        Ok(())
    }

    /// Load the value stored under `key`, `None` when nothing is stored
    pub fn load<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let sealed = match std::fs::read(self.file_path(key)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Io(e.to_string())),
        };

        let json = unseal(&sealed)?;
        serde_json::from_slice(&json)
            .map(Some)
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Delete stored data
    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        let file_path = self.file_path(key);

        if file_path.exists() {
            std::fs::remove_file(&file_path).map_err(|e| StorageError::Io(e.to_string()))?;
            info!("Deleted stored data for key: {}", key);
        }

        Ok(())
    }

    pub fn exists(&self, key: &str) -> bool {
        self.file_path(key).exists()
    }
}

impl Default for SecureStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for SecureStorage {
    fn credentials(&self) -> Result<Option<Credentials>, StorageError> {
        self.load(CREDENTIALS_KEY)
    }

    fn set_credentials(&self, credentials: &Credentials) -> Result<(), StorageError> {
        self.save(CREDENTIALS_KEY, credentials)
    }

    fn clear_credentials(&self) -> Result<(), StorageError> {
        self.delete(CREDENTIALS_KEY)
    }
}

#[cfg(windows)]
fn seal(data: &[u8]) -> Result<Vec<u8>, StorageError> {
    dpapi::transform(data, true).map_err(StorageError::Encryption)
}

#[cfg(windows)]
fn unseal(data: &[u8]) -> Result<Vec<u8>, StorageError> {
    dpapi::transform(data, false).map_err(StorageError::Decryption)
}

#[cfg(not(windows))]
fn seal(data: &[u8]) -> Result<Vec<u8>, StorageError> {
    Ok(data.to_vec())
}

#[cfg(not(windows))]
fn unseal(data: &[u8]) -> Result<Vec<u8>, StorageError> {
    Ok(data.to_vec())
}

#[cfg(windows)]
mod dpapi {
    use windows::Win32::Foundation::{LocalFree, HLOCAL};
    use windows::Win32::Security::Cryptography::{
        CryptProtectData, CryptUnprotectData, CRYPTPROTECT_UI_FORBIDDEN, CRYPT_INTEGER_BLOB,
    };

    /// Protect (`encrypt = true`) or unprotect a blob for the current user.
    pub(super) fn transform(data: &[u8], encrypt: bool) -> Result<Vec<u8>, String> {
        let input = CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        };
        let mut output = CRYPT_INTEGER_BLOB {
            cbData: 0,
            pbData: std::ptr::null_mut(),
        };

        // SAFETY: `input` borrows `data` for the duration of the call and
        // `output` is allocated by DPAPI, copied, then released with LocalFree.
        unsafe {
            let result = if encrypt {
                CryptProtectData(&input, None, None, None, None, CRYPTPROTECT_UI_FORBIDDEN, &mut output)
            } else {
                CryptUnprotectData(&input, None, None, None, None, CRYPTPROTECT_UI_FORBIDDEN, &mut output)
            };

            if result.is_err() {
                let op = if encrypt { "encryption" } else { "decryption" };
                return Err(format!("DPAPI {} failed", op));
            }

            let bytes = std::slice::from_raw_parts(output.pbData, output.cbData as usize).to_vec();
            let _ = LocalFree(HLOCAL(output.pbData as *mut std::ffi::c_void));
            Ok(bytes)
        }
    }
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),
}
