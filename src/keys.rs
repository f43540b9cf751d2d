//! The long-lived signing key for validation receipts.
//!
//! A 32-byte key is generated on first use and stored with owner-only
//! permissions under `keys/`. Receipts are MAC'd with HMAC-SHA256 over
//! their canonical form; the key fingerprint makes receipts comparable
//! across key generations.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{AtlasError, IoResultExt};

type HmacSha256 = Hmac<Sha256>;

const KEY_LEN: usize = 32;

/// Lowercase hex encoding.
fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Holds the signing key and serialises signature generation.
#[derive(Debug)]
pub struct KeyManager {
    key: Mutex<Vec<u8>>,
    fingerprint: String,
    path: PathBuf,
}

impl KeyManager {
    /// Load the key file, generating one if absent.
    pub fn load_or_create(path: &Path) -> Result<Self, AtlasError> {
        let key = match fs::read(path) {
            Ok(bytes) if bytes.len() == KEY_LEN => bytes,
            Ok(bytes) => {
                return Err(AtlasError::Io {
                    context: format!(
                        "signing key {} has unexpected length {}",
                        path.display(),
                        bytes.len()
                    ),
                    source: std::io::Error::from(std::io::ErrorKind::InvalidData),
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Self::generate_key_file(path)?
            }
            Err(e) => {
                return Err(AtlasError::Io {
                    context: format!("reading {}", path.display()),
                    source: e,
                });
            }
        };

        let digest = Sha256::digest(&key);
        let fingerprint = hex(&digest[..8]);
        Ok(Self {
            key: Mutex::new(key),
            fingerprint,
            path: path.to_path_buf(),
        })
    }

    fn generate_key_file(path: &Path) -> Result<Vec<u8>, AtlasError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).io_context(format!("creating {}", parent.display()))?;
        }
        let mut key = vec![0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        fs::write(path, &key).io_context(format!("writing {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .io_context(format!("restricting {}", path.display()))?;
        }
        log::info!("generated signing key at {}", path.display());
        Ok(key)
    }

    /// First 16 hex chars of SHA-256 over the raw key bytes.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn key_path(&self) -> &Path {
        &self.path
    }

    /// HMAC-SHA256 signature, lowercase hex.
    pub fn sign(&self, bytes: &[u8]) -> String {
        let key = self.key.lock().unwrap_or_else(|e| e.into_inner());
        let mut mac =
            HmacSha256::new_from_slice(&key).expect("HMAC accepts any key length");
        mac.update(bytes);
        hex(&mac.finalize().into_bytes())
    }

    /// Verify a hex signature over `bytes`.
    pub fn verify(&self, bytes: &[u8], signature: &str) -> Result<(), AtlasError> {
        let expected = self.sign(bytes);
        // Constant-time comparison via the MAC itself would need the raw
        // bytes; signatures are short-lived local trust tokens, so a plain
        // comparison on the hex form is the contract here.
        if expected == signature {
            Ok(())
        } else {
            Err(AtlasError::ValidationFailed {
                stage: "signature".into(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_in(dir: &tempfile::TempDir) -> KeyManager {
        KeyManager::load_or_create(&dir.path().join("keys").join("signing.key")).unwrap()
    }

    #[test]
    fn test_key_generated_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(&dir);
        assert!(manager.key_path().is_file());
        assert_eq!(manager.fingerprint().len(), 16);
    }

    #[test]
    fn test_key_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let first = manager_in(&dir);
        let second = manager_in(&dir);
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.sign(b"payload"), second.sign(b"payload"));
    }

    #[test]
    fn test_sign_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(&dir);
        let sig = manager.sign(b"canonical form");
        manager.verify(b"canonical form", &sig).unwrap();
        assert!(manager.verify(b"tampered form", &sig).is_err());
        assert!(manager.verify(b"canonical form", "00ff").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let manager = manager_in(&dir);
        let mode = fs::metadata(manager.key_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_truncated_key_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signing.key");
        fs::write(&path, b"short").unwrap();
        assert!(KeyManager::load_or_create(&path).is_err());
    }
}
