//! CELLAR - Encryption at Rest
//! Value-log frames are sealed with AES-256-GCM data keys. Data keys are
//! themselves sealed with the caller's master key and persisted in the key
//! registry, then replaced once they outlive the rotation period.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::ENCRYPTION_KEY_SIZE;
use crate::error::EngineError;

/// Registry file name inside the key directory.
pub const REGISTRY_FILE: &str = "KEYREGISTRY";

const NONCE_LEN: usize = 12;

/// Known plaintext used to check that the supplied master key is right.
const SANITY_TEXT: &[u8] = b"Hello Cellar";

/// Key id meaning "not encrypted".
pub const PLAINTEXT_KEY_ID: u64 = 0;

#[derive(Serialize, Deserialize)]
struct RegistryFile {
    sanity_nonce: Vec<u8>,
    sanity: Vec<u8>,
    keys: Vec<SealedDataKey>,
}

#[derive(Clone, Serialize, Deserialize)]
struct SealedDataKey {
    id: u64,
    created_at: u64,
    nonce: Vec<u8>,
    sealed: Vec<u8>,
}

struct DataKey {
    created_at: u64,
    cipher: Aes256Gcm,
}

/// Master key plus the data keys it protects.
pub struct KeyRegistry {
    master: Option<Aes256Gcm>,
    path: Option<PathBuf>,
    rotation: Duration,
    keys: BTreeMap<u64, DataKey>,
    sealed: Vec<SealedDataKey>,
    sanity_nonce: Vec<u8>,
    sanity: Vec<u8>,
}

impl KeyRegistry {
    /// Registry for an unencrypted, unpersisted engine.
    pub fn plaintext() -> Self {
        Self {
            master: None,
            path: None,
            rotation: Duration::ZERO,
            keys: BTreeMap::new(),
            sealed: Vec::new(),
            sanity_nonce: Vec::new(),
            sanity: SANITY_TEXT.to_vec(),
        }
    }

    /// Load (or initialise) the registry in `dir`. With no `dir` the
    /// registry lives in memory only.
    pub fn open(
        dir: Option<&Path>,
        master_key: Option<&[u8]>,
        rotation: Duration,
        read_only: bool,
    ) -> Result<Self, EngineError> {
        let master = master_key.map(cipher_for).transpose()?;
        let mut registry = Self {
            master,
            path: dir.map(|d| d.join(REGISTRY_FILE)),
            rotation,
            ..Self::plaintext()
        };

        if let Some(master) = &registry.master {
            let (nonce, sealed) = seal_with(master, SANITY_TEXT)?;
            registry.sanity_nonce = nonce;
            registry.sanity = sealed;
        }

        let path = match registry.path.clone() {
            Some(path) => path,
            None => return Ok(registry),
        };

        if path.exists() {
            let file: RegistryFile = bincode::deserialize(&fs::read(&path)?)?;
            registry.load(file)?;
        } else if !read_only {
            registry.persist()?;
        }
        Ok(registry)
    }

    fn load(&mut self, file: RegistryFile) -> Result<(), EngineError> {
        match &self.master {
            Some(master) => {
                let sanity = open_with(master, &file.sanity_nonce, &file.sanity)
                    .map_err(|_| EngineError::Encryption("invalid encryption key".into()))?;
                if sanity != SANITY_TEXT {
                    return Err(EngineError::Encryption("invalid encryption key".into()));
                }
                for sealed in &file.keys {
                    let raw = open_with(master, &sealed.nonce, &sealed.sealed)?;
                    self.keys.insert(
                        sealed.id,
                        DataKey {
                            created_at: sealed.created_at,
                            cipher: cipher_for(&raw)?,
                        },
                    );
                }
            }
            None => {
                if file.sanity != SANITY_TEXT {
                    return Err(EngineError::Encryption(
                        "database is encrypted, an encryption key is required".into(),
                    ));
                }
            }
        }
        self.sanity_nonce = file.sanity_nonce;
        self.sanity = file.sanity;
        self.sealed = file.keys;
        Ok(())
    }

    fn persist(&self) -> Result<(), EngineError> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };
        let file = RegistryFile {
            sanity_nonce: self.sanity_nonce.clone(),
            sanity: self.sanity.clone(),
            keys: self.sealed.clone(),
        };
        let tmp = path.with_extension("tmp");
        let mut out = File::create(&tmp)?;
        out.write_all(&bincode::serialize(&file)?)?;
        out.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn is_encrypted(&self) -> bool {
        self.master.is_some()
    }

    pub fn data_key_count(&self) -> usize {
        self.keys.len()
    }

    /// The data key to seal with, generating a new one when the newest is
    /// older than the rotation period.
    fn current_key(&mut self, now: u64) -> Result<Option<u64>, EngineError> {
        let master = match &self.master {
            Some(master) => master,
            None => return Ok(None),
        };
        if let Some((&id, key)) = self.keys.iter().next_back() {
            if now.saturating_sub(key.created_at) < self.rotation.as_secs() {
                return Ok(Some(id));
            }
        }

        let mut raw = [0u8; ENCRYPTION_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut raw);
        let id = self.keys.keys().next_back().copied().unwrap_or(PLAINTEXT_KEY_ID) + 1;
        let (nonce, sealed) = seal_with(master, &raw)?;
        self.sealed.push(SealedDataKey {
            id,
            created_at: now,
            nonce,
            sealed,
        });
        self.keys.insert(
            id,
            DataKey {
                created_at: now,
                cipher: cipher_for(&raw)?,
            },
        );
        self.persist()?;
        Ok(Some(id))
    }

    /// Seal `plaintext`; returns `(key_id, nonce, body)`.
    pub fn seal(&mut self, plaintext: &[u8], now: u64) -> Result<(u64, Vec<u8>, Vec<u8>), EngineError> {
        match self.current_key(now)? {
            None => Ok((PLAINTEXT_KEY_ID, Vec::new(), plaintext.to_vec())),
            Some(id) => {
                let key = self
                    .keys
                    .get(&id)
                    .ok_or_else(|| EngineError::Encryption(format!("unknown data key {}", id)))?;
                let (nonce, body) = seal_with(&key.cipher, plaintext)?;
                Ok((id, nonce, body))
            }
        }
    }

    /// Reverse of [`KeyRegistry::seal`].
    pub fn unseal(&self, key_id: u64, nonce: &[u8], body: &[u8]) -> Result<Vec<u8>, EngineError> {
        if key_id == PLAINTEXT_KEY_ID {
            return Ok(body.to_vec());
        }
        let key = self
            .keys
            .get(&key_id)
            .ok_or_else(|| EngineError::Encryption(format!("unknown data key {}", key_id)))?;
        open_with(&key.cipher, nonce, body)
    }
}

fn cipher_for(key: &[u8]) -> Result<Aes256Gcm, EngineError> {
    Aes256Gcm::new_from_slice(key).map_err(|_| {
        EngineError::Encryption(format!(
            "encryption key must be {} bytes, got {}",
            ENCRYPTION_KEY_SIZE,
            key.len()
        ))
    })
}

fn seal_with(cipher: &Aes256Gcm, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), EngineError> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let body = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| EngineError::Encryption("seal failed".into()))?;
    Ok((nonce.to_vec(), body))
}

fn open_with(cipher: &Aes256Gcm, nonce: &[u8], body: &[u8]) -> Result<Vec<u8>, EngineError> {
    if nonce.len() != NONCE_LEN {
        return Err(EngineError::Encryption("malformed nonce".into()));
    }
    cipher
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|_| EngineError::Encryption("unseal failed, wrong key or corrupted data".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: [u8; 32] = [7u8; 32];
    const WEEK: Duration = Duration::from_secs(7 * 24 * 3600);

    #[test]
    fn test_plaintext_passthrough() {
        let mut registry = KeyRegistry::plaintext();
        let (id, nonce, body) = registry.seal(b"data", 0).unwrap();
        assert_eq!(id, PLAINTEXT_KEY_ID);
        assert!(nonce.is_empty());
        assert_eq!(body, b"data");
        assert_eq!(registry.unseal(id, &nonce, &body).unwrap(), b"data");
    }

    #[test]
    fn test_seal_unseal_with_master_key() {
        let mut registry = KeyRegistry::open(None, Some(&MASTER), WEEK, false).unwrap();
        let (id, nonce, body) = registry.seal(b"secret", 100).unwrap();
        assert_ne!(id, PLAINTEXT_KEY_ID);
        assert_ne!(body, b"secret");
        assert_eq!(registry.unseal(id, &nonce, &body).unwrap(), b"secret");
    }

    #[test]
    fn test_rotation_creates_new_data_key() {
        let mut registry = KeyRegistry::open(None, Some(&MASTER), Duration::from_secs(10), false).unwrap();
        let (first, _, _) = registry.seal(b"a", 100).unwrap();
        let (same, _, _) = registry.seal(b"b", 105).unwrap();
        let (rotated, nonce, body) = registry.seal(b"c", 111).unwrap();
        assert_eq!(first, same);
        assert_eq!(rotated, first + 1);
        assert_eq!(registry.data_key_count(), 2);
        assert_eq!(registry.unseal(rotated, &nonce, &body).unwrap(), b"c");
    }

    #[test]
    fn test_registry_persists_and_checks_master_key() {
        let dir = tempfile::tempdir().unwrap();
        let (id, nonce, body) = {
            let mut registry = KeyRegistry::open(Some(dir.path()), Some(&MASTER), WEEK, false).unwrap();
            registry.seal(b"persisted", 1).unwrap()
        };

        let registry = KeyRegistry::open(Some(dir.path()), Some(&MASTER), WEEK, false).unwrap();
        assert_eq!(registry.unseal(id, &nonce, &body).unwrap(), b"persisted");

        let wrong = [9u8; 32];
        assert!(matches!(
            KeyRegistry::open(Some(dir.path()), Some(&wrong), WEEK, false),
            Err(EngineError::Encryption(_))
        ));
        assert!(matches!(
            KeyRegistry::open(Some(dir.path()), None, WEEK, false),
            Err(EngineError::Encryption(_))
        ));
    }

    #[test]
    fn test_bad_master_key_length() {
        assert!(matches!(
            KeyRegistry::open(None, Some(&[1u8; 16]), WEEK, false),
            Err(EngineError::Encryption(_))
        ));
    }
}
