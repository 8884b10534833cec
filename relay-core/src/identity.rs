//! Per-boat identity: a long-lived RSA keypair and a stable boat id, used by
//! the hub connector to sign `boatId:timestampMillis` identity assertions.
//!
//! The keypair is written once on first boot with restrictive permissions
//! and is read-only thereafter — no other state is persisted by the core.

use std::path::{Path, PathBuf};

use base64::Engine;
use pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rand::rngs::OsRng;
use rsa::pkcs1v15::SigningKey;
use rsa::signature::{SignatureEncoding, Signer};
use sha2::Sha256;
use rsa::RsaPrivateKey;
use spki::{DecodePublicKey, EncodePublicKey};
use tokio::fs;
use tracing::{info, warn};

use crate::error::RelayError;

const KEY_BITS: usize = 2048;

pub struct IdentityCredential {
    pub boat_id: String,
    private_key: RsaPrivateKey,
    public_key_pem: String,
}

impl IdentityCredential {
    /// Load the keypair and boat id from `keys_dir`, generating and persisting
    /// a fresh set on first boot if any of the three files are missing.
    pub async fn load_or_create(keys_dir: &str, configured_boat_id: Option<&str>) -> Result<Self, RelayError> {
        let dir = PathBuf::from(keys_dir);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| RelayError::Config(format!("cannot create keys dir {dir:?}: {e}")))?;

        let priv_path = dir.join("boat_private_key.pem");
        let pub_path = dir.join("boat_public_key.pem");
        let id_path = dir.join("boat_id.txt");

        let boat_id = match configured_boat_id {
            Some(id) => id.to_string(),
            None => load_or_create_boat_id(&id_path).await?,
        };

        if priv_path.exists() && pub_path.exists() {
            let priv_pem = fs::read_to_string(&priv_path)
                .await
                .map_err(|e| RelayError::Config(format!("cannot read {priv_path:?}: {e}")))?;
            let pub_pem = fs::read_to_string(&pub_path)
                .await
                .map_err(|e| RelayError::Config(format!("cannot read {pub_path:?}: {e}")))?;
            let private_key = RsaPrivateKey::from_pkcs8_pem(&priv_pem)
                .map_err(|e| RelayError::Config(format!("corrupt private key at {priv_path:?}: {e}")))?;
            info!("loaded identity keypair from {:?}", dir);
            return Ok(Self { boat_id, private_key, public_key_pem: pub_pem });
        }

        info!("no keypair found in {:?}, generating a new 2048-bit RSA identity", dir);
        let private_key = RsaPrivateKey::new(&mut OsRng, KEY_BITS)
            .map_err(|e| RelayError::Config(format!("failed to generate RSA keypair: {e}")))?;
        let public_key = private_key.to_public_key();

        let priv_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| RelayError::Config(format!("failed to encode private key: {e}")))?;
        let pub_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| RelayError::Config(format!("failed to encode public key: {e}")))?;

        write_private_key_file(&priv_path, priv_pem.as_str()).await?;
        fs::write(&pub_path, pub_pem.as_bytes())
            .await
            .map_err(|e| RelayError::Config(format!("cannot write {pub_path:?}: {e}")))?;

        Ok(Self { boat_id, private_key, public_key_pem: pub_pem })
    }

    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// signature = RSA-SHA256(base64) over the literal string `boatId:timestampMillis`.
    pub fn sign_identity(&self, timestamp_millis: i64) -> String {
        let message = format!("{}:{}", self.boat_id, timestamp_millis);
        let signing_key = SigningKey::<Sha256>::new(self.private_key.clone());
        let signature = signing_key.sign(message.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
    }
}

async fn load_or_create_boat_id(path: &Path) -> Result<String, RelayError> {
    if path.exists() {
        let raw = fs::read_to_string(path)
            .await
            .map_err(|e| RelayError::Config(format!("cannot read {path:?}: {e}")))?;
        let id = raw.trim().to_string();
        if id.is_empty() {
            warn!("boat_id.txt at {:?} is empty, generating a new id", path);
        } else {
            return Ok(id);
        }
    }
    let id = uuid::Uuid::new_v4().to_string();
    fs::write(path, &id)
        .await
        .map_err(|e| RelayError::Config(format!("cannot write {path:?}: {e}")))?;
    Ok(id)
}

#[cfg(unix)]
async fn write_private_key_file(path: &Path, pem: &str) -> Result<(), RelayError> {
    use std::os::unix::fs::PermissionsExt;
    fs::write(path, pem)
        .await
        .map_err(|e| RelayError::Config(format!("cannot write {path:?}: {e}")))?;
    let perms = std::fs::Permissions::from_mode(0o600);
    fs::set_permissions(path, perms)
        .await
        .map_err(|e| RelayError::Config(format!("cannot restrict permissions on {path:?}: {e}")))
}

#[cfg(not(unix))]
async fn write_private_key_file(path: &Path, pem: &str) -> Result<(), RelayError> {
    fs::write(path, pem)
        .await
        .map_err(|e| RelayError::Config(format!("cannot write {path:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generates_and_reloads_stable_identity() {
        let dir = std::env::temp_dir().join(format!("relay-identity-test-{}", uuid::Uuid::new_v4()));
        let cred = IdentityCredential::load_or_create(dir.to_str().unwrap(), Some("boat-42")).await.unwrap();
        assert_eq!(cred.boat_id, "boat-42");
        let sig1 = cred.sign_identity(1_000);

        let reloaded = IdentityCredential::load_or_create(dir.to_str().unwrap(), Some("boat-42")).await.unwrap();
        let sig2 = reloaded.sign_identity(1_000);
        assert_eq!(sig1, sig2, "same key and message must produce the same signature");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
