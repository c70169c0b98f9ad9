//! Payload encryption for private file content.
//!
//! Every seal uses a fresh AES-256-GCM content key; the content key itself
//! comes back wrapped under the provider's master key, so the wrapped form
//! can travel next to the ciphertext without exposing the master key.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};

/// Output of a seal: ciphertext plus the wrapped content key the caller
/// must hold on to for `decrypt`.
#[derive(Debug, Clone)]
pub struct SealedContent {
    pub ciphertext: Vec<u8>,
    pub exported_key: Vec<u8>,
}

#[async_trait]
pub trait EncryptionProvider: Send + Sync {
    async fn encrypt(&self, data: &[u8]) -> Result<SealedContent>;
    async fn decrypt(&self, data: &[u8], exported_key: &[u8]) -> Result<Vec<u8>>;
}

/// Passthrough provider for deployments that store plaintext.
#[derive(Debug, Default, Clone)]
pub struct NoopEncryption;

#[async_trait]
impl EncryptionProvider for NoopEncryption {
    async fn encrypt(&self, data: &[u8]) -> Result<SealedContent> {
        Ok(SealedContent {
            ciphertext: data.to_vec(),
            exported_key: Vec::new(),
        })
    }

    async fn decrypt(&self, data: &[u8], _exported_key: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// AES-256-GCM provider. Ciphertexts carry their random 12-byte nonce as a
/// prefix, so no nonce bookkeeping exists outside the blob itself.
pub struct AesGcmEncryption {
    master_key: Vec<u8>,
}

impl AesGcmEncryption {
    pub fn new(master_key: &[u8]) -> Result<Self> {
        if master_key.len() != 32 {
            return Err(anyhow!("master key must be 32 bytes"));
        }
        Ok(Self {
            master_key: master_key.to_vec(),
        })
    }

    fn master(&self) -> Result<LessSafeKey> {
        Ok(LessSafeKey::new(UnboundKey::new(&AES_256_GCM, &self.master_key)?))
    }
}

fn seal(key: &LessSafeKey, data: &[u8]) -> Result<Vec<u8>> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = data.to_vec();
    key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)?;

    let mut blob = nonce_bytes.to_vec();
    blob.extend_from_slice(&in_out);
    Ok(blob)
}

fn open(key: &LessSafeKey, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN + AES_256_GCM.tag_len() {
        return Err(anyhow!("ciphertext too short"));
    }
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)?;

    let mut in_out = ciphertext.to_vec();
    let plaintext_len = key.open_in_place(nonce, Aad::empty(), &mut in_out)?.len();
    in_out.truncate(plaintext_len);
    Ok(in_out)
}

#[async_trait]
impl EncryptionProvider for AesGcmEncryption {
    async fn encrypt(&self, data: &[u8]) -> Result<SealedContent> {
        let mut content_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut content_key);

        let sealing = LessSafeKey::new(UnboundKey::new(&AES_256_GCM, &content_key)?);
        let ciphertext = seal(&sealing, data)?;
        let exported_key = seal(&self.master()?, &content_key)?;
        Ok(SealedContent {
            ciphertext,
            exported_key,
        })
    }

    async fn decrypt(&self, data: &[u8], exported_key: &[u8]) -> Result<Vec<u8>> {
        let content_key = open(&self.master()?, exported_key)?;
        let opening = LessSafeKey::new(UnboundKey::new(&AES_256_GCM, &content_key)?);
        open(&opening, data)
    }
}
