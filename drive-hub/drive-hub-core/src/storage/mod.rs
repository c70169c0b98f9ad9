//! Content-addressed blob storage behind the drive.
//!
//! `put` hashes the blob and returns the ref that `get` takes back, so the
//! same bytes always land at the same address regardless of backend.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use parking_lot::Mutex;
use ring::digest;
use std::collections::HashMap;


/// Content address of a blob: URL-safe base64 of its SHA-256.
pub fn content_ref(data: &[u8]) -> String {
    let digest = digest::digest(&digest::SHA256, data);
    URL_SAFE_NO_PAD.encode(digest.as_ref())
}

#[async_trait]
pub trait StorageProvider: Send + Sync {
    async fn put(&self, data: Bytes) -> Result<String>;
    async fn get(&self, storage_ref: &str) -> Result<Bytes>;
    async fn exists(&self, storage_ref: &str) -> Result<bool>;
}

/// In-memory store for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryStorage {
    blobs: Mutex<HashMap<String, Bytes>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageProvider for MemoryStorage {
    async fn put(&self, data: Bytes) -> Result<String> {
        let key = content_ref(&data);
        self.blobs.lock().insert(key.clone(), data);
        Ok(key)
    }

    async fn get(&self, storage_ref: &str) -> Result<Bytes> {
        self.blobs
            .lock()
            .get(storage_ref)
            .cloned()
            .ok_or_else(|| anyhow!("no blob at {storage_ref}"))
    }

    async fn exists(&self, storage_ref: &str) -> Result<bool> {
        Ok(self.blobs.lock().contains_key(storage_ref))
    }
}

/// S3-compatible store; object keys are the content refs.
pub struct S3Storage {
    pub client: aws_sdk_s3::Client,
    pub bucket: String,
}

impl S3Storage {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl StorageProvider for S3Storage {
    async fn put(&self, data: Bytes) -> Result<String> {
        let key = content_ref(&data);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(data.to_vec().into())
            .send()
            .await?;
        Ok(key)
    }

    async fn get(&self, storage_ref: &str) -> Result<Bytes> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(storage_ref)
            .send()
            .await?;
        let data = resp.body.collect().await?;
        Ok(data.into_bytes())
    }

    async fn exists(&self, storage_ref: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(storage_ref)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}
