//! Deployment settings, carried through the core as an explicit object.
//!
//! The ledger holds the authoritative copy; the drive re-reads it on every
//! `SettingsChange` and re-selects its storage provider. Nothing in the
//! crate reads configuration from globals.

use serde::{Deserialize, Serialize};

/// Which storage backend file content lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    S3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    pub backend: StorageBackend,
    #[serde(default)]
    pub s3_bucket: String,
    #[serde(default)]
    pub s3_endpoint: Option<String>,
    #[serde(default)]
    pub s3_region: Option<String>,
}

impl Settings {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn s3(bucket: impl Into<String>) -> Self {
        Self {
            backend: StorageBackend::S3,
            s3_bucket: bucket.into(),
            s3_endpoint: None,
            s3_region: None,
        }
    }
}
