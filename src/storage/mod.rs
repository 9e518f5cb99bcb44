// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store adapters.
//!
//! Both sides of a deployment implement [`SyncStore`](traits::SyncStore):
//!
//! | Adapter | Side | Feature |
//! |---------|------|---------|
//! | [`memory::InMemoryStore`] | either (tests, demos) | always |
//! | `elasticsearch::ElasticsearchStore` | B, document index | `elasticsearch` (default) |
//! | `cassandra::CassandraStore` | A, wide-column | `cassandra` |

pub mod memory;
pub mod traits;

#[cfg(feature = "cassandra")]
pub mod cassandra;
#[cfg(feature = "elasticsearch")]
pub mod elasticsearch;

use std::sync::Arc;

use crate::config::{ConfigError, SyncConfig};
use traits::{StorageError, SyncStore};

/// Check that both store sections are present and their adapters compiled in.
///
/// Runs before anything is contacted so a bad deployment fails as a config error.
pub fn check_adapters(config: &SyncConfig) -> Result<(), ConfigError> {
    if config.cassandra.is_none() {
        return Err(ConfigError::Invalid {
            field: "cassandra",
            reason: "section is required".to_string(),
        });
    }
    if config.elasticsearch.is_none() {
        return Err(ConfigError::Invalid {
            field: "elasticsearch",
            reason: "section is required".to_string(),
        });
    }
    if !cfg!(feature = "cassandra") {
        return Err(ConfigError::Invalid {
            field: "cassandra",
            reason: "built without the `cassandra` feature".to_string(),
        });
    }
    if !cfg!(feature = "elasticsearch") {
        return Err(ConfigError::Invalid {
            field: "elasticsearch",
            reason: "built without the `elasticsearch` feature".to_string(),
        });
    }
    Ok(())
}

/// Connect to store A (wide-column).
#[cfg(feature = "cassandra")]
pub async fn connect_a(config: &SyncConfig) -> Result<Arc<dyn SyncStore>, StorageError> {
    let settings = config
        .cassandra
        .as_ref()
        .ok_or_else(|| StorageError::Backend("no cassandra section".into()))?;
    let store =
        cassandra::CassandraStore::connect(settings, config.schema(), config.conditional_write, config.version_unit)
            .await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "cassandra"))]
pub async fn connect_a(_config: &SyncConfig) -> Result<Arc<dyn SyncStore>, StorageError> {
    Err(StorageError::Backend("built without the `cassandra` feature".into()))
}

/// Connect to store B (document index).
#[cfg(feature = "elasticsearch")]
pub async fn connect_b(config: &SyncConfig) -> Result<Arc<dyn SyncStore>, StorageError> {
    let settings = config
        .elasticsearch
        .as_ref()
        .ok_or_else(|| StorageError::Backend("no elasticsearch section".into()))?;
    let store =
        elasticsearch::ElasticsearchStore::connect(settings, config.schema(), config.retry_config().call_timeout)
            .await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "elasticsearch"))]
pub async fn connect_b(_config: &SyncConfig) -> Result<Arc<dyn SyncStore>, StorageError> {
    Err(StorageError::Backend("built without the `elasticsearch` feature".into()))
}
