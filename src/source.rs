//! Graph source collaborator.
//!
//! Definitions are authored elsewhere; the scheduler only consumes raw
//! blobs and loads them through `GraphDefinition::load`. One malformed
//! blob never hides the others.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::warn;

/// One raw definition payload plus where it came from, for diagnostics.
#[derive(Debug, Clone)]
pub struct DefinitionBlob {
    pub origin: String,
    pub payload: Vec<u8>,
}

/// Supplies graph definition payloads to the scheduler loop.
#[async_trait]
pub trait GraphSource: Send + Sync {
    async fn list_definitions(&self) -> Result<Vec<DefinitionBlob>>;
}

/// Reads every `*.json` file in a directory, in filename order.
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl GraphSource for DirectorySource {
    async fn list_definitions(&self) -> Result<Vec<DefinitionBlob>> {
        let mut dir = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("reading definitions from {}", self.root.display()))?;

        let mut paths = Vec::new();
        while let Some(dirent) = dir.next_entry().await? {
            let path = dirent.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut blobs = Vec::new();
        for path in paths {
            match tokio::fs::read(&path).await {
                Ok(payload) => blobs.push(DefinitionBlob {
                    origin: path.display().to_string(),
                    payload,
                }),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable definition");
                }
            }
        }
        Ok(blobs)
    }
}

/// Fixed set of definitions, mainly for tests and embedding.
#[derive(Default)]
pub struct StaticSource {
    blobs: Vec<DefinitionBlob>,
}

impl StaticSource {
    pub fn new(blobs: Vec<DefinitionBlob>) -> Self {
        Self { blobs }
    }

    pub fn from_payloads<I, S>(payloads: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let blobs = payloads
            .into_iter()
            .enumerate()
            .map(|(idx, payload)| DefinitionBlob {
                origin: format!("static-{idx}"),
                payload: payload.into().into_bytes(),
            })
            .collect();
        Self { blobs }
    }
}

#[async_trait]
impl GraphSource for StaticSource {
    async fn list_definitions(&self) -> Result<Vec<DefinitionBlob>> {
        Ok(self.blobs.clone())
    }
}
