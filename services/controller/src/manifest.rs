//! Desired-state store over a directory of JSON manifests.
//!
//! Each `*.json` file holds one manifest object or an array of them:
//!
//! ```json
//! {
//!   "kind": "Deployment",
//!   "namespace": "default",
//!   "name": "web",
//!   "ownership": "full",
//!   "auto_sync": true,
//!   "spec": { "replicas": 3 }
//! }
//! ```
//!
//! Every field other than the identity and policy fields is the resource
//! document. The directory is rescanned on every read; generations are bumped
//! only when a manifest's content hash changes.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use steward_id::{Generation, ResourceKey, ResourceKind};
use steward_reconcile::{
    DesiredBatch, DesiredChange, DesiredResource, DesiredSnapshot, DesiredStateStore, Ownership,
    ResumeToken, SpecHash, StoreError,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Change-feed entries kept for resuming readers.
const CHANGE_RETENTION: usize = 1024;

/// Errors for a single manifest file. These never fail the store as a whole.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid resource key in {path}: {source}")]
    Key {
        path: PathBuf,
        #[source]
        source: steward_id::KeyError,
    },

    #[error("{key} is declared in both {first} and {second}")]
    Duplicate {
        key: ResourceKey,
        first: PathBuf,
        second: PathBuf,
    },
}

fn default_auto_sync() -> bool {
    true
}

/// One manifest entry as written on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,

    #[serde(default)]
    pub ownership: Option<Ownership>,

    #[serde(default = "default_auto_sync")]
    pub auto_sync: bool,

    /// The resource document.
    #[serde(flatten)]
    pub document: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestFile {
    Many(Vec<Manifest>),
    One(Box<Manifest>),
}

/// A declaration parsed from disk.
#[derive(Debug, Clone)]
struct Declared {
    spec: Value,
    ownership: Ownership,
    auto_sync: bool,
    source: PathBuf,
}

impl Declared {
    fn hash(&self) -> SpecHash {
        let ownership = serde_json::to_value(&self.ownership).unwrap_or(Value::Null);
        SpecHash::from_json(&serde_json::json!({
            "spec": self.spec,
            "ownership": ownership,
            "auto_sync": self.auto_sync,
        }))
    }
}

#[derive(Debug)]
struct Tracked {
    resource: DesiredResource,
    hash: SpecHash,
    source: PathBuf,
}

#[derive(Debug, Default)]
struct ScanState {
    resources: BTreeMap<ResourceKey, Tracked>,

    /// Last generation per key, kept after removal so re-declaring moves forward.
    generations: BTreeMap<ResourceKey, Generation>,

    log: VecDeque<(u64, DesiredChange)>,
    sequence: u64,

    /// Sequences at or below this value are no longer in `log`.
    compacted_through: u64,
}

impl ScanState {
    fn bump(&mut self, key: &ResourceKey) -> Generation {
        let generation = self.generations.get(key).copied().unwrap_or_default().next();
        self.generations.insert(key.clone(), generation);
        generation
    }

    fn record(&mut self, change: DesiredChange) {
        self.sequence += 1;
        self.log.push_back((self.sequence, change));
        while self.log.len() > CHANGE_RETENTION {
            if let Some((seq, _)) = self.log.pop_front() {
                self.compacted_through = seq;
            }
        }
    }
}

/// A [`DesiredStateStore`] backed by a manifest directory.
pub struct ManifestStore {
    dir: PathBuf,
    default_ownership: Ownership,
    state: Mutex<ScanState>,
}

impl ManifestStore {
    pub fn new(dir: impl Into<PathBuf>, default_ownership: Ownership) -> Self {
        Self {
            dir: dir.into(),
            default_ownership,
            state: Mutex::new(ScanState::default()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Rescan the directory and record changes. Returns the number of changes.
    pub async fn rescan(&self) -> Result<usize, StoreError> {
        let (declared, failed) = self.read_dir().await?;

        let mut state = self.state.lock().await;
        let mut changes = 0;

        let vanished: Vec<ResourceKey> = state
            .resources
            .iter()
            .filter(|(key, tracked)| {
                // Keep declarations from files that failed to parse this round.
                !declared.contains_key(*key) && !failed.contains(&tracked.source)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in vanished {
            state.resources.remove(&key);
            let generation = state.bump(&key);
            info!(key = %key, generation = %generation, "Manifest removed");
            state.record(DesiredChange::Removed { key, generation });
            changes += 1;
        }

        for (key, declared) in declared {
            let hash = declared.hash();
            if let Some(tracked) = state.resources.get_mut(&key) {
                tracked.source = declared.source.clone();
                if tracked.hash == hash {
                    continue;
                }
            }

            let generation = state.bump(&key);
            let resource = DesiredResource {
                key: key.clone(),
                spec: declared.spec,
                generation,
                ownership: declared.ownership,
                auto_sync: declared.auto_sync,
            };
            debug!(key = %key, generation = %generation, hash = %hash, "Manifest changed");
            state.resources.insert(
                key,
                Tracked {
                    resource: resource.clone(),
                    hash,
                    source: declared.source,
                },
            );
            state.record(DesiredChange::Upserted(resource));
            changes += 1;
        }

        Ok(changes)
    }

    async fn read_dir(
        &self,
    ) -> Result<(BTreeMap<ResourceKey, Declared>, Vec<PathBuf>), StoreError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(|e| {
            StoreError::Unavailable(format!("cannot read {}: {e}", self.dir.display()))
        })?;

        let mut paths = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if path.extension().is_some_and(|ext| ext == "json") {
                        paths.push(path);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    return Err(StoreError::Unavailable(format!(
                        "cannot list {}: {e}",
                        self.dir.display()
                    )))
                }
            }
        }
        paths.sort();

        let mut declared: BTreeMap<ResourceKey, Declared> = BTreeMap::new();
        let mut failed = Vec::new();
        for path in paths {
            match self.read_file(&path).await {
                Ok(items) => {
                    for (key, item) in items {
                        if let Some(existing) = declared.get(&key) {
                            let err = ManifestError::Duplicate {
                                key: key.clone(),
                                first: existing.source.clone(),
                                second: path.clone(),
                            };
                            warn!(error = %err, "Ignoring duplicate manifest");
                            continue;
                        }
                        declared.insert(key, item);
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Skipping manifest file");
                    failed.push(path);
                }
            }
        }

        Ok((declared, failed))
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<(ResourceKey, Declared)>, ManifestError> {
        let raw = tokio::fs::read(path).await.map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ManifestFile =
            serde_json::from_slice(&raw).map_err(|source| ManifestError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let manifests = match file {
            ManifestFile::Many(manifests) => manifests,
            ManifestFile::One(manifest) => vec![*manifest],
        };

        manifests
            .into_iter()
            .map(|manifest| {
                let key = ResourceKey::new(manifest.kind, &manifest.namespace, &manifest.name)
                    .map_err(|source| ManifestError::Key {
                        path: path.to_path_buf(),
                        source,
                    })?;
                let declared = Declared {
                    spec: Value::Object(manifest.document),
                    ownership: manifest
                        .ownership
                        .unwrap_or_else(|| self.default_ownership.clone()),
                    auto_sync: manifest.auto_sync,
                    source: path.to_path_buf(),
                };
                Ok((key, declared))
            })
            .collect()
    }
}

#[async_trait]
impl DesiredStateStore for ManifestStore {
    async fn list(&self) -> Result<DesiredSnapshot, StoreError> {
        self.rescan().await?;
        let state = self.state.lock().await;
        Ok(DesiredSnapshot {
            resources: state
                .resources
                .values()
                .map(|tracked| tracked.resource.clone())
                .collect(),
            token: ResumeToken::new(state.sequence),
        })
    }

    async fn changes(&self, after: ResumeToken, limit: usize) -> Result<DesiredBatch, StoreError> {
        self.rescan().await?;
        let state = self.state.lock().await;
        if after.sequence() < state.compacted_through {
            return Err(StoreError::Expired(after));
        }

        let changes: Vec<(u64, DesiredChange)> = state
            .log
            .iter()
            .filter(|(seq, _)| *seq > after.sequence())
            .take(limit)
            .cloned()
            .collect();
        let next = changes
            .last()
            .map(|(seq, _)| ResumeToken::new(*seq))
            .unwrap_or(after);

        Ok(DesiredBatch {
            changes: changes.into_iter().map(|(_, change)| change).collect(),
            next,
        })
    }
}
