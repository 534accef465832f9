//! Long-lived holder of the embedding model and the on-disk index.
//!
//! Construction returns immediately; the heavy resources (the embedding
//! model above all) load in a background task. The lifecycle is
//! `initializing -> ready | error` and is observable (`status_report`),
//! awaitable (`wait_until_ready`) and enforced: callers hitting a not-ready
//! engine get a distinguished service-unavailable outcome. A coarse async
//! lock serializes structural mutations (repository creation, backup,
//! restore).

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::vector::embedder::Embedder;
use crate::vector::index::{ChunkIndex, FilterClause};
use crate::vector::repo::{CollectionRepo, SearchHit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Initializing,
    Ready,
    Error,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Initializing => "initializing",
            EngineState::Ready => "ready",
            EngineState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub db_path: String,
    pub model: String,
}

pub struct VectorEngine {
    db_path: PathBuf,
    model_name: String,
    error_message: RwLock<Option<String>>,
    state_tx: watch::Sender<EngineState>,
    structural: tokio::sync::Mutex<()>,
    repos: RwLock<HashMap<String, Arc<CollectionRepo>>>,
    embedder: RwLock<Option<Arc<dyn Embedder>>>,
}

impl VectorEngine {
    /// Creates the engine and starts background initialization with the
    /// configured embedding backend.
    pub fn start(db_path: &Path, model_name: &str) -> Arc<Self> {
        let engine = Self::new_initializing(db_path, model_name);
        let task_engine = engine.clone();
        tokio::spawn(async move {
            let model_name = task_engine.model_name.clone();
            let loaded = tokio::task::spawn_blocking(move || load_embedder(&model_name))
                .await
                .map_err(|e| Error::Internal(format!("Embedder load task failed: {}", e)))
                .and_then(|r| r);
            task_engine.finish_init(loaded).await;
        });
        engine
    }

    /// Creates the engine around an already-constructed embedder. Used by
    /// tests and by deployments that disable the ONNX backend.
    pub fn start_with_embedder(db_path: &Path, embedder: Arc<dyn Embedder>) -> Arc<Self> {
        let engine = Self::new_initializing(db_path, embedder.name());
        let task_engine = engine.clone();
        tokio::spawn(async move {
            task_engine.finish_init(Ok(embedder)).await;
        });
        engine
    }

    fn new_initializing(db_path: &Path, model_name: &str) -> Arc<Self> {
        let (state_tx, _) = watch::channel(EngineState::Initializing);
        tracing::info!(
            db_path = %db_path.display(),
            model = model_name,
            "Vector engine created, initialization started in background"
        );
        Arc::new(Self {
            db_path: db_path.to_path_buf(),
            model_name: model_name.to_string(),
            error_message: RwLock::new(None),
            state_tx,
            structural: tokio::sync::Mutex::new(()),
            repos: RwLock::new(HashMap::new()),
            embedder: RwLock::new(None),
        })
    }

    async fn finish_init(&self, loaded: Result<Arc<dyn Embedder>>) {
        match loaded {
            Ok(embedder) => {
                if let Err(e) = tokio::fs::create_dir_all(&self.db_path).await {
                    self.fail_init(format!("Cannot create index directory: {}", e));
                    return;
                }
                *self.embedder.write() = Some(embedder);
                self.state_tx.send_replace(EngineState::Ready);
                tracing::info!("Vector engine is READY");
            }
            Err(e) => self.fail_init(e.to_string()),
        }
    }

    fn fail_init(&self, message: String) {
        tracing::error!(error = %message, "Vector engine initialization failed");
        *self.error_message.write() = Some(message);
        self.state_tx.send_replace(EngineState::Error);
    }

    pub fn state(&self) -> EngineState {
        *self.state_tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == EngineState::Ready
    }

    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            status: self.state().as_str().to_string(),
            error: self.error_message.read().clone(),
            db_path: self.db_path.display().to_string(),
            model: self.model_name.clone(),
        }
    }

    /// Blocks until the lifecycle settles. Returns true only when the
    /// engine reached `ready` within the timeout.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.state_tx.subscribe();
        let settled = async {
            loop {
                match *rx.borrow_and_update() {
                    EngineState::Ready => return true,
                    EngineState::Error => return false,
                    EngineState::Initializing => {}
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, settled).await.unwrap_or(false)
    }

    fn require_ready(&self) -> Result<Arc<dyn Embedder>> {
        match self.state() {
            EngineState::Ready => self
                .embedder
                .read()
                .clone()
                .ok_or_else(|| Error::Internal("Embedder missing in ready state".to_string())),
            EngineState::Error => {
                let message = self
                    .error_message
                    .read()
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string());
                Err(Error::VectorDb(format!("Engine failed to start: {}", message)))
            }
            EngineState::Initializing => {
                Err(Error::ServiceUnavailable("Engine is initializing".to_string()))
            }
        }
    }

    /// Creates a repository or updates the chunking config of an existing
    /// one. Structural mutation, serialized under the coarse lock.
    pub async fn ensure_repository(
        &self,
        name: &str,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Result<Arc<CollectionRepo>> {
        let embedder = self.require_ready()?;
        let _guard = self.structural.lock().await;

        if let Some(repo) = self.repos.read().get(name).cloned() {
            repo.set_chunk_config(chunk_size, chunk_overlap);
            return Ok(repo);
        }

        let collection_dir = self.db_path.join(name);
        let repo_name = name.to_string();
        let repo = tokio::task::spawn_blocking(move || -> Result<CollectionRepo> {
            let index = ChunkIndex::open(&collection_dir.join("chunks.db"))?;
            Ok(CollectionRepo::new(
                &repo_name,
                index,
                embedder,
                chunk_size,
                chunk_overlap,
            ))
        })
        .await
        .map_err(|e| Error::Internal(format!("Repository open task failed: {}", e)))??;

        let repo = Arc::new(repo);
        self.repos.write().insert(name.to_string(), repo.clone());
        tracing::info!(collection = name, chunk_size, chunk_overlap, "Repository ready");
        Ok(repo)
    }

    /// Strict lookup: the collection must have been created first.
    pub fn get_repository(&self, name: &str) -> Result<Arc<CollectionRepo>> {
        self.require_ready()?;
        self.repos.read().get(name).cloned().ok_or_else(|| {
            Error::NotFound(format!(
                "Collection '{}' not found. Create it via the collections API first.",
                name
            ))
        })
    }

    pub fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.repos.read().keys().cloned().collect();
        if let Ok(entries) = std::fs::read_dir(&self.db_path) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
        }
        names.sort();
        names
    }

    /// Upserts a document into a collection on a blocking thread.
    pub async fn upsert(
        &self,
        collection: &str,
        doc_id: &str,
        text: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Vec<String>> {
        let repo = self.get_repository(collection)?;
        let doc_id = doc_id.to_string();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || repo.upsert(&doc_id, &text, metadata))
            .await
            .map_err(|e| Error::Internal(format!("Upsert task failed: {}", e)))?
    }

    /// Runs a filtered similarity search on a blocking thread.
    pub async fn search(
        &self,
        collection: &str,
        query: &str,
        top_n: usize,
        score_threshold: f32,
        filter: Vec<FilterClause>,
    ) -> Result<Vec<SearchHit>> {
        let repo = self.get_repository(collection)?;
        let query = query.to_string();
        tokio::task::spawn_blocking(move || repo.search(&query, top_n, score_threshold, &filter))
            .await
            .map_err(|e| Error::Internal(format!("Search task failed: {}", e)))?
    }

    pub fn delete(&self, collection: &str, doc_id: &str) -> Result<bool> {
        self.get_repository(collection)?.delete(doc_id)
    }

    pub fn clear(&self, collection: &str) -> Result<()> {
        self.get_repository(collection)?.clear()
    }

    pub fn stats(&self, collection: &str) -> Result<u64> {
        self.get_repository(collection)?.count()
    }

    pub fn list_documents(
        &self,
        collection: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<(String, usize)>> {
        self.get_repository(collection)?.list(limit, offset)
    }

    /// Produces a timestamped zip of the whole index directory.
    pub async fn backup(&self) -> Result<PathBuf> {
        self.require_ready()?;
        let _guard = self.structural.lock().await;

        let name = format!(
            "vector_backup_{}.zip",
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        );
        let dest = std::env::temp_dir().join(name);
        let source = self.db_path.clone();
        let dest_clone = dest.clone();
        tokio::task::spawn_blocking(move || zip_directory(&source, &dest_clone))
            .await
            .map_err(|e| Error::Internal(format!("Backup task failed: {}", e)))??;
        tracing::info!(path = %dest.display(), "Vector index backup written");
        Ok(dest)
    }

    /// Replaces the on-disk index with the contents of a backup zip.
    /// All repository handles are dropped; callers re-create collections.
    pub async fn restore(&self, archive_path: &Path) -> Result<()> {
        self.require_ready()?;
        let _guard = self.structural.lock().await;

        self.repos.write().clear();

        let db_path = self.db_path.clone();
        let archive_path = archive_path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            if db_path.exists() {
                std::fs::remove_dir_all(&db_path)?;
            }
            std::fs::create_dir_all(&db_path)?;
            let file = std::fs::File::open(&archive_path)?;
            let mut archive = zip::ZipArchive::new(file)
                .map_err(|e| Error::VectorDb(format!("Invalid backup archive: {}", e)))?;
            archive
                .extract(&db_path)
                .map_err(|e| Error::VectorDb(format!("Restore extraction failed: {}", e)))?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Internal(format!("Restore task failed: {}", e)))??;

        tracing::info!("Vector index restored from backup");
        Ok(())
    }
}

fn load_embedder(model_name: &str) -> Result<Arc<dyn Embedder>> {
    #[cfg(feature = "fastembed-embeddings")]
    {
        let embedder = crate::vector::embedder::FastEmbedder::load(model_name)?;
        Ok(Arc::new(embedder))
    }
    #[cfg(not(feature = "fastembed-embeddings"))]
    {
        tracing::warn!(
            model = model_name,
            "Built without the fastembed backend, using the hash embedder"
        );
        Ok(Arc::new(crate::vector::embedder::HashEmbedder::default()))
    }
}

/// Straight zip of a directory tree, paths relative to the root.
fn zip_directory(source: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::create(dest)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for entry in walkdir::WalkDir::new(source).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        let relative = path
            .strip_prefix(source)
            .map_err(|e| Error::Internal(format!("Backup path error: {}", e)))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let name = relative.to_string_lossy().replace('\\', "/");
        if path.is_dir() {
            writer
                .add_directory(name, options)
                .map_err(|e| Error::VectorDb(format!("Backup write failed: {}", e)))?;
        } else {
            writer
                .start_file(name, options)
                .map_err(|e| Error::VectorDb(format!("Backup write failed: {}", e)))?;
            let bytes = std::fs::read(path)?;
            writer.write_all(&bytes)?;
        }
    }
    writer
        .finish()
        .map_err(|e| Error::VectorDb(format!("Backup finalize failed: {}", e)))?;
    Ok(())
}
