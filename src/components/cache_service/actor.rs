use super::store::CacheStore;
use crate::components::ics_feed::models::Document;
use crate::error::{cache_error, FeedResult};
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, info, warn};

/// Commands that can be sent to the cache actor
pub enum CacheCommand {
    Get(String, mpsc::Sender<Option<Document>>),
    Put(String, Document, mpsc::Sender<FeedResult<()>>),
    Invalidate(String, mpsc::Sender<FeedResult<()>>),
    Shutdown,
}

/// The cache actor; owns the store and serializes access to it.
///
/// Filesystem work runs on the blocking pool so the runtime keeps serving
/// other tasks while an entry is read or written.
pub struct CacheActor {
    store: CacheStore,
    command_rx: mpsc::Receiver<CacheCommand>,
}

/// Handle for communicating with the cache actor
#[derive(Clone)]
pub struct CacheHandle {
    command_tx: mpsc::Sender<CacheCommand>,
}

impl CacheHandle {
    /// Spawn an actor over `store` and return its handle
    pub fn spawn(store: CacheStore) -> Self {
        let (mut actor, handle) = CacheActor::new(store);
        tokio::spawn(async move {
            actor.run().await;
        });
        handle
    }

    /// Fresh document for `url`, if any
    pub async fn get(&self, url: &str) -> FeedResult<Option<Document>> {
        let (response_tx, mut response_rx) = mpsc::channel(1);
        self.command_tx
            .send(CacheCommand::Get(url.to_string(), response_tx))
            .await
            .map_err(|e| cache_error(&format!("Actor mailbox error: {}", e)))?;

        response_rx
            .recv()
            .await
            .ok_or_else(|| cache_error("Response channel closed"))
    }

    /// Store `document` for `url`, replacing any previous entry
    pub async fn put(&self, url: &str, document: Document) -> FeedResult<()> {
        let (response_tx, mut response_rx) = mpsc::channel(1);
        self.command_tx
            .send(CacheCommand::Put(url.to_string(), document, response_tx))
            .await
            .map_err(|e| cache_error(&format!("Actor mailbox error: {}", e)))?;

        response_rx
            .recv()
            .await
            .ok_or_else(|| cache_error("Response channel closed"))?
    }

    /// Drop the entry for `url`
    pub async fn invalidate(&self, url: &str) -> FeedResult<()> {
        let (response_tx, mut response_rx) = mpsc::channel(1);
        self.command_tx
            .send(CacheCommand::Invalidate(url.to_string(), response_tx))
            .await
            .map_err(|e| cache_error(&format!("Actor mailbox error: {}", e)))?;

        response_rx
            .recv()
            .await
            .ok_or_else(|| cache_error("Response channel closed"))?
    }

    /// Shutdown the actor
    pub async fn shutdown(&self) -> FeedResult<()> {
        let _ = self.command_tx.send(CacheCommand::Shutdown).await;
        Ok(())
    }
}

impl CacheActor {
    /// Create a new actor and return its handle
    pub fn new(store: CacheStore) -> (Self, CacheHandle) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let actor = Self { store, command_rx };
        (actor, CacheHandle { command_tx })
    }

    /// Start the actor's processing loop
    pub async fn run(&mut self) {
        info!(dir = %self.store.dir().display(), "Cache actor started");

        while let Some(cmd) = self.command_rx.recv().await {
            match cmd {
                CacheCommand::Get(url, response_tx) => {
                    let store = self.store.clone();
                    let key = url.clone();
                    let entry = task::spawn_blocking(move || store.get(&key))
                        .await
                        .unwrap_or_else(|e| {
                            warn!(url = %url, error = %e, "Cache lookup task failed");
                            None
                        });
                    debug!(url = %url, hit = entry.is_some(), "Cache lookup");
                    let _ = response_tx.send(entry.map(|e| e.document)).await;
                }
                CacheCommand::Put(url, document, response_tx) => {
                    let store = self.store.clone();
                    let result = task::spawn_blocking(move || store.put(&url, document))
                        .await
                        .unwrap_or_else(|e| {
                            Err(cache_error(&format!("Cache write task failed: {}", e)))
                        });
                    let _ = response_tx.send(result).await;
                }
                CacheCommand::Invalidate(url, response_tx) => {
                    let store = self.store.clone();
                    let result = task::spawn_blocking(move || store.invalidate(&url))
                        .await
                        .unwrap_or_else(|e| {
                            Err(cache_error(&format!("Cache delete task failed: {}", e)))
                        });
                    let _ = response_tx.send(result).await;
                }
                CacheCommand::Shutdown => {
                    info!("Cache actor shutting down");
                    break;
                }
            }
        }

        info!("Cache actor shut down");
    }
}
