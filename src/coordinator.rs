//! Single-writer coordinator (§5): serializes every metadata-mutating
//! operation for one logical filesystem through a single actor task, the
//! same `Sender`/`Receiver`-wrapper, command/reply-channel shape the
//! original RPC dispatch pipeline used, generalized from network
//! procedures to virtual-filesystem operations.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use sha2::{Digest, Sha256};

use crate::config::Tier;
use crate::error::{Error, Result};
use crate::metadata::transaction::TransactionOptions;
use crate::metadata::{EntryPatch, EntryType, FileEntry, MetadataStore, NewBlob, NewEntry};
use crate::tier::TieredPlacementEngine;
use crate::watch::bridge::WatchBridge;
use crate::watch::coalescer::{EventKind, FsEvent, FsEventMetadata};

/// One virtual-filesystem request, paired with the channel its result is
/// delivered on.
pub enum Command {
    WriteFile { path: String, bytes: Vec<u8>, reply: oneshot::Sender<Result<Tier>> },
    ReadFile { path: String, reply: oneshot::Sender<Result<Vec<u8>>> },
    DeleteFile { path: String, reply: oneshot::Sender<Result<()>> },
    Move { src: String, dst: String, reply: oneshot::Sender<Result<Tier>> },
    Copy { src: String, dst: String, tier: Option<Tier>, reply: oneshot::Sender<Result<Tier>> },
    MakeDirectory { path: String, mode: i64, reply: oneshot::Sender<Result<FileEntry>> },
    Stat { path: String, reply: oneshot::Sender<Result<FileEntry>> },
    ListDirectory { path: String, reply: oneshot::Sender<Result<Vec<FileEntry>>> },
    Promote { path: String, tier: Tier, reply: oneshot::Sender<Result<()>> },
    Demote { path: String, tier: Tier, reply: oneshot::Sender<Result<()>> },
}

/// Cloneable front-end handle; every clone enqueues onto the same
/// single-writer actor behind typed `*Sender` wrappers.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| Error::Transient { reason: "coordinator shut down".into() })?;
        reply_rx.await.map_err(|_| Error::Transient { reason: "coordinator dropped reply".into() })?
    }

    pub async fn write_file(&self, path: &str, bytes: Vec<u8>) -> Result<Tier> {
        let path = path.to_string();
        self.call(|reply| Command::WriteFile { path, bytes, reply }).await
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let path = path.to_string();
        self.call(|reply| Command::ReadFile { path, reply }).await
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.call(|reply| Command::DeleteFile { path, reply }).await
    }

    pub async fn move_file(&self, src: &str, dst: &str) -> Result<Tier> {
        let (src, dst) = (src.to_string(), dst.to_string());
        self.call(|reply| Command::Move { src, dst, reply }).await
    }

    pub async fn copy_file(&self, src: &str, dst: &str, tier: Option<Tier>) -> Result<Tier> {
        let (src, dst) = (src.to_string(), dst.to_string());
        self.call(|reply| Command::Copy { src, dst, tier, reply }).await
    }

    pub async fn make_directory(&self, path: &str, mode: i64) -> Result<FileEntry> {
        let path = path.to_string();
        self.call(|reply| Command::MakeDirectory { path, mode, reply }).await
    }

    pub async fn stat(&self, path: &str) -> Result<FileEntry> {
        let path = path.to_string();
        self.call(|reply| Command::Stat { path, reply }).await
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = path.to_string();
        self.call(|reply| Command::ListDirectory { path, reply }).await
    }

    pub async fn promote(&self, path: &str, tier: Tier) -> Result<()> {
        let path = path.to_string();
        self.call(|reply| Command::Promote { path, tier, reply }).await
    }

    pub async fn demote(&self, path: &str, tier: Tier) -> Result<()> {
        let path = path.to_string();
        self.call(|reply| Command::Demote { path, tier, reply }).await
    }
}

/// Owns the metadata store, placement engine, and watch bridge for one
/// logical filesystem and processes commands one at a time off its inbox,
/// matching §5's "metadata operations for a single logical filesystem
/// are strictly serialized" requirement.
pub struct Coordinator {
    inbox: mpsc::Receiver<Command>,
    metadata: Arc<MetadataStore>,
    placement: Arc<TieredPlacementEngine>,
    watch: Arc<WatchBridge>,
}

impl Coordinator {
    pub fn spawn(
        metadata: Arc<MetadataStore>,
        placement: Arc<TieredPlacementEngine>,
        watch: Arc<WatchBridge>,
        channel_capacity: usize,
    ) -> CoordinatorHandle {
        let (tx, rx) = mpsc::channel(channel_capacity);
        tokio::spawn(Self { inbox: rx, metadata, placement, watch }.run());
        CoordinatorHandle { commands: tx }
    }

    async fn run(mut self) {
        while let Some(command) = self.inbox.recv().await {
            self.dispatch(command).await;
        }
    }

    async fn dispatch(&self, command: Command) {
        match command {
            Command::WriteFile { path, bytes, reply } => {
                let result = self.write_file(&path, bytes).await;
                let _ = reply.send(result);
            }
            Command::ReadFile { path, reply } => {
                let _ = reply.send(self.placement.read_file(&path).await);
            }
            Command::DeleteFile { path, reply } => {
                let result = self.delete_file(&path).await;
                let _ = reply.send(result);
            }
            Command::Move { src, dst, reply } => {
                let result = self.move_file(&src, &dst).await;
                let _ = reply.send(result);
            }
            Command::Copy { src, dst, tier, reply } => {
                let result = self.copy_file(&src, &dst, tier).await;
                let _ = reply.send(result);
            }
            Command::MakeDirectory { path, mode, reply } => {
                let result = self.make_directory(&path, mode).await;
                if result.is_ok() {
                    self.emit(&path, EventKind::Create, Some(FsEventMetadata { size: Some(0), mtime: None, is_directory: Some(true) }));
                }
                let _ = reply.send(result);
            }
            Command::Stat { path, reply } => {
                let result = self
                    .metadata
                    .get_by_path(&path)
                    .await
                    .and_then(|opt| opt.ok_or_else(|| Error::not_found(path.clone())));
                let _ = reply.send(result);
            }
            Command::ListDirectory { path, reply } => {
                let result = async {
                    let parent = self
                        .metadata
                        .get_by_path(&path)
                        .await?
                        .ok_or_else(|| Error::not_found(path.clone()))?;
                    if parent.entry_type != EntryType::Directory {
                        return Err(Error::not_directory(path.clone()));
                    }
                    self.metadata.get_children(parent.id).await
                }
                .await;
                let _ = reply.send(result);
            }
            Command::Promote { path, tier, reply } => {
                let result = self.placement.promote(&path, tier).await;
                let _ = reply.send(result);
            }
            Command::Demote { path, tier, reply } => {
                let result = self.placement.demote(&path, tier).await;
                let _ = reply.send(result);
            }
        }
    }

    /// Resolves the parent directory id for `path`, failing if the parent
    /// doesn't exist (the root has no parent).
    async fn resolve_parent_id(&self, path: &str) -> Result<Option<i64>> {
        let (parent_path, _) = crate::path::split(path);
        match parent_path {
            Some(p) => {
                let parent = self.metadata.get_by_path(&p).await?.ok_or_else(|| Error::not_found(p))?;
                Ok(Some(parent.id))
            }
            None => Ok(None),
        }
    }

    async fn make_directory(&self, path: &str, mode: i64) -> Result<FileEntry> {
        let (_, name) = crate::path::split(path);
        let parent_id = self.resolve_parent_id(path).await?;
        self.metadata
            .transactions
            .transaction(TransactionOptions::default(), || async {
                self.metadata
                    .create_entry(NewEntry {
                        path: path.to_string(),
                        name: name.clone(),
                        parent_id,
                        entry_type: EntryType::Directory,
                        mode,
                        uid: 0,
                        gid: 0,
                        size: 0,
                        blob_id: None,
                        link_target: None,
                        tier: Tier::Hot,
                    })
                    .await
            })
            .await?;
        self.metadata.get_by_path(path).await?.ok_or_else(|| Error::not_found(path.to_string()))
    }

    /// Writes `bytes` to `path`, acquiring/releasing blob references and
    /// updating the metadata row as one atomic unit (§4.5, §5) — a failure
    /// partway through (e.g. `create_entry` after `acquire_blob`) rolls back
    /// the whole mutation rather than leaving a dangling refcount.
    async fn write_file(&self, path: &str, bytes: Vec<u8>) -> Result<Tier> {
        let previous = self.metadata.get_by_path(path).await?;
        let tier = self.placement.write_file(path, &bytes).await?;
        let blob_id = content_blob_id(&bytes);
        let size = bytes.len() as i64;
        let size_metadata = Some(FsEventMetadata { size: Some(size), mtime: None, is_directory: Some(false) });
        let kind = if previous.is_some() { EventKind::Modify } else { EventKind::Create };

        self.metadata
            .transactions
            .transaction(TransactionOptions::default(), || async {
                match &previous {
                    None => {
                        self.acquire_blob(&blob_id, tier, size).await?;
                        let (_, name) = crate::path::split(path);
                        let parent_id = self.resolve_parent_id(path).await?;
                        self.metadata
                            .create_entry(NewEntry {
                                path: path.to_string(),
                                name,
                                parent_id,
                                entry_type: EntryType::File,
                                mode: 0o644,
                                uid: 0,
                                gid: 0,
                                size,
                                blob_id: Some(blob_id.clone()),
                                link_target: None,
                                tier,
                            })
                            .await?;
                    }
                    Some(entry) => {
                        if entry.blob_id.as_deref() != Some(blob_id.as_str()) {
                            self.acquire_blob(&blob_id, tier, size).await?;
                            if let Some(old_blob_id) = &entry.blob_id {
                                self.release_blob(old_blob_id).await?;
                            }
                        }
                        self.metadata
                            .update_entry(
                                entry.id,
                                EntryPatch {
                                    size: Some(size),
                                    blob_id: Some(Some(blob_id.clone())),
                                    tier: Some(tier),
                                    ..Default::default()
                                },
                            )
                            .await?;
                    }
                }
                Ok(())
            })
            .await?;

        self.emit(path, kind, size_metadata);
        Ok(tier)
    }

    async fn delete_file(&self, path: &str) -> Result<()> {
        let entry = self.metadata.get_by_path(path).await?.ok_or_else(|| Error::not_found(path.to_string()))?;
        self.placement.delete_file(path).await?;
        self.metadata
            .transactions
            .transaction(TransactionOptions::default(), || async {
                self.metadata.delete_entry(entry.id).await?;
                if let Some(blob_id) = &entry.blob_id {
                    self.release_blob(blob_id).await?;
                }
                Ok(())
            })
            .await?;
        self.emit(path, EventKind::Delete, None);
        Ok(())
    }

    /// Registers a fresh blob or, if its content hash already exists, adds
    /// a reference to it instead (§3 BlobRef content-addressing).
    async fn acquire_blob(&self, id: &str, tier: Tier, size: i64) -> Result<()> {
        match self.metadata.get_blob(id).await? {
            Some(_) => self.metadata.increment_blob_ref_count(id).await,
            None => {
                self.metadata
                    .register_blob(NewBlob { id: id.to_string(), tier, size, checksum: Some(id.to_string()) })
                    .await
            }
        }
    }

    /// Drops a reference, deleting the blob row once the count reaches zero.
    async fn release_blob(&self, id: &str) -> Result<()> {
        if self.metadata.decrement_blob_ref_count(id).await? {
            self.metadata.delete_blob(id).await?;
        }
        Ok(())
    }

    async fn move_file(&self, src: &str, dst: &str) -> Result<Tier> {
        let entry = self.metadata.get_by_path(src).await?.ok_or_else(|| Error::not_found(src.to_string()))?;
        let tier = self.placement.move_file(src, dst).await?;
        let (_, name) = crate::path::split(dst);
        let parent_id = self.resolve_parent_id(dst).await?;
        self.metadata
            .transactions
            .transaction(TransactionOptions::default(), || async {
                self.metadata.rename_entry(entry.id, dst, &name, parent_id).await
            })
            .await?;
        self.emit(dst, EventKind::Rename { from: src.to_string() }, None);
        Ok(tier)
    }

    async fn copy_file(&self, src: &str, dst: &str, tier: Option<Tier>) -> Result<Tier> {
        let entry = self.metadata.get_by_path(src).await?.ok_or_else(|| Error::not_found(src.to_string()))?;
        let tier = self.placement.copy_file(src, dst, tier).await?;
        let (_, name) = crate::path::split(dst);
        let parent_id = self.resolve_parent_id(dst).await?;
        self.metadata
            .transactions
            .transaction(TransactionOptions::default(), || async {
                if let Some(blob_id) = &entry.blob_id {
                    self.metadata.increment_blob_ref_count(blob_id).await?;
                }
                self.metadata
                    .create_entry(NewEntry {
                        path: dst.to_string(),
                        name: name.clone(),
                        parent_id,
                        entry_type: entry.entry_type,
                        mode: entry.mode,
                        uid: entry.uid,
                        gid: entry.gid,
                        size: entry.size,
                        blob_id: entry.blob_id.clone(),
                        link_target: entry.link_target.clone(),
                        tier,
                    })
                    .await
            })
            .await?;
        self.emit(dst, EventKind::Create, Some(FsEventMetadata { size: Some(entry.size), mtime: None, is_directory: Some(false) }));
        Ok(tier)
    }

    fn emit(&self, path: &str, kind: EventKind, metadata: Option<FsEventMetadata>) {
        self.watch.notify(FsEvent { path: path.to_string(), kind, timestamp_ms: 0, metadata });
    }
}

/// Content address for a blob (§3 Blob: "content-addressed" storage unit).
fn content_blob_id(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}
