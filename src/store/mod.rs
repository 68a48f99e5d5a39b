//! Conversation/code store.
//!
//! The pipeline only sees the [`ConversationStore`] trait; [`SqliteStore`]
//! is the bundled implementation backed by [`db::IterationDb`].

pub mod db;

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::models::{ChatMessage, DurableEvent, FileMap, InsertOutcome, NewDurableEvent};

pub use db::{DbHandle, IterationDb};

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Up to `limit` most recent messages, oldest first.
    async fn fetch_messages(&self, project_id: &str, limit: usize) -> Result<Vec<ChatMessage>>;

    /// Files of the latest accepted code snapshot (empty if none).
    async fn fetch_latest_snapshot(&self, project_id: &str) -> Result<FileMap>;

    async fn append_message(&self, project_id: &str, message: ChatMessage) -> Result<()>;

    async fn insert_durable_event(&self, event: NewDurableEvent) -> Result<InsertOutcome>;

    async fn list_durable_events(
        &self,
        project_id: &str,
        version_id: Option<&str>,
    ) -> Result<Vec<DurableEvent>>;
}

#[derive(Clone)]
pub struct SqliteStore {
    db: DbHandle,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let db = IterationDb::new(path).context("Failed to initialize iteration database")?;
        Ok(Self::new(DbHandle::new(db)))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(DbHandle::new(IterationDb::new_in_memory()?)))
    }

    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub fn handle(&self) -> &DbHandle {
        &self.db
    }

    /// Record a code snapshot; accepted snapshots become the assembler's source.
    pub async fn save_snapshot(
        &self,
        project_id: &str,
        version_id: Option<&str>,
        files: FileMap,
        accepted: bool,
    ) -> Result<i64> {
        let project_id = project_id.to_string();
        let version_id = version_id.map(str::to_string);
        self.db
            .call(move |db| db.save_snapshot(&project_id, version_id.as_deref(), &files, accepted))
            .await
    }

    /// Mark a draft snapshot accepted. `false` when the project has no such snapshot.
    pub async fn accept_snapshot(&self, project_id: &str, snapshot_id: i64) -> Result<bool> {
        let project_id = project_id.to_string();
        self.db
            .call(move |db| db.accept_snapshot(&project_id, snapshot_id))
            .await
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn fetch_messages(&self, project_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let project_id = project_id.to_string();
        self.db
            .call(move |db| db.recent_messages(&project_id, limit))
            .await
    }

    async fn fetch_latest_snapshot(&self, project_id: &str) -> Result<FileMap> {
        let project_id = project_id.to_string();
        self.db
            .call(move |db| db.latest_accepted_snapshot(&project_id))
            .await
    }

    async fn append_message(&self, project_id: &str, message: ChatMessage) -> Result<()> {
        let project_id = project_id.to_string();
        self.db
            .call(move |db| db.append_message(&project_id, &message).map(|_| ()))
            .await
    }

    async fn insert_durable_event(&self, event: NewDurableEvent) -> Result<InsertOutcome> {
        self.db.call(move |db| db.insert_durable_event(&event)).await
    }

    async fn list_durable_events(
        &self,
        project_id: &str,
        version_id: Option<&str>,
    ) -> Result<Vec<DurableEvent>> {
        let project_id = project_id.to_string();
        let version_id = version_id.map(str::to_string);
        self.db
            .call(move |db| db.list_durable_events(&project_id, version_id.as_deref()))
            .await
    }
}
