use crate::{MemoryCache, MessageCache, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_common::{Message, Since};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Append-only JSON-lines cache file with an in-memory read index.
///
/// Every stored message is appended as one JSON line before it becomes
/// visible to readers. The file is replayed on open and rewritten after a
/// prune removes anything, so it never holds more than the retention window
/// plus whatever arrived since the last manager cycle.
///
/// Lines that fail to parse are skipped with a warning.
#[derive(Debug)]
pub struct FileCache {
    path: PathBuf,
    index: MemoryCache,
    // Serializes appends with compaction so a rewrite never loses a line.
    writer: Mutex<File>,
}

impl FileCache {
    pub async fn open(path: impl Into<PathBuf>, retention: Option<Duration>) -> Result<Self> {
        let path = path.into();
        let index = MemoryCache::new(retention);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let mut skipped = 0usize;
                for line in contents.lines().filter(|line| !line.trim().is_empty()) {
                    match serde_json::from_str::<Message>(line) {
                        Ok(message) => index.insert(Arc::new(message)),
                        Err(err) => {
                            skipped += 1;
                            tracing::warn!(error = %err, path = %path.display(), "skipping corrupt cache line");
                        }
                    }
                }
                tracing::info!(
                    path = %path.display(),
                    loaded = index.snapshot().len(),
                    skipped,
                    "message cache loaded"
                );
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let file = open_append(&path).await?;
        Ok(Self {
            path,
            index,
            writer: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // The append handle for the rewritten file is opened before the rename,
    // so any failure leaves `writer` pointing at the file that still lives
    // at `path`.
    async fn compact(&self, writer: &mut File) -> Result<()> {
        let tmp = self.path.with_extension("compact");
        let mut contents = Vec::new();
        for message in self.index.snapshot() {
            serde_json::to_writer(&mut contents, &*message)?;
            contents.push(b'\n');
        }
        let replacement = async {
            tokio::fs::write(&tmp, &contents).await?;
            let file = open_append(&tmp).await?;
            tokio::fs::rename(&tmp, &self.path).await?;
            Ok::<_, std::io::Error>(file)
        }
        .await;
        match replacement {
            Ok(file) => {
                *writer = file;
                Ok(())
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(err.into())
            }
        }
    }
}

async fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

#[async_trait]
impl MessageCache for FileCache {
    async fn store(&self, message: &Message) -> Result<()> {
        if !message.is_message() {
            return Ok(());
        }
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        self.index.insert(Arc::new(message.clone()));
        Ok(())
    }

    async fn since(&self, topic: &str, since: Since) -> Result<Vec<Arc<Message>>> {
        self.index.since(topic, since).await
    }

    async fn prune(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        let removed = self.index.prune_before(now);
        if removed > 0 {
            self.compact(&mut writer).await?;
            tracing::debug!(removed, path = %self.path.display(), "message cache compacted");
        }
        Ok(removed)
    }

    async fn count(&self, topic: &str) -> Result<usize> {
        self.index.count(topic).await
    }

    async fn total(&self) -> Result<usize> {
        self.index.total().await
    }

    async fn topics(&self) -> Result<Vec<String>> {
        self.index.topics().await
    }

    fn retention(&self) -> Option<Duration> {
        self.index.retention()
    }
}
