//! File-watch notifier.
//!
//! The sender rewrites a single JSON event file (temp file + fsync +
//! rename); receivers watch the parent directory, re-read the file on
//! change, and dedupe by content hash since renames can surface as
//! several filesystem events.

use async_trait::async_trait;
use notify::{RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

use super::{ConfigEvent, Notifier, NotifierError, EVENT_CHANNEL_CAPACITY};
use crate::model::hash_blob;

/// Notifier backed by one watched JSON file.
pub struct FileNotifier {
    path: PathBuf,
    sender: broadcast::Sender<ConfigEvent>,
    // Kept alive for the lifetime of the notifier; dropping it stops the watch.
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
    last_hash: std::sync::Arc<Mutex<Option<String>>>,
}

impl std::fmt::Debug for FileNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileNotifier")
            .field("path", &self.path)
            .finish()
    }
}

impl FileNotifier {
    /// Create a notifier around `path`. The file need not exist yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            path: path.into(),
            sender,
            watcher: Mutex::new(None),
            last_hash: std::sync::Arc::new(Mutex::new(None)),
        }
    }

    /// Start watching the event file's directory.
    pub fn start_receiving(&self) -> Result<(), NotifierError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir)?;

        let (fs_tx, mut fs_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let file_name = self.path.file_name().map(std::ffi::OsStr::to_os_string);

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                if let Ok(event) = res {
                    let relevant = event.paths.iter().any(|p| {
                        p.file_name().map(std::ffi::OsStr::to_os_string) == file_name
                    });
                    if relevant {
                        let _ = fs_tx.send(());
                    }
                }
            })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        *self.watcher.lock() = Some(watcher);

        let path = self.path.clone();
        let sender = self.sender.clone();
        let last_hash = self.last_hash.clone();
        tokio::spawn(async move {
            while fs_rx.recv().await.is_some() {
                let Ok(raw) = tokio::fs::read_to_string(&path).await else {
                    continue;
                };
                let hash = hash_blob(&raw);
                {
                    let mut last = last_hash.lock();
                    if last.as_deref() == Some(hash.as_str()) {
                        continue;
                    }
                    *last = Some(hash);
                }
                match serde_json::from_str::<ConfigEvent>(&raw) {
                    Ok(event) => {
                        tracing::debug!(kind = ?event.kind, "file notifier event");
                        let _ = sender.send(event);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "unreadable event file");
                    }
                }
            }
        });
        Ok(())
    }
}

#[async_trait]
impl Notifier for FileNotifier {
    fn can_send(&self) -> bool {
        true
    }

    fn can_receive(&self) -> bool {
        true
    }

    async fn notify(&self, event: ConfigEvent) -> Result<(), NotifierError> {
        let json = serde_json::to_vec_pretty(&event)?;
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        tokio::fs::create_dir_all(&dir).await?;

        let tmp = dir.join(format!(
            ".{}.tmp-{}",
            self.path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy(),
            std::process::id()
        ));
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::McpConfig;
    use crate::notifier::ConfigEventKind;
    use std::time::Duration;

    #[tokio::test]
    async fn write_then_watch_delivers_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");

        let receiver = FileNotifier::new(&path);
        receiver.start_receiving().unwrap();
        let mut rx = receiver.subscribe();

        let sender = FileNotifier::new(&path);
        let config = McpConfig {
            name: "a".to_string(),
            tenant: "t".to_string(),
            ..Default::default()
        };
        sender.notify(ConfigEvent::update(config)).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher fired")
            .unwrap();
        assert_eq!(event.kind, ConfigEventKind::Update);
        assert_eq!(event.config.unwrap().name, "a");
    }

    #[tokio::test]
    async fn duplicate_content_is_deduped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.json");

        let notifier = FileNotifier::new(&path);
        notifier.start_receiving().unwrap();
        let mut rx = notifier.subscribe();

        notifier.notify(ConfigEvent::reload_all()).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("first event")
            .unwrap();
        assert_eq!(first.kind, ConfigEventKind::ReloadAll);

        // Same bytes again: the hash gate swallows it.
        notifier.notify(ConfigEvent::reload_all()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(second.is_err(), "duplicate event should be suppressed");
    }
}
