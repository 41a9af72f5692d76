//! SIGHUP-based notifier.
//!
//! Receive side traps SIGHUP and maps it to a reload-all; send side reads
//! the gateway PID from a pid file and signals it. Per-config events are
//! not expressible over a signal, so everything degrades to reload-all.

use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::broadcast;

use super::{ConfigEvent, Notifier, NotifierError, EVENT_CHANNEL_CAPACITY};

/// Notifier backed by UNIX SIGHUP and a PID file.
#[derive(Debug)]
pub struct SignalNotifier {
    pid_file: Option<PathBuf>,
    sender: broadcast::Sender<ConfigEvent>,
}

impl SignalNotifier {
    /// Create a signal notifier.
    ///
    /// `pid_file` is required for sending; receiving installs a SIGHUP
    /// handler for the current process regardless.
    #[must_use]
    pub fn new(pid_file: Option<PathBuf>) -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { pid_file, sender }
    }

    /// Build from `GATEWAY_PID` in the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(std::env::var(crate::ENV_GATEWAY_PID).ok().map(PathBuf::from))
    }

    /// Install the SIGHUP trap; each delivery broadcasts a reload-all.
    ///
    /// Must run inside a tokio runtime. Idempotent per instance in the
    /// sense that a second call installs a second (harmless) trap task.
    #[cfg(unix)]
    pub fn start_receiving(&self) -> Result<(), NotifierError> {
        let mut stream =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
                .map_err(NotifierError::Io)?;
        let sender = self.sender.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                tracing::info!("SIGHUP received, broadcasting reload-all");
                let _ = sender.send(ConfigEvent::reload_all());
            }
        });
        Ok(())
    }

    /// Signals are unavailable off unix; receiving is a setup error there.
    #[cfg(not(unix))]
    pub fn start_receiving(&self) -> Result<(), NotifierError> {
        Err(NotifierError::Unsupported("receive signals on this platform"))
    }

    /// Write this process's PID to the configured pid file so a peer
    /// `reload` invocation can find it.
    pub async fn write_pid_file(&self) -> Result<(), NotifierError> {
        let Some(path) = &self.pid_file else {
            return Err(NotifierError::MissingEnv(crate::ENV_GATEWAY_PID.to_string()));
        };
        tokio::fs::write(path, std::process::id().to_string()).await?;
        Ok(())
    }

    #[cfg(unix)]
    async fn send_sighup(&self) -> Result<(), NotifierError> {
        let Some(path) = &self.pid_file else {
            return Err(NotifierError::MissingEnv(crate::ENV_GATEWAY_PID.to_string()));
        };
        let raw = tokio::fs::read_to_string(path).await?;
        let pid: i32 = raw
            .trim()
            .parse()
            .map_err(|_| NotifierError::Signal(format!("pid file '{}' is not a pid", path.display())))?;
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGHUP)
            .map_err(|e| NotifierError::Signal(format!("kill({pid}, SIGHUP): {e}")))?;
        tracing::debug!(pid, "sent SIGHUP");
        Ok(())
    }
}

#[async_trait]
impl Notifier for SignalNotifier {
    fn can_send(&self) -> bool {
        cfg!(unix) && self.pid_file.is_some()
    }

    fn can_receive(&self) -> bool {
        cfg!(unix)
    }

    async fn notify(&self, _event: ConfigEvent) -> Result<(), NotifierError> {
        // The signal carries no payload; any event collapses to reload-all.
        #[cfg(unix)]
        {
            self.send_sighup().await
        }
        #[cfg(not(unix))]
        {
            Err(NotifierError::Unsupported("send signals on this platform"))
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.sender.subscribe()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::notifier::ConfigEventKind;

    #[tokio::test]
    async fn sighup_to_self_broadcasts_reload_all() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("gateway.pid");
        let notifier = SignalNotifier::new(Some(pid_file));
        notifier.write_pid_file().await.unwrap();
        notifier.start_receiving().unwrap();

        let mut rx = notifier.subscribe();
        notifier.notify(ConfigEvent::reload_all()).await.unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("signal delivered")
            .unwrap();
        assert_eq!(event.kind, ConfigEventKind::ReloadAll);
    }

    #[tokio::test]
    async fn notify_without_pid_file_is_an_error() {
        let notifier = SignalNotifier::new(None);
        assert!(!notifier.can_send());
        assert!(notifier.notify(ConfigEvent::reload_all()).await.is_err());
    }
}
