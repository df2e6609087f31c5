use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Quiescence window: the callback fires once this long after the last
/// write in a burst.
const DEBOUNCE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("failed to create file watcher: {0}")]
    Create(#[source] notify::Error),
    #[error("failed to watch {path}: {source}")]
    Watch {
        path: String,
        #[source]
        source: notify::Error,
    },
}

/// Debounced watcher over the strategy-runner configuration and strategy
/// files.
///
/// Write events reset a one-second timer; when it expires the callback
/// runs once, on a freshly spawned task so it may perform a full restart.
/// Create/delete/metadata events are ignored.
pub struct ConfigWatcher {
    cancel: CancellationToken,
    // Dropping the notify handle closes the OS watch; held until stop.
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    pub fn new<P: AsRef<Path>>(
        paths: &[P],
        on_change: Arc<dyn Fn() + Send + Sync>,
    ) -> Result<Self, WatcherError> {
        let (tx, rx) = mpsc::channel::<()>(16);

        let mut watcher = notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if is_write_event(&event.kind) {
                        let _ = tx.blocking_send(());
                    }
                }
                Err(err) => tracing::error!(error = %err, "watcher error"),
            },
        )
        .map_err(WatcherError::Create)?;

        for path in paths {
            let path = path.as_ref();
            watcher
                .watch(path, RecursiveMode::NonRecursive)
                .map_err(|source| WatcherError::Watch {
                    path: path.display().to_string(),
                    source,
                })?;
            tracing::info!(path = %path.display(), "watching for changes");
        }

        let cancel = CancellationToken::new();
        tokio::spawn(debounce_loop(rx, on_change, cancel.clone()));

        Ok(Self {
            cancel,
            _watcher: watcher,
        })
    }

    /// Cancel any pending timer and stop delivering callbacks. The
    /// underlying OS watch closes when the watcher is dropped.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn is_write_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any)
    )
}

async fn debounce_loop(
    mut rx: mpsc::Receiver<()>,
    on_change: Arc<dyn Fn() + Send + Sync>,
    cancel: CancellationToken,
) {
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            event = rx.recv() => {
                if event.is_none() {
                    break;
                }
                tracing::info!("file change detected, debouncing");
                deadline = Some(tokio::time::Instant::now() + DEBOUNCE);
            }

            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                deadline = None;
                tracing::info!("change burst settled, invoking reload callback");
                let callback = on_change.clone();
                tokio::spawn(async move { callback() });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn burst_of_writes_fires_callback_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strategy.yaml");
        std::fs::write(&path, "interface: any\n").unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = fired.clone();
        let watcher = ConfigWatcher::new(
            &[&path],
            Arc::new(move || {
                fired_in_cb.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        // Burst of writes inside the debounce window
        for _ in 0..4 {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&path)
                .unwrap();
            writeln!(file, "gamefilter: false").unwrap();
            file.sync_all().unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        tokio::time::sleep(DEBOUNCE + Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        watcher.stop();
    }

    #[tokio::test]
    async fn stop_suppresses_pending_callback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strategy.yaml");
        std::fs::write(&path, "interface: any\n").unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = fired.clone();
        let watcher = ConfigWatcher::new(
            &[&path],
            Arc::new(move || {
                fired_in_cb.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        std::fs::write(&path, "interface: eth0\n").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        watcher.stop();

        tokio::time::sleep(DEBOUNCE + Duration::from_millis(500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn metadata_events_are_not_write_events() {
        use notify::event::MetadataKind;
        assert!(!is_write_event(&EventKind::Modify(ModifyKind::Metadata(
            MetadataKind::Permissions
        ))));
        assert!(!is_write_event(&EventKind::Create(
            notify::event::CreateKind::File
        )));
        assert!(is_write_event(&EventKind::Modify(ModifyKind::Any)));
    }
}
