use anyhow::{Result, bail};
use async_trait::async_trait;
use notify::{
    Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher,
    event::{CreateKind, ModifyKind},
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
    time::{Duration, sleep},
};
use tracing::{error, warn};

/// Something that can be hot-reloaded from files in a directory.
#[async_trait]
pub trait WatchedType: Send + Sync + 'static {
    fn is_relevant(&self, path: &Path) -> bool;
    async fn on_create_or_modify(&self, path: &Path) -> Result<()>;

    async fn on_remove(&self, path: &Path) -> Result<()>;

    async fn reload(&self, path: &Path) -> Result<()> {
        self.on_create_or_modify(path).await
    }
}

/// Polls a directory and forwards relevant create/modify/remove events to a
/// [`WatchedType`]. Dropping it (or calling `shutdown`) stops the dispatch task.
pub struct DirectoryWatcher {
    _watcher: PollWatcher,
    dispatch: JoinHandle<()>,
}

impl DirectoryWatcher {
    /// Start watching `dir`. With `initial_scan`, every relevant file already
    /// present is loaded before this returns; failed loads are retried when
    /// `enable_retry` is set.
    pub async fn new(
        dir: PathBuf,
        watched: Arc<dyn WatchedType>,
        poll_interval: Duration,
        initial_scan: bool,
        enable_retry: bool,
    ) -> Result<DirectoryWatcher> {
        if !dir.exists() {
            let msg = format!("Directory {} does not exist", dir.to_string_lossy());
            warn!(%msg);
            bail!(msg);
        }

        if initial_scan {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| watched.is_relevant(p))
                .collect();
            entries.sort();
            for path in entries {
                try_reload(&watched, &path, enable_retry).await;
            }
        }

        let (tx, rx): (_, UnboundedReceiver<notify::Result<Event>>) =
            tokio::sync::mpsc::unbounded_channel();
        let mut watcher = PollWatcher::new(
            move |res| {
                // receiver gone means we are shutting down
                let _ = tx.send(res);
            },
            Config::default().with_poll_interval(poll_interval),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let dispatch = tokio::spawn(dispatch_events(rx, watched));
        Ok(DirectoryWatcher {
            _watcher: watcher,
            dispatch,
        })
    }

    pub fn shutdown(self) {
        self.dispatch.abort();
    }
}

async fn dispatch_events(mut rx: UnboundedReceiver<notify::Result<Event>>, watched: Arc<dyn WatchedType>) {
    while let Some(res) = rx.recv().await {
        match res {
            Ok(Event {
                kind: EventKind::Create(CreateKind::Any | CreateKind::File)
                    | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any),
                paths,
                ..
            }) => {
                for path in paths.into_iter().filter(|p| watched.is_relevant(p)) {
                    if let Err(e) = watched.on_create_or_modify(&path).await {
                        warn!(?path, ?e, "Failed to handle create/modify");
                    }
                }
            }
            Ok(Event {
                kind: EventKind::Remove(_),
                paths,
                ..
            }) => {
                for path in paths.into_iter().filter(|p| watched.is_relevant(p)) {
                    if let Err(e) = watched.on_remove(&path).await {
                        warn!(?path, ?e, "Failed to handle removal");
                    }
                }
            }
            Err(e) => warn!(?e, "Watcher error"),
            _ => {}
        }
    }
}

async fn try_reload(watched: &Arc<dyn WatchedType>, path: &Path, retry: bool) {
    const MAX_RETRIES: usize = 10;

    for attempt in 0..MAX_RETRIES {
        match watched.reload(path).await {
            Ok(_) => return,
            Err(e) => {
                if !retry || attempt == MAX_RETRIES - 1 {
                    error!("Failed to reload {:?}: {e:?}", path);
                    return;
                }
                warn!("Retrying reload {:?} (attempt {}): {e:?}", path, attempt + 1);
                sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
