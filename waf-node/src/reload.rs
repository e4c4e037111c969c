use crate::error::{Result, WafError};
use crate::waf::Waf;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to sit on a change event before reloading; editors and atomic
/// writers commonly produce bursts of events per save.
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Watches every rule file and blacklist file and triggers a full reload
/// on change. Dropping the handle stops watching.
pub struct ReloadWatcher {
    _watcher: RecommendedWatcher,
    _task: JoinHandle<()>,
}

/// Start watching the firewall's configured files. Change events from all
/// watched paths funnel into one channel; a coalescing consumer debounces
/// bursts and then re-parses everything.
pub fn start(waf: Arc<Waf>, mut shutdown: watch::Receiver<bool>) -> Result<ReloadWatcher> {
    let (tx, mut rx) = mpsc::channel::<()>(16);

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        match res {
            Ok(event) => {
                if matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                ) {
                    // Full when a burst is already pending; nothing is lost
                    let _ = tx.try_send(());
                }
            }
            Err(e) => warn!(error = %e, "File watcher error"),
        }
    })
    .map_err(|e| WafError::Config(format!("failed to create file watcher: {e}")))?;

    for path in waf.watched_files() {
        watcher
            .watch(Path::new(&path), RecursiveMode::NonRecursive)
            .map_err(|e| WafError::Config(format!("failed to watch '{path}': {e}")))?;
        debug!(file = %path, "Watching for changes");
    }

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(()) => {
                        tokio::time::sleep(DEBOUNCE).await;
                        while rx.try_recv().is_ok() {}

                        info!("Watched file changed, reloading rules and blacklists");
                        if let Err(e) = waf.reload() {
                            warn!(error = %e, "Reload failed");
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    debug!("Reload watcher shutting down");
                    break;
                }
            }
        }
    });

    Ok(ReloadWatcher {
        _watcher: watcher,
        _task: task,
    })
}
