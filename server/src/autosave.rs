//! Periodic background saves for the `run` command.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::stores::{SaveSummary, Snapshot, Stores};

/// Save `state` every `every` until `shutdown` resolves, then save once
/// more. Returns the number of save passes.
///
/// Saves block on file and database I/O, so each pass runs on the blocking
/// pool against a clone of the snapshot taken under the lock.
pub async fn run_until<F>(
    stores: Arc<Stores>,
    state: Arc<Mutex<Snapshot>>,
    every: Duration,
    shutdown: F,
) -> anyhow::Result<u64>
where
    F: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; state was just loaded.
    ticker.tick().await;
    tokio::pin!(shutdown);

    info!(interval_secs = every.as_secs_f64(), "Autosave running");
    let mut passes = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                save_pass(&stores, &state).await?;
                passes += 1;
            }
            () = &mut shutdown => break,
        }
    }

    info!("Shutting down, writing final save");
    let summary = save_pass(&stores, &state).await?;
    if summary.failed() > 0 {
        warn!(failed = summary.failed(), "Final save left some stores unpersisted");
    }
    Ok(passes + 1)
}

async fn save_pass(stores: &Arc<Stores>, state: &Mutex<Snapshot>) -> anyhow::Result<SaveSummary> {
    let snapshot = state.lock().await.clone();
    let stores = Arc::clone(stores);
    tokio::task::spawn_blocking(move || stores.save(&snapshot))
        .await
        .context("save task panicked")
}
