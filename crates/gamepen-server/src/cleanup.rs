use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use gamepen_db::{Database, SweepStats};

/// Background task that drops chat and direct messages older than the
/// retention window.
///
/// The first tick of a tokio interval completes immediately, so one sweep
/// runs at startup before settling into the regular cadence.
pub async fn run_retention_loop(db: Arc<Database>, retention: chrono::Duration, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));

    loop {
        interval.tick().await;

        match sweep_expired(&db, retention).await {
            Ok(stats) => {
                if stats.total() > 0 {
                    info!(
                        "Retention: removed {} messages ({} chat, {} direct)",
                        stats.total(),
                        stats.chat_messages,
                        stats.direct_messages
                    );
                }
            }
            Err(e) => {
                warn!("Retention sweep error: {}", e);
            }
        }
    }
}

pub async fn sweep_expired(db: &Arc<Database>, retention: chrono::Duration) -> anyhow::Result<SweepStats> {
    let cutoff = Utc::now() - retention;
    let db = db.clone();
    tokio::task::spawn_blocking(move || db.delete_messages_before(cutoff)).await?
}
