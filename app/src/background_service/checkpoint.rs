use std::sync::Arc;
use std::time::Duration;

use infrastructure::sync::timer;
use service::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::infrastructure::database::JsonCheckpoint;

/// Saves the registry every `interval` until `shutdown`. Failed saves are logged and retried on
/// the next tick.
pub async fn checkpoint(
    manager: Arc<DispatchManager>,
    store: Arc<JsonCheckpoint>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    timer::until_cancelled(interval, shutdown, || async {
        if let Err(e) = store.save(&manager.registry().snapshot()).await {
            tracing::error!("Cannot save checkpoint: {e:#}");
        }
    })
    .await;
}
