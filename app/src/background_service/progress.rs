use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use infrastructure::sync::timer;
use service::prelude::*;

/// Resolves once every job is terminal, reporting how many are left every `interval`.
pub async fn wait_for_completion(manager: Arc<DispatchManager>, interval: Duration) {
    timer::new(interval, || {
        let remaining = manager.in_progress();
        async move {
            if remaining == 0 {
                return ControlFlow::Break(());
            }
            tracing::info!("{remaining} jobs are pending completion");
            ControlFlow::Continue(())
        }
    })
    .await
}
