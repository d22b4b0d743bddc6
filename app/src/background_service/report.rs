use service::prelude::*;
use tokio_util::sync::CancellationToken;

/// Logs dispatch events as they happen, until `shutdown`.
pub async fn report_events(events: flume::Receiver<DispatchEvent>, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv_async() => match event {
                Ok(event) => event,
                Err(_) => break,
            },
        };
        log_event(&event);
    }
}

fn log_event(event: &DispatchEvent) {
    match event {
        DispatchEvent::StateChanged { job, from, to } => {
            tracing::info!(job_id = %job, %from, %to, "Job state changed")
        }
        DispatchEvent::DependencyCancelled { job, dependency } => {
            tracing::warn!(job_id = %job, %dependency, "Job cancelled, a dependency did not complete")
        }
        DispatchEvent::ReconciliationAmbiguity { job, handle, polls } => tracing::warn!(
            job_id = %job,
            %handle,
            polls,
            "Backend no longer reports the job, keeping its last state"
        ),
        DispatchEvent::SubmissionFailed { job, reason } => {
            tracing::error!(job_id = %job, "Submission failed: {reason}")
        }
        DispatchEvent::CancelRejected { job, handle } => {
            tracing::warn!(job_id = %job, %handle, "Backend refused to cancel the job")
        }
    }
}
