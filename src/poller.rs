use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::PollPolicy;
use crate::error::{PollTimeoutReason, TrackerError};
use crate::models::{InvestigationStatus, RunStatus};

#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, investigation_id: &str) -> Result<InvestigationStatus, TrackerError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Complete(InvestigationStatus),
    Stopped,
}

pub struct StatusPoller<S> {
    source: Arc<S>,
    policy: PollPolicy,
}

impl<S> StatusPoller<S>
where
    S: StatusSource + 'static,
{
    pub fn new(source: Arc<S>, policy: PollPolicy) -> Self {
        Self { source, policy }
    }

    #[must_use]
    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Polls in the current task until the investigation reaches a terminal
    /// state or polling gives up.
    pub async fn poll<F>(
        &self,
        investigation_id: &str,
        mut on_update: F,
    ) -> Result<InvestigationStatus, TrackerError>
    where
        F: FnMut(&InvestigationStatus),
    {
        // The sender stays alive for the whole loop, so it is never cancelled.
        let (_never_stop, stop) = watch::channel(false);
        match poll_loop(
            self.source.as_ref(),
            &self.policy,
            investigation_id,
            &mut on_update,
            stop,
        )
        .await?
        {
            PollOutcome::Complete(status) => Ok(status),
            PollOutcome::Stopped => Err(TrackerError::PollTask("stopped without a stop request".to_string())),
        }
    }

    pub fn spawn<F>(&self, investigation_id: impl Into<String>, mut on_update: F) -> PollHandle
    where
        F: FnMut(&InvestigationStatus) + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let source = Arc::clone(&self.source);
        let policy = self.policy.clone();
        let investigation_id = investigation_id.into();

        let task = tokio::spawn(async move {
            poll_loop(source.as_ref(), &policy, &investigation_id, &mut on_update, stop_rx).await
        });

        PollHandle { stop_tx, task }
    }
}

pub struct PollHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<Result<PollOutcome, TrackerError>>,
}

impl PollHandle {
    /// Stops the loop and waits for it to exit. Once this returns, `on_update`
    /// will not be called again; a fetch still in flight is dropped and its
    /// response discarded.
    pub async fn stop(self) -> Result<PollOutcome, TrackerError> {
        // A send error only means the loop already finished.
        let _ = self.stop_tx.send(true);
        join(self.task).await
    }

    pub async fn join(self) -> Result<PollOutcome, TrackerError> {
        join(self.task).await
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn join(
    task: JoinHandle<Result<PollOutcome, TrackerError>>,
) -> Result<PollOutcome, TrackerError> {
    task.await
        .map_err(|error| TrackerError::PollTask(error.to_string()))?
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            // Sender gone without asking to stop: keep polling.
            std::future::pending::<()>().await;
        }
    }
}

async fn poll_loop<S, F>(
    source: &S,
    policy: &PollPolicy,
    investigation_id: &str,
    on_update: &mut F,
    mut stop: watch::Receiver<bool>,
) -> Result<PollOutcome, TrackerError>
where
    S: StatusSource + ?Sized,
    F: FnMut(&InvestigationStatus),
{
    let started = Instant::now();
    let mut consecutive_failures = 0u32;
    let mut previous: Option<InvestigationStatus> = None;

    loop {
        let fetched = tokio::select! {
            biased;
            () = stop_requested(&mut stop) => return Ok(PollOutcome::Stopped),
            fetched = tokio::time::timeout(policy.fetch_timeout, source.fetch_status(investigation_id)) => {
                fetched.unwrap_or(Err(TrackerError::FetchTimeout(policy.fetch_timeout)))
            }
        };

        let delay = match fetched {
            Ok(status) => {
                consecutive_failures = 0;
                if *stop.borrow() {
                    return Ok(PollOutcome::Stopped);
                }
                check_snapshot(previous.as_ref(), &status);
                on_update(&status);

                match status.status {
                    RunStatus::Complete => {
                        tracing::info!(investigation_id, "investigation complete");
                        return Ok(PollOutcome::Complete(status));
                    }
                    RunStatus::Error => {
                        let message = status
                            .error
                            .clone()
                            .or_else(|| status.agents.iter().find_map(|agent| agent.error.clone()))
                            .unwrap_or_else(|| "investigation reported an error".to_string());
                        tracing::info!(investigation_id, %message, "investigation failed");
                        return Err(TrackerError::JobFailed {
                            investigation_id: investigation_id.to_string(),
                            message,
                        });
                    }
                    RunStatus::Pending | RunStatus::Running => {
                        tracing::debug!(
                            investigation_id,
                            status = %status.status,
                            progress = status.progress(),
                            "investigation in progress"
                        );
                    }
                }
                previous = Some(status);
                policy.interval
            }
            Err(error) if error.is_transient() => {
                consecutive_failures += 1;
                tracing::warn!(investigation_id, consecutive_failures, %error, "status fetch failed, retrying");
                if consecutive_failures >= policy.max_consecutive_failures {
                    return Err(TrackerError::PollTimeout {
                        investigation_id: investigation_id.to_string(),
                        reason: PollTimeoutReason::ConsecutiveFailures(consecutive_failures),
                    });
                }
                policy.retry_delay(consecutive_failures)
            }
            Err(error) => return Err(error),
        };

        let elapsed = started.elapsed();
        if elapsed + delay > policy.max_total_wait {
            return Err(TrackerError::PollTimeout {
                investigation_id: investigation_id.to_string(),
                reason: PollTimeoutReason::Elapsed(elapsed),
            });
        }

        tokio::select! {
            biased;
            () = stop_requested(&mut stop) => return Ok(PollOutcome::Stopped),
            () = tokio::time::sleep(delay) => {}
        }
    }
}

fn check_snapshot(previous: Option<&InvestigationStatus>, current: &InvestigationStatus) {
    if let Err(error) = current.validate() {
        tracing::warn!(investigation_id = %current.investigation_id, %error, "inconsistent status snapshot");
    }
    if let Some(previous) = previous {
        for regression in previous.regressions(current) {
            tracing::warn!(investigation_id = %current.investigation_id, %regression, "status moved backwards");
        }
    }
}
