use crate::docker::{ContainerDescription, COMPOSE_SERVICE_LABEL};
use crate::wait::{wait_until, Check, WaitOptions};
use crate::Result;
use std::future::Future;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Unrecoverable container state observed while waiting.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HealthError {
    #[error("container {container} exited with code {code}")]
    ContainerExited { container: String, code: i32 },
}

/// Classification of one container in one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    /// Running without a health check, running and healthy, or finished
    /// successfully
    Pass,
    NotYet,
    Failed { code: i32 },
}

pub fn classify(container: &ContainerDescription) -> ContainerStatus {
    let state = &container.state;
    match state.status.as_str() {
        "running" => match &state.health {
            None => ContainerStatus::Pass,
            Some(health) if health.status == "healthy" => ContainerStatus::Pass,
            Some(_) => ContainerStatus::NotYet,
        },
        "exited" if state.exit_code == 0 => ContainerStatus::Pass,
        "exited" => ContainerStatus::Failed {
            code: state.exit_code,
        },
        _ => ContainerStatus::NotYet,
    }
}

fn display_name(container: &ContainerDescription) -> String {
    match container.label(COMPOSE_SERVICE_LABEL) {
        Some(service) => format!("{service} (ID: {})", container.short_id()),
        None => format!("(ID: {})", container.short_id()),
    }
}

/// IDs match when one is a prefix of the other, as `ps -q` may print short IDs.
fn same_container(inspected: &str, listed: &str) -> bool {
    !listed.is_empty() && (inspected.starts_with(listed) || listed.starts_with(inspected))
}

/// Polls the given containers until every one of them passes.
///
/// `inspect` is called once per poll and must return fresh descriptions; no
/// classification is carried over between polls. A container that exited
/// with a non-zero code aborts the wait with [`HealthError::ContainerExited`].
/// Timeout and cancellation surface as [`crate::wait::WaitError`].
pub async fn wait_for_healthy<F, Fut>(
    container_ids: &[String],
    options: &WaitOptions,
    cancel: &CancellationToken,
    mut inspect: F,
) -> Result<()>
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = Result<Vec<ContainerDescription>>>,
{
    let ids = container_ids.to_vec();
    wait_until("healthy containers", options, cancel, || {
        let poll = inspect(ids.clone());
        let ids = ids.clone();
        async move {
            let containers = poll.await?;
            let mut ready = true;
            for container in &containers {
                let status = classify(container);
                debug!(
                    "Container {} status: {} (health: {})",
                    display_name(container),
                    container.state.status,
                    container
                        .state
                        .health
                        .as_ref()
                        .map(|h| h.status.as_str())
                        .unwrap_or("none")
                );
                match status {
                    ContainerStatus::Pass => {}
                    ContainerStatus::NotYet => {
                        if let Some(output) = container.last_health_output() {
                            debug!("Last health check of {}: {}", display_name(container), output);
                        }
                        ready = false;
                    }
                    ContainerStatus::Failed { code } => {
                        return Err(HealthError::ContainerExited {
                            container: display_name(container),
                            code,
                        }
                        .into())
                    }
                }
            }
            // Containers that vanished from the inspect output are not ready yet
            let missing = ids
                .iter()
                .filter(|id| !containers.iter().any(|c| same_container(&c.id, id)))
                .count();
            if missing > 0 {
                debug!("{} containers not inspected yet", missing);
                ready = false;
            }
            Ok(if ready { Check::Ready } else { Check::NotReady })
        }
    })
    .await
}
