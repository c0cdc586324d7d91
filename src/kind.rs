use super::Result;
use crate::docker::Docker;
use crate::kubectl::Kubectl;
use eyre::{bail, WrapErr};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const CONTROL_PLANE_CONTAINER: &str = "kind-control-plane";
pub const CONTEXT: &str = "kind-kind";

/// Fails unless kubectl points at the kind cluster.
pub async fn verify_context(kubectl: &Kubectl, cancel: &CancellationToken) -> Result<()> {
    let context = kubectl
        .current_context(cancel)
        .await
        .wrap_err("can't read current Kubernetes context")?;
    if context != CONTEXT {
        bail!(
            "current Kubernetes context is \"{}\", expected \"{}\" (did you start the kind cluster?)",
            context,
            CONTEXT
        );
    }
    Ok(())
}

/// Attaches the kind control plane to the stack network unless it already is.
pub async fn connect_to_stack_network(docker: &Docker, network: &str, cancel: &CancellationToken) -> Result<()> {
    let container_id = docker
        .container_id(CONTROL_PLANE_CONTAINER, cancel)
        .await
        .wrap_err("can't find kind control plane")?;

    let stack_network = docker
        .inspect_network(network, cancel)
        .await
        .wrap_err("can't inspect stack network")?;
    if stack_network.has_container(CONTROL_PLANE_CONTAINER) {
        debug!("Control plane is already attached to {}", network);
        return Ok(());
    }

    debug!("Attaching control plane {} to {}", container_id, network);
    docker
        .connect_to_network(network, &container_id, &[], cancel)
        .await
        .wrap_err("can't connect control plane to the stack network")
}
