use super::Result;
use crate::runner::{CommandError, DynCommandRunner, Invocation};
use crate::units::ByteSize;
use eyre::{bail, eyre, WrapErr};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";
pub const COMPOSE_VERSION_LABEL: &str = "com.docker.compose.version";

static IMAGE_BUSY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"container \S+ is using its referenced image \S+").expect("image busy pattern is valid")
});

/// Container as reported by `docker inspect`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerDescription {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub config: ContainerConfig,
    pub state: ContainerState,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerState {
    pub status: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub health: Option<ContainerHealth>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerHealth {
    pub status: String,
    #[serde(default)]
    pub log: Option<Vec<HealthLogEntry>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HealthLogEntry {
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub output: String,
}

impl ContainerDescription {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.config.labels.as_ref()?.get(key).map(String::as_str)
    }

    /// First twelve characters of the container ID.
    pub fn short_id(&self) -> &str {
        self.id.get(..12).unwrap_or(&self.id)
    }

    /// Output of the most recent health check, if any ran.
    pub fn last_health_output(&self) -> Option<&str> {
        let log = self.state.health.as_ref()?.log.as_ref()?;
        log.last().map(|entry| entry.output.trim())
    }
}

/// Network as reported by `docker network inspect`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkDescription {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub containers: Option<BTreeMap<String, NetworkContainer>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkContainer {
    #[serde(default)]
    pub name: String,
}

impl NetworkDescription {
    /// Whether a container with the given name is attached.
    pub fn has_container(&self, name: &str) -> bool {
        self.containers
            .iter()
            .flat_map(|containers| containers.values())
            .any(|c| c.name == name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("image {image} is in use by a container")]
pub struct ImageBusy {
    pub image: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageListEntry {
    repository: String,
    tag: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DiskUsageEntry {
    #[serde(rename = "Type")]
    kind: String,
    size: String,
}

/// Thin wrapper over the docker CLI for inspection, networking and images.
#[derive(Clone)]
pub struct Docker {
    runner: DynCommandRunner,
    binary: String,
}

impl Docker {
    pub fn new(runner: DynCommandRunner, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    pub fn runner(&self) -> DynCommandRunner {
        self.runner.clone()
    }

    fn command(&self) -> Invocation {
        Invocation::new(&self.binary)
    }

    /// Inspects the given containers. An empty ID list returns no descriptions
    /// without running docker.
    pub async fn inspect_containers(
        &self,
        ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<ContainerDescription>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let output = self
            .runner
            .run(self.command().arg("inspect").args(ids.iter().cloned()).capture_stdout(), cancel)
            .await
            .wrap_err("could not inspect containers")?;
        serde_json::from_slice(&output.stdout).wrap_err("can't unmarshal container inspect output")
    }

    pub async fn inspect_network(&self, network: &str, cancel: &CancellationToken) -> Result<NetworkDescription> {
        let output = self
            .runner
            .run(
                self.command().args(["network", "inspect", network]).capture_stdout(),
                cancel,
            )
            .await
            .wrap_err_with(|| format!("could not inspect network {network}"))?;
        let networks: Vec<NetworkDescription> = serde_json::from_slice(&output.stdout)
            .wrap_err("can't unmarshal network inspect output")?;
        networks
            .into_iter()
            .next()
            .ok_or_else(|| eyre!("network {network} not found"))
    }

    /// Resolves the ID of the container with exactly this name.
    pub async fn container_id(&self, name: &str, cancel: &CancellationToken) -> Result<String> {
        let output = self
            .runner
            .run(
                self.command()
                    .args(["ps", "-a", "--filter"])
                    .arg(format!("name=^/?{name}$"))
                    .args(["--format", "{{.ID}}"])
                    .capture_stdout(),
                cancel,
            )
            .await
            .wrap_err_with(|| format!("could not find container {name}"))?;
        let stdout = output.stdout_lossy();
        let ids: Vec<&str> = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        match ids.as_slice() {
            [id] => Ok((*id).to_string()),
            [] => bail!("no container named {name}"),
            _ => bail!("more than one container named {name} ({})", ids.join(", ")),
        }
    }

    /// Connects a container to a network under the given aliases.
    ///
    /// Attaching a container that is already a member of the network is not
    /// an error.
    pub async fn connect_to_network(
        &self,
        network: &str,
        container: &str,
        aliases: &[String],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut invocation = self.command().args(["network", "connect"]);
        for alias in aliases {
            invocation = invocation.arg("--alias").arg(alias);
        }
        let invocation = invocation.arg(network).arg(container);

        match self.runner.run(invocation, cancel).await {
            Ok(_) => Ok(()),
            Err(err) => match err.downcast_ref::<CommandError>() {
                Some(e) if e.stderr().contains("already exists in network") => {
                    debug!("Container {} already attached to {}", container, network);
                    Ok(())
                }
                _ => Err(err.wrap_err(format!("could not attach {container} to network {network}"))),
            },
        }
    }

    pub async fn pull(&self, image: &str, cancel: &CancellationToken) -> Result<()> {
        self.runner
            .run(self.command().args(["pull", image]), cancel)
            .await
            .wrap_err_with(|| format!("pulling image {image} failed"))?;
        Ok(())
    }

    /// Lists local images as `repository:tag`, skipping untagged ones.
    pub async fn list_images(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let output = self
            .runner
            .run(self.command().args(["image", "list", "--format=json"]).capture_stdout(), cancel)
            .await
            .wrap_err("could not list images")?;
        let mut images = Vec::new();
        for line in output.stdout_lossy().lines().filter(|l| !l.trim().is_empty()) {
            let entry: ImageListEntry =
                serde_json::from_str(line).wrap_err("can't unmarshal image list output")?;
            if entry.repository == "<none>" || entry.tag == "<none>" {
                continue;
            }
            images.push(format!("{}:{}", entry.repository, entry.tag));
        }
        Ok(images)
    }

    /// Removes a local image. Images still referenced by a container fail
    /// with [`ImageBusy`].
    pub async fn remove_image(&self, image: &str, cancel: &CancellationToken) -> Result<()> {
        match self.runner.run(self.command().args(["image", "rm", image]), cancel).await {
            Ok(_) => Ok(()),
            Err(err) => match err.downcast_ref::<CommandError>() {
                Some(e) if IMAGE_BUSY.is_match(e.stderr()) => Err(ImageBusy {
                    image: image.to_string(),
                }
                .into()),
                _ => Err(err.wrap_err(format!("could not remove image {image}"))),
            },
        }
    }

    /// Disk space used by local images.
    pub async fn images_disk_usage(&self, cancel: &CancellationToken) -> Result<ByteSize> {
        let output = self
            .runner
            .run(self.command().args(["system", "df", "--format=json"]).capture_stdout(), cancel)
            .await
            .wrap_err("could not query docker disk usage")?;
        for line in output.stdout_lossy().lines().filter(|l| !l.trim().is_empty()) {
            let entry: DiskUsageEntry =
                serde_json::from_str(line).wrap_err("can't unmarshal disk usage output")?;
            if entry.kind == "Images" {
                return entry.size.parse();
            }
        }
        bail!("disk usage output has no entry for images")
    }
}
