//! kubectl wrapper: apply and delete manifests and wait for what was applied
//! to become ready.

use super::Result;
use crate::retry::{is_transient_network_error, retry, RetryPolicy};
use crate::runner::{DynCommandRunner, Invocation};
use crate::wait::{wait_until, Check, WaitOptions};
use eyre::WrapErr;
use serde::Deserialize;
use serde_yaml::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const KUSTOMIZATION_FILE: &str = "kustomization.yaml";

/// A Kubernetes object as rendered by `kubectl ... -o yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: Value,
    #[serde(default)]
    pub status: Value,
    #[serde(default)]
    pub items: Vec<Resource>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (kind: {}, namespace: {})",
            self.metadata.name, self.kind, self.metadata.namespace
        )
    }
}

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(*key))
}

fn int_at(value: &Value, path: &[&str]) -> Option<i64> {
    lookup(value, path).and_then(Value::as_i64)
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    lookup(value, path).and_then(Value::as_str)
}

/// Resolves an int-or-percent field against `total`.
fn scaled(value: Option<&Value>, total: i64, default: i64, round_up: bool) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(default),
        Some(Value::String(s)) => match s.trim_end_matches('%').parse::<i64>() {
            Ok(percent) if s.ends_with('%') => {
                let scaled = total * percent;
                if round_up {
                    (scaled + 99) / 100
                } else {
                    scaled / 100
                }
            }
            Ok(n) => n,
            Err(_) => default,
        },
        _ => default,
    }
}

impl Resource {
    /// Whether the object reached its ready state.
    ///
    /// A DaemonSet whose rolling update allows one unavailable pod reports
    /// ready on a single node cluster while that pod is still starting.
    pub fn is_ready(&self) -> bool {
        let spec = &self.spec;
        let status = &self.status;
        match self.kind.as_str() {
            "Deployment" => {
                let replicas = int_at(spec, &["replicas"]).unwrap_or(1);
                let max_unavailable = scaled(
                    lookup(spec, &["strategy", "rollingUpdate", "maxUnavailable"]),
                    replicas,
                    replicas / 4,
                    false,
                );
                let ready = int_at(status, &["readyReplicas"]).unwrap_or(0);
                ready >= replicas - max_unavailable
            }
            "DaemonSet" => {
                if str_at(spec, &["updateStrategy", "type"]).is_some_and(|t| t != "RollingUpdate") {
                    return true;
                }
                let desired = int_at(status, &["desiredNumberScheduled"]).unwrap_or(0);
                let updated = int_at(status, &["updatedNumberScheduled"]).unwrap_or(0);
                let ready = int_at(status, &["numberReady"]).unwrap_or(0);
                let max_unavailable = scaled(
                    lookup(spec, &["updateStrategy", "rollingUpdate", "maxUnavailable"]),
                    desired,
                    1,
                    true,
                );
                updated == desired && ready >= desired - max_unavailable
            }
            "StatefulSet" => {
                let replicas = int_at(spec, &["replicas"]).unwrap_or(1);
                int_at(status, &["readyReplicas"]).unwrap_or(0) >= replicas
            }
            "Pod" => {
                if str_at(status, &["phase"]) == Some("Succeeded") {
                    return true;
                }
                lookup(status, &["conditions"])
                    .and_then(Value::as_sequence)
                    .is_some_and(|conditions| {
                        conditions.iter().any(|c| {
                            str_at(c, &["type"]) == Some("Ready") && str_at(c, &["status"]) == Some("True")
                        })
                    })
            }
            "PersistentVolumeClaim" => str_at(status, &["phase"]) == Some("Bound"),
            "Service" => {
                if str_at(spec, &["type"]) != Some("LoadBalancer") {
                    return true;
                }
                lookup(status, &["loadBalancer", "ingress"])
                    .and_then(Value::as_sequence)
                    .is_some_and(|ingress| !ingress.is_empty())
            }
            _ => true,
        }
    }
}

/// Splits command output into resources, flattening `List` objects.
pub fn extract_resources(output: &[u8]) -> Result<Vec<Resource>> {
    let mut resources = Vec::new();
    if output.iter().all(u8::is_ascii_whitespace) {
        return Ok(resources);
    }
    for document in serde_yaml::Deserializer::from_slice(output) {
        let resource = Resource::deserialize(document).wrap_err("can't unmarshal command output")?;
        if !resource.items.is_empty() {
            resources.extend(resource.items);
        } else if !resource.kind.is_empty() {
            resources.push(resource);
        }
    }
    Ok(resources)
}

#[derive(Clone)]
pub struct Kubectl {
    runner: DynCommandRunner,
    binary: String,
    readiness: WaitOptions,
    retry: RetryPolicy,
}

impl Kubectl {
    pub fn new(runner: DynCommandRunner, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
            readiness: WaitOptions::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn command(&self) -> Invocation {
        Invocation::new(&self.binary).capture_stdout()
    }

    async fn run_with_retry(&self, invocation: Invocation, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let output = retry(&self.retry, cancel, is_transient_network_error, || {
            self.runner.run(invocation.clone(), cancel)
        })
        .await?;
        Ok(output.stdout)
    }

    pub async fn current_context(&self, cancel: &CancellationToken) -> Result<String> {
        let stdout = self
            .run_with_retry(self.command().args(["config", "current-context"]), cancel)
            .await
            .wrap_err("can't read current Kubernetes context")?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    /// Applies the definitions and waits until the applied resources are
    /// ready.
    pub async fn apply(&self, paths: &[PathBuf], cancel: &CancellationToken) -> Result<()> {
        debug!("Apply Kubernetes custom definitions");
        let output = self
            .run_with_retry(self.command().args(modify_args("apply", paths)), cancel)
            .await
            .wrap_err("can't modify Kubernetes resources (apply)")?;
        self.wait_for_output(&output, cancel).await
    }

    /// Applies a manifest read from stdin and waits for readiness.
    pub async fn apply_stdin(&self, manifest: &[u8], cancel: &CancellationToken) -> Result<()> {
        debug!("Apply Kubernetes stdin");
        let invocation = self
            .command()
            .args(["apply", "-f", "-", "-o", "yaml"])
            .stdin(manifest.to_vec());
        let output = self
            .run_with_retry(invocation, cancel)
            .await
            .wrap_err("can't modify Kubernetes resources (apply stdin)")?;
        self.wait_for_output(&output, cancel).await
    }

    pub async fn delete(&self, paths: &[PathBuf], cancel: &CancellationToken) -> Result<()> {
        self.runner
            .run(self.command().args(modify_args("delete", paths)), cancel)
            .await
            .wrap_err("can't modify Kubernetes resources (delete)")?;
        Ok(())
    }

    async fn get(&self, resource: &Resource, cancel: &CancellationToken) -> Result<Resource> {
        let mut invocation = self
            .command()
            .arg("get")
            .arg(format!("{}/{}", resource.kind.to_lowercase(), resource.metadata.name));
        if !resource.metadata.namespace.is_empty() {
            invocation = invocation.args(["-n", resource.metadata.namespace.as_str()]);
        }
        let output = self
            .runner
            .run(invocation.args(["-o", "yaml"]), cancel)
            .await
            .wrap_err_with(|| format!("can't sync resource info: {resource}"))?;
        serde_yaml::from_slice(&output.stdout).wrap_err_with(|| format!("can't unmarshal resource {resource}"))
    }

    async fn wait_for_output(&self, output: &[u8], cancel: &CancellationToken) -> Result<()> {
        let resources = extract_resources(output).wrap_err("can't extract resources")?;
        self.wait_for_ready(resources, cancel)
            .await
            .wrap_err("resources are not ready")
    }

    /// Polls every resource until all of them are ready.
    pub async fn wait_for_ready(&self, resources: Vec<Resource>, cancel: &CancellationToken) -> Result<()> {
        let pending: Vec<Resource> = resources.into_iter().filter(|r| !r.is_ready()).collect();
        if pending.is_empty() {
            return Ok(());
        }
        debug!("Waiting for {} Kubernetes resources", pending.len());

        let pending = Arc::new(Mutex::new(pending));
        wait_until("ready Kubernetes resources", &self.readiness, cancel, || {
            let pending = pending.clone();
            async move {
                let current = std::mem::take(&mut *lock(&pending));
                let mut still_pending = Vec::new();
                for resource in current {
                    let fresh = self.get(&resource, cancel).await?;
                    if fresh.is_ready() {
                        debug!("Resource {} is ready", resource);
                    } else {
                        still_pending.push(resource);
                    }
                }
                let done = still_pending.is_empty();
                *lock(&pending) = still_pending;
                Ok(if done { Check::Ready } else { Check::NotReady })
            }
        })
        .await
    }
}

fn lock(pending: &Mutex<Vec<Resource>>) -> std::sync::MutexGuard<'_, Vec<Resource>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Arguments to apply or delete definition files. A `kustomization.yaml`
/// among them switches to applying its directory with `-k`.
pub(crate) fn modify_args(action: &str, paths: &[PathBuf]) -> Vec<String> {
    let mut args = vec![action.to_string()];
    match paths
        .iter()
        .find(|p| p.file_name().is_some_and(|name| name == KUSTOMIZATION_FILE))
    {
        Some(kustomization) => {
            let dir = kustomization.parent().unwrap_or_else(|| Path::new("."));
            args.push("-k".to_string());
            args.push(dir.display().to_string());
        }
        None => {
            for path in paths {
                args.push("-f".to_string());
                args.push(path.display().to_string());
            }
        }
    }
    // delete only supports `-o name`
    if action != "delete" {
        args.extend(["-o".to_string(), "yaml".to_string()]);
    }
    args
}
