//! Settings of the running observability stack the services report to.

use super::Result;
use crate::docker::Docker;
use crate::environment::Environment;
use base64::Engine;
use eyre::{eyre, WrapErr};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_NETWORK: &str = "testbed-stack_default";
pub const DEFAULT_FLEET_URL: &str = "https://fleet-server:8220";
pub const DEFAULT_KIBANA_URL: &str = "https://kibana:5601";
pub const DEFAULT_TOKEN_POLICY_NAME: &str = "Elastic-Agent (testbed)";

const ELASTIC_AGENT_IMAGE: &str = "docker.elastic.co/elastic-agent/elastic-agent";
const ELASTICSEARCH_IMAGE: &str = "docker.elastic.co/elasticsearch/elasticsearch";
const KIBANA_IMAGE: &str = "docker.elastic.co/kibana/kibana";

pub const ELASTIC_AGENT_IMAGE_REF_ENV: &str = "ELASTIC_AGENT_IMAGE_REF";
pub const ELASTICSEARCH_IMAGE_REF_ENV: &str = "ELASTICSEARCH_IMAGE_REF";
pub const KIBANA_IMAGE_REF_ENV: &str = "KIBANA_IMAGE_REF";

/// Image references of the stack components.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackImageRefs {
    pub elastic_agent: String,
    pub elasticsearch: String,
    pub kibana: String,
}

impl StackImageRefs {
    /// Renders the non-empty references as compose variables.
    pub fn as_env(&self) -> Environment {
        [
            (ELASTIC_AGENT_IMAGE_REF_ENV, &self.elastic_agent),
            (ELASTICSEARCH_IMAGE_REF_ENV, &self.elasticsearch),
            (KIBANA_IMAGE_REF_ENV, &self.kibana),
        ]
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| (key, value.clone()))
        .collect()
    }
}

#[derive(Debug, Clone)]
pub struct StackSettings {
    /// Network shared by the stack containers
    pub network: String,
    /// Version of the running stack, e.g. `8.15.0`
    pub version: Option<String>,
    /// CA certificate the stack services are signed with
    pub ca_cert_path: Option<PathBuf>,
    pub elastic_agent_image: Option<String>,
    pub elasticsearch_image: Option<String>,
    pub kibana_image: Option<String>,
    pub fleet_url: String,
    pub kibana_url: String,
    /// Fleet enrollment policy, defaulting to [`DEFAULT_TOKEN_POLICY_NAME`]
    pub policy_name: Option<String>,
}

impl Default for StackSettings {
    fn default() -> Self {
        Self {
            network: DEFAULT_NETWORK.to_string(),
            version: None,
            ca_cert_path: None,
            elastic_agent_image: None,
            elasticsearch_image: None,
            kibana_image: None,
            fleet_url: DEFAULT_FLEET_URL.to_string(),
            kibana_url: DEFAULT_KIBANA_URL.to_string(),
            policy_name: None,
        }
    }
}

impl StackSettings {
    /// Explicit references win; otherwise references are derived from the
    /// stack version. Without either a reference stays empty.
    pub fn image_refs(&self) -> StackImageRefs {
        let pick = |explicit: &Option<String>, base: &str| match (explicit, &self.version) {
            (Some(image), _) if !image.is_empty() => image.clone(),
            (_, Some(version)) if !version.is_empty() => format!("{base}:{version}"),
            _ => String::new(),
        };
        StackImageRefs {
            elastic_agent: pick(&self.elastic_agent_image, ELASTIC_AGENT_IMAGE),
            elasticsearch: pick(&self.elasticsearch_image, ELASTICSEARCH_IMAGE),
            kibana: pick(&self.kibana_image, KIBANA_IMAGE),
        }
    }

    pub fn ca_cert(&self) -> Result<&Path> {
        self.ca_cert_path
            .as_deref()
            .ok_or_else(|| eyre!("can't locate CA certificate: no certificate configured for the stack"))
    }

    /// The CA certificate contents encoded as standard base64.
    pub fn ca_cert_base64(&self) -> Result<String> {
        let path = self.ca_cert()?;
        let content = std::fs::read(path)
            .wrap_err_with(|| format!("can't read certificate authority file {}", path.display()))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(content))
    }

    pub fn token_policy_name(&self) -> String {
        token_policy_name(self.version.as_deref().unwrap_or_default(), self.policy_name.as_deref())
    }
}

/// Policy name agents enroll with. Stacks older than 8.0 have no predefined
/// policy and get an empty name.
pub fn token_policy_name(stack_version: &str, policy_name: Option<&str>) -> String {
    if stack_version.starts_with("7.") {
        return String::new();
    }
    match policy_name {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => DEFAULT_TOKEN_POLICY_NAME.to_string(),
    }
}

/// Fails unless the stack network exists.
pub async fn ensure_network_up(docker: &Docker, settings: &StackSettings, cancel: &CancellationToken) -> Result<()> {
    debug!("Checking stack network {}", settings.network);
    docker
        .inspect_network(&settings.network, cancel)
        .await
        .wrap_err("stack network is not ready")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::{failure, stdout, ScriptedRunner};
    use tempfile::TempDir;

    #[test]
    fn test_token_policy_name() {
        assert_eq!(token_policy_name("7.17.0", Some("custom")), "");
        assert_eq!(token_policy_name("8.15.0", None), DEFAULT_TOKEN_POLICY_NAME);
        assert_eq!(token_policy_name("8.15.0", Some("")), DEFAULT_TOKEN_POLICY_NAME);
        assert_eq!(token_policy_name("9.0.0", Some("custom")), "custom");
    }

    #[test]
    fn test_image_refs() {
        let settings = StackSettings {
            version: Some("8.15.0".to_string()),
            kibana_image: Some("registry.local/kibana:dev".to_string()),
            ..Default::default()
        };
        let refs = settings.image_refs();
        assert_eq!(refs.elastic_agent, "docker.elastic.co/elastic-agent/elastic-agent:8.15.0");
        assert_eq!(refs.kibana, "registry.local/kibana:dev");
        assert_eq!(
            refs.as_env().get(ELASTICSEARCH_IMAGE_REF_ENV),
            Some(&"docker.elastic.co/elasticsearch/elasticsearch:8.15.0".to_string())
        );

        let unversioned = StackSettings::default().image_refs();
        assert!(unversioned.as_env().is_empty());
    }

    #[test]
    fn test_ca_cert_base64() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ca-cert.pem");
        std::fs::write(&path, "pem").unwrap();
        let settings = StackSettings {
            ca_cert_path: Some(path),
            ..Default::default()
        };
        assert_eq!(settings.ca_cert_base64().unwrap(), "cGVt");
        assert!(StackSettings::default().ca_cert_base64().is_err());
    }

    #[tokio::test]
    async fn test_ensure_network_up() {
        let ok = ScriptedRunner::new(|_| stdout(r#"[{"Name": "testbed-stack_default"}]"#));
        ensure_network_up(&Docker::new(ok.clone(), "docker"), &StackSettings::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(ok.argv(), vec!["network inspect testbed-stack_default"]);

        let missing = ScriptedRunner::new(|inv| {
            failure(inv, 1, "Error response from daemon: network testbed-stack_default not found")
        });
        let err = ensure_network_up(
            &Docker::new(missing, "docker"),
            &StackSettings::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "stack network is not ready");
    }
}
