use super::Result;
use crate::compose::ComposeSettings;
use crate::environment::Environment;
use crate::imagesgc::ImagesGcConfig;
use crate::runner::RunnerConfig;
use crate::stack::StackSettings;
use eyre::WrapErr;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Credentials and region variables forwarded to Terraform.
pub const AWS_PASSTHROUGH_VARS: [&str; 6] = [
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "AWS_PROFILE",
    "AWS_REGION",
    "AWS_DEFAULT_REGION",
];

/// Configuration for one testbed invocation, built once and passed down
#[derive(Debug, Clone)]
pub struct Config {
    /// Mirror the output of every external command
    pub debug: bool,
    pub docker_binary: String,
    pub kubectl_binary: String,
    pub compose: ComposeSettings,
    pub stack: StackSettings,
    pub locations: Locations,
    pub images_gc: ImagesGcConfig,
    /// Host variables forwarded to deployers that need them
    pub passthrough_env: Environment,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            docker_binary: "docker".to_string(),
            kubectl_binary: "kubectl".to_string(),
            compose: ComposeSettings::default(),
            stack: StackSettings::default(),
            locations: Locations::new(PathBuf::from(".testbed")),
            images_gc: ImagesGcConfig::default(),
            passthrough_env: Environment::new(),
        }
    }
}

impl Config {
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            debug: self.debug,
            ..Default::default()
        }
    }
}

/// Directory layout under the data home.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locations {
    data_home: PathBuf,
    service_logs: Option<PathBuf>,
}

impl Locations {
    pub fn new(data_home: PathBuf) -> Self {
        Self {
            data_home,
            service_logs: None,
        }
    }

    /// `~/.testbed`, or `.testbed` in the working directory when the home
    /// directory is unknown.
    pub fn default_data_home() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".testbed"))
            .unwrap_or_else(|| PathBuf::from(".testbed"))
    }

    pub fn with_service_logs(mut self, dir: Option<PathBuf>) -> Self {
        self.service_logs = dir;
        self
    }

    pub fn data_home(&self) -> &Path {
        &self.data_home
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_home.join("cache")
    }

    /// Build artifacts such as captured container logs
    pub fn build_dir(&self) -> PathBuf {
        self.data_home.join("build")
    }

    /// Generated compose files of the custom agent and terraform deployers
    pub fn deployer_dir(&self) -> PathBuf {
        self.data_home.join("deployer")
    }

    pub fn service_logs_dir(&self) -> PathBuf {
        self.service_logs
            .clone()
            .unwrap_or_else(|| self.data_home.join("tmp").join("service_logs"))
    }

    pub fn service_output_dir(&self) -> PathBuf {
        self.data_home.join("tmp").join("output")
    }
}

/// Optional YAML settings file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub images_gc: Option<ImagesGcConfig>,
}

impl SettingsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)
            .wrap_err_with(|| format!("can't read settings file {}", path.display()))?;
        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_yaml::from_slice(&content).wrap_err_with(|| format!("can't parse settings file {}", path.display()))
    }
}

/// Captures the passthrough variables set in the current process.
pub fn passthrough_from_process() -> Environment {
    AWS_PASSTHROUGH_VARS
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|value| (*key, value)))
        .collect()
}
