pub mod fake_docker;
pub mod package_fixture;

pub use fake_docker::FakeDockerHarness;
pub use package_fixture::{PackageFixture, NGINX_COMPOSE};

use std::path::Path;
use std::sync::Arc;
use testbed::compose::ComposeSettings;
use testbed::config::{Config, Locations};
use testbed::deployer::Runtime;
use testbed::runner::{ProcessRunner, RunnerConfig};
use testbed::stack::StackSettings;

/// A runtime that drives `docker` through the fake script with real
/// processes.
pub fn fake_runtime(docker: &FakeDockerHarness, data_home: &Path) -> Runtime {
    let config = Config {
        docker_binary: docker.binary().display().to_string(),
        compose: ComposeSettings {
            use_pty: false,
            ..Default::default()
        },
        stack: StackSettings {
            version: Some("8.15.0".to_string()),
            ..Default::default()
        },
        locations: Locations::new(data_home.to_path_buf()),
        ..Default::default()
    };
    let runner = Arc::new(ProcessRunner::new(RunnerConfig::default()));
    Runtime::new(runner, config)
}
