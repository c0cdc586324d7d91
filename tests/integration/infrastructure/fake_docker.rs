use anyhow::{Context, Result};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const RUNNING: &str = r#"[{"Id": "0123456789abcdef", "Name": "/svc", "Config": {"Image": "nginx", "Labels": {"com.docker.compose.service": "nginx"}}, "State": {"Status": "running", "ExitCode": 0}}]"#;

/// An executable stand-in for the docker CLI.
///
/// Every invocation is appended to `calls.log` and answered with canned
/// output from files in the harness directory, so tests can change answers
/// between steps.
pub struct FakeDockerHarness {
    temp_dir: TempDir,
}

impl FakeDockerHarness {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new().context("Failed to create temporary directory")?;
        let harness = Self { temp_dir };

        let dir = harness.dir().display().to_string();
        let script = format!(
            r#"#!/bin/sh
dir="{dir}"
echo "$*" >> "$dir/calls.log"
if [ "$1" = "compose" ]; then
  shift
  if [ "$1" = "version" ]; then
    echo "2.24.0"
    exit 0
  fi
  while [ $# -gt 0 ]; do
    case "$1" in
      -p) shift 2; break ;;
      *) shift ;;
    esac
  done
  case "$1" in
    ps) echo "0123456789abcdef" ;;
    config) cat "$dir/config.yml" ;;
    logs) echo "nginx-1  | ready" ;;
    up) echo "TEST_RUN_ID=$TEST_RUN_ID SERVICE_LOGS_DIR=$SERVICE_LOGS_DIR NGINX_VERSION=$NGINX_VERSION" >> "$dir/up-env.log" ;;
  esac
  exit 0
fi
case "$1" in
  inspect) cat "$dir/inspect.json" ;;
  network)
    if [ "$2" = "inspect" ]; then
      if [ -f "$dir/no-network" ]; then
        echo "Error response from daemon: network $3 not found" >&2
        exit 1
      fi
      printf '[{{"Name": "%s", "Containers": {{}}}}]' "$3"
    fi
    ;;
  ps) echo "a1b2c3d4e5f6" ;;
esac
exit 0
"#
        );

        let binary = harness.binary();
        std::fs::write(&binary, script).context("Failed to write fake docker script")?;
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755))
            .context("Failed to make fake docker executable")?;
        harness.set_config("services: {}\n")?;
        harness.set_inspect(RUNNING)?;
        Ok(harness)
    }

    pub fn dir(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Path to pass as the docker binary
    pub fn binary(&self) -> PathBuf {
        self.dir().join("docker")
    }

    /// Output of `docker compose config`
    pub fn set_config(&self, yaml: &str) -> Result<()> {
        std::fs::write(self.dir().join("config.yml"), yaml).context("Failed to write compose config")
    }

    /// Output of `docker inspect`
    pub fn set_inspect(&self, json: &str) -> Result<()> {
        std::fs::write(self.dir().join("inspect.json"), json).context("Failed to write inspect output")
    }

    /// Makes the container report that it exited with `code`.
    pub fn set_exited(&self, code: i32) -> Result<()> {
        self.set_inspect(&RUNNING.replace(
            r#""Status": "running", "ExitCode": 0"#,
            &format!(r#""Status": "exited", "ExitCode": {code}"#),
        ))
    }

    /// Makes `network inspect` fail as if the stack was not running.
    pub fn remove_network(&self) -> Result<()> {
        std::fs::write(self.dir().join("no-network"), "").context("Failed to write network marker")
    }

    /// Argument lists of every invocation so far
    pub fn calls(&self) -> Result<Vec<String>> {
        read_lines(&self.dir().join("calls.log"))
    }

    /// Compose verbs in invocation order, e.g. `up` for `compose -f x -p name up -d`
    pub fn compose_verbs(&self) -> Result<Vec<String>> {
        Ok(self
            .calls()?
            .iter()
            .filter(|call| call.starts_with("compose "))
            .filter_map(|call| {
                let words: Vec<&str> = call.split_whitespace().collect();
                let project = words.iter().position(|w| *w == "-p")?;
                words.get(project + 2).map(|verb| verb.to_string())
            })
            .collect())
    }

    /// Variables `compose up` ran with
    pub fn up_env(&self) -> Result<Vec<String>> {
        read_lines(&self.dir().join("up-env.log"))
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(content.lines().map(str::to_string).collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}
