use super::Result;
use crate::compose::{CommandOptions, Project};
use eyre::WrapErr;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const CONTAINER_LOGS_DIR: &str = "container-logs";

/// Saves the logs of a compose project under the build directory.
///
/// Returns the written file, or `None` when the containers logged nothing.
pub async fn capture(
    project: &Project,
    opts: &CommandOptions,
    service: &str,
    build_dir: &Path,
    cancel: &CancellationToken,
) -> Result<Option<PathBuf>> {
    let content = project
        .logs(opts, cancel)
        .await
        .wrap_err("can't export service logs")?;
    if content.is_empty() {
        info!("Service container hasn't written any logs");
        return Ok(None);
    }
    write_logs(build_dir, service, &content).map(Some)
}

pub fn write_logs(build_dir: &Path, service: &str, content: &[u8]) -> Result<PathBuf> {
    let dir = build_dir.join(CONTAINER_LOGS_DIR);
    std::fs::create_dir_all(&dir)
        .wrap_err_with(|| format!("can't create directory for service container logs (path: {})", dir.display()))?;

    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let path = dir.join(format!("{service}-{nanos}.log"));
    info!("Write container logs to file: {}", path.display());
    std::fs::write(&path, content)
        .wrap_err_with(|| format!("can't write container logs to file (path: {})", path.display()))?;
    Ok(path)
}
