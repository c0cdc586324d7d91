use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const NGINX_COMPOSE: &str = r#"services:
  nginx:
    image: nginx:${NGINX_VERSION:-1.25}
    ports:
      - 80
    volumes:
      - ${SERVICE_LOGS_DIR}:/var/log/nginx
"#;

/// A package directory with a `_dev/deploy` tree, plus a data home for
/// everything the deployers generate.
pub struct PackageFixture {
    temp_dir: TempDir,
}

impl PackageFixture {
    pub fn new(name: &str) -> Result<Self> {
        let temp_dir = TempDir::new().context("Failed to create temporary directory")?;
        let fixture = Self { temp_dir };
        std::fs::create_dir_all(fixture.package_root_for(name)).context("Failed to create package root")?;
        Ok(fixture)
    }

    fn package_root_for(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join("packages").join(name)
    }

    /// The single package directory of this fixture
    pub fn package_root(&self) -> Result<PathBuf> {
        let packages = self.temp_dir.path().join("packages");
        let entry = std::fs::read_dir(&packages)?
            .next()
            .context("Fixture has no package")??;
        Ok(entry.path())
    }

    pub fn data_home(&self) -> PathBuf {
        self.temp_dir.path().join("data")
    }

    /// Writes `content` to `path` relative to the package root.
    pub fn write(&self, path: impl AsRef<Path>, content: &str) -> Result<PathBuf> {
        let path = self.package_root()?.join(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    pub fn with_compose_service(self) -> Result<Self> {
        self.write("_dev/deploy/docker/docker-compose.yml", NGINX_COMPOSE)?;
        Ok(self)
    }

    pub fn with_variants(self, variants: &str) -> Result<Self> {
        self.write("_dev/deploy/variants.yml", variants)?;
        Ok(self)
    }
}
