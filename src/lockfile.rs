use std::fs::{self, File};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::project::{Project, template_relative};

pub const DEFAULT_LOCKFILE: &str = "foundry.lock";

#[derive(Debug, Serialize, Deserialize)]
pub struct BuildLock {
    pub name: String,
    pub version: String,
    pub generated_at: DateTime<Utc>,
    pub config: FileLock,
    pub dockerfile: FileLock,
    pub architectures: Vec<ArchLock>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileLock {
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ArchLock {
    pub arch: String,
    pub image: String,
    pub platform: String,
    pub build_args_hash: String,
}

pub fn compute_lock(config: &Config, project: &Project, generated_at: DateTime<Utc>) -> Result<BuildLock> {
    let config_path = project.config_path();
    let dockerfile = template_relative(config.base.template.trim());

    let build_args = config.tool_build_args();
    let architectures = config
        .base
        .architecture
        .iter()
        .map(|arch| ArchLock {
            arch: arch.clone(),
            image: config.image_reference(arch),
            platform: Config::platform(arch),
            build_args_hash: hash_build_args(arch, &build_args),
        })
        .collect();

    Ok(BuildLock {
        name: config.name.clone(),
        version: config.version.clone(),
        generated_at,
        config: FileLock {
            path: project.relative(config_path).display().to_string(),
            sha256: hash_file(config_path)?,
        },
        dockerfile: FileLock {
            sha256: hash_file(&project.path(&dockerfile))?,
            path: dockerfile,
        },
        architectures,
    })
}

pub fn write_lock(lock: &BuildLock, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create lockfile directory: {}", parent.display())
        })?;
    }
    let file = File::create(path)
        .with_context(|| format!("Failed to create lockfile: {}", path.display()))?;
    serde_yaml::to_writer(file, lock)
        .with_context(|| format!("Failed to write lockfile: {}", path.display()))?;
    Ok(())
}

fn hash_file(path: &Path) -> Result<String> {
    let bytes =
        fs::read(path).with_context(|| format!("Failed to read {} for hashing", path.display()))?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

fn hash_build_args(arch: &str, build_args: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(arch.as_bytes());
    for arg in build_args {
        hasher.update([0u8]);
        hasher.update(arg.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolConfig;
    use chrono::TimeZone;
    use tempfile::tempdir;

    const CONFIG: &str = r#"
name: locked
version: "2.1.0"
image: { name: app, registry: ghcr.io, namespace: acme }
base: { template: ubuntu-22.04, architecture: [amd64, arm/v7] }
"#;

    fn project(dir: &Path) -> Project {
        fs::create_dir_all(dir.join("templates/base")).unwrap();
        fs::write(dir.join("image-foundry.yaml"), CONFIG).unwrap();
        fs::write(
            dir.join("templates/base/ubuntu-22.04.Dockerfile"),
            "FROM ubuntu:22.04\n",
        )
        .unwrap();
        Project::new(dir, "image-foundry.yaml")
    }

    #[test]
    fn lock_records_hashes_per_architecture() {
        let dir = tempdir().unwrap();
        let project = project(dir.path());
        let config = Config::from_yaml(CONFIG).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let lock = compute_lock(&config, &project, at).unwrap();
        assert_eq!(lock.name, "locked");
        assert_eq!(lock.config.path, "image-foundry.yaml");
        assert_eq!(lock.dockerfile.path, "templates/base/ubuntu-22.04.Dockerfile");
        assert_eq!(
            lock.dockerfile.sha256,
            format!("{:x}", Sha256::digest(b"FROM ubuntu:22.04\n"))
        );
        assert_eq!(lock.architectures.len(), 2);
        assert_eq!(lock.architectures[1].image, "ghcr.io/acme/app:latest-arm-v7");
        assert_eq!(lock.architectures[1].platform, "linux/arm/v7");
        assert_ne!(
            lock.architectures[0].build_args_hash,
            lock.architectures[1].build_args_hash
        );
    }

    #[test]
    fn build_args_change_the_hash() {
        let mut config = Config::from_yaml(CONFIG).unwrap();
        let before = hash_build_args("amd64", &config.tool_build_args());
        config
            .tools
            .languages
            .insert("go".into(), ToolConfig::installed("1.22.0"));
        let after = hash_build_args("amd64", &config.tool_build_args());
        assert_ne!(before, after);
    }

    #[test]
    fn written_lock_is_yaml() {
        let dir = tempdir().unwrap();
        let project = project(dir.path());
        let config = Config::from_yaml(CONFIG).unwrap();
        let lock = compute_lock(&config, &project, Utc::now()).unwrap();

        let path = dir.path().join("out/foundry.lock");
        write_lock(&lock, &path).unwrap();
        let parsed: BuildLock = serde_yaml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.version, "2.1.0");
        assert_eq!(parsed.architectures[0].arch, "amd64");
    }

    #[test]
    fn missing_dockerfile_is_an_error() {
        let dir = tempdir().unwrap();
        let project = project(dir.path());
        let mut config = Config::from_yaml(CONFIG).unwrap();
        config.base.template = "alpine-3.20".into();
        let err = compute_lock(&config, &project, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("alpine-3.20.Dockerfile"));
    }
}
