use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::{DEFAULT_CONFIG_FILE, arch_slug};

pub const SKELETON_TEMPLATE: &str = "templates/dockerfile-template.tmpl";
pub const BASE_TEMPLATE_DIR: &str = "templates/base";
pub const COMPLIANCE_DIR: &str = "compliance";
pub const STATE_DIR: &str = ".foundry";

/// Resolves every on-disk location the tool touches against one project root.
#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
    config_path: PathBuf,
}

impl Project {
    pub fn new(root: impl Into<PathBuf>, config_path: impl AsRef<Path>) -> Self {
        let root = root.into();
        let config_path = config_path.as_ref();
        let config_path = if config_path.is_absolute() {
            config_path.to_path_buf()
        } else {
            root.join(config_path)
        };
        Self { root, config_path }
    }

    /// Root is `project_dir` when given, the current directory otherwise.
    pub fn discover(project_dir: Option<&Path>, config: Option<&Path>) -> Result<Self> {
        let cwd = env::current_dir().context("Failed to determine current directory")?;
        let root = match project_dir {
            Some(dir) if dir.is_absolute() => dir.to_path_buf(),
            Some(dir) => cwd.join(dir),
            None => cwd,
        };
        let config = config.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        Ok(Self::new(root, config))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    pub fn skeleton_path(&self) -> PathBuf {
        self.path(SKELETON_TEMPLATE)
    }

    pub fn template_path(&self, stem: &str) -> PathBuf {
        self.path(template_relative(stem))
    }

    pub fn policy_path(&self, standard: &str) -> PathBuf {
        self.path(policy_relative(standard))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.path(STATE_DIR)
    }

    pub fn ensure_state_dir(&self, sub: &str) -> Result<PathBuf> {
        let dir = if sub.is_empty() {
            self.state_dir()
        } else {
            self.state_dir().join(sub)
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;
        Ok(dir)
    }

    /// Strip the root prefix so command lines stay short and reproducible.
    pub fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

pub fn template_relative(stem: &str) -> String {
    format!("{BASE_TEMPLATE_DIR}/{stem}.Dockerfile")
}

pub fn policy_relative(standard: &str) -> String {
    format!("{COMPLIANCE_DIR}/{standard}.rego")
}

pub fn metadata_relative(arch: &str) -> String {
    format!("{STATE_DIR}/metadata-{}.json", arch_slug(arch))
}

pub fn cache_relative(arch: &str) -> String {
    format!("{STATE_DIR}/cache/{}", arch_slug(arch))
}
