//! Selective rebuild planning for CI: decide which base images a change
//! affects and lay them out as a job matrix with limited parallelism.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use clap::ValueEnum;
use glob::Pattern;
use serde::Serialize;
use tracing::info;

use crate::config::{Config, ToolCategory};
use crate::process::{CommandRunner, Invocation};
use crate::project::{Project, SKELETON_TEMPLATE};
use crate::template::BaseImage;

pub const DIFF_RANGE: &str = "origin/main...HEAD";
pub const DEFAULT_MAX_PARALLEL: usize = 2;

/// Paths whose change invalidates every image.
const REBUILD_ALL: &[&str] = &[
    "image-foundry.yaml",
    "configs/**/*",
    SKELETON_TEMPLATE,
    "compliance/**/*",
    ".github/workflows/**/*",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BuildMode {
    /// Images affected by files changed against origin/main.
    Changed,
    /// Every image with at least one essential tool enabled.
    Config,
    All,
    /// Exactly the images passed with `--images`.
    Select,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatrixEntry {
    pub base: BaseImage,
    pub arch: String,
    pub platform: String,
    pub priority: Priority,
}

/// Shaped for a GitHub Actions `strategy` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildMatrix {
    pub include: Vec<MatrixEntry>,
    #[serde(rename = "max-parallel")]
    pub max_parallel: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatrixPlan {
    Empty { reason: &'static str },
    Build {
        images: Vec<BaseImage>,
        matrix: BuildMatrix,
    },
}

pub fn changed_files(project: &Project, runner: &dyn CommandRunner) -> Result<Vec<String>> {
    let invocation = Invocation::new("git")
        .args(["diff", "--name-only", DIFF_RANGE])
        .current_dir(project.root());
    let stdout = runner
        .capture(&invocation)
        .context("failed to list changed files")?;
    Ok(stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Base images a set of changed paths invalidates, in `BaseImage::ALL` order.
pub fn affected_images(changed: &[String]) -> Vec<BaseImage> {
    let rebuild_all: Vec<Pattern> = REBUILD_ALL
        .iter()
        .filter_map(|p| Pattern::new(p).ok())
        .collect();

    let mut affected = BTreeSet::new();
    for file in changed {
        if rebuild_all.iter().any(|p| p.matches(file)) {
            return BaseImage::ALL.to_vec();
        }
        for base in BaseImage::ALL {
            if *file == crate::project::template_relative(base.name()) {
                affected.insert(base);
            }
        }
    }
    affected.into_iter().collect()
}

/// Nothing worth building: no essential tool and compliance disabled.
pub fn should_skip_build(config: &Config) -> bool {
    let essential = config.tool_installed(ToolCategory::Languages, "go")
        || config.tool_installed(ToolCategory::Security, "trivy")
        || config.tool_installed(ToolCategory::DevOps, "docker")
        || config.security.compliance.enabled;
    !essential
}

pub fn priority_score(base: BaseImage, config: &Config) -> u32 {
    let mut score = match base {
        BaseImage::Ubuntu2404 => 10,
        BaseImage::Ubuntu2204 => 8,
        BaseImage::Alpine320 => 6,
    };
    if config.tool_installed(ToolCategory::Languages, "go") {
        score += 5;
    }
    if config.tool_installed(ToolCategory::Security, "trivy") {
        score += 4;
    }
    if config.tool_installed(ToolCategory::DevOps, "docker") {
        score += 3;
    }
    score
}

pub fn prioritize(images: &[BaseImage], config: &Config) -> Vec<BaseImage> {
    let mut sorted = images.to_vec();
    sorted.sort_by_key(|base| std::cmp::Reverse(priority_score(*base, config)));
    sorted
}

fn entry(base: BaseImage, arch: &str, priority: Priority) -> MatrixEntry {
    MatrixEntry {
        base,
        arch: arch.to_string(),
        platform: Config::platform(arch),
        priority,
    }
}

/// The top image builds for amd64 and arm64; the rest build amd64 only.
pub fn generate_matrix(images: &[BaseImage], config: &Config, max_parallel: usize) -> BuildMatrix {
    let mut matrix = BuildMatrix {
        include: Vec::new(),
        max_parallel: max_parallel.max(1),
    };
    for (idx, base) in prioritize(images, config).into_iter().enumerate() {
        match idx {
            0 => {
                matrix.include.push(entry(base, "amd64", Priority::High));
                matrix.include.push(entry(base, "arm64", Priority::High));
            }
            1 => matrix.include.push(entry(base, "amd64", Priority::Medium)),
            _ => matrix.include.push(entry(base, "amd64", Priority::Low)),
        }
    }
    matrix
}

pub fn plan(
    mode: BuildMode,
    selected: &[BaseImage],
    max_parallel: usize,
    config: &Config,
    project: &Project,
    runner: &dyn CommandRunner,
) -> Result<MatrixPlan> {
    let images = match mode {
        BuildMode::Changed => {
            let changed = changed_files(project, runner)?;
            if changed.is_empty() {
                return Ok(MatrixPlan::Empty {
                    reason: "no_changes",
                });
            }
            let affected = affected_images(&changed);
            info!(
                changed = changed.len(),
                affected = ?affected.iter().map(|b| b.name()).collect::<Vec<_>>(),
                "Resolved affected images"
            );
            skip_unneeded(affected, config)
        }
        BuildMode::Config => skip_unneeded(BaseImage::ALL.to_vec(), config),
        BuildMode::All => BaseImage::ALL.to_vec(),
        BuildMode::Select => selected.to_vec(),
    };

    if images.is_empty() {
        return Ok(MatrixPlan::Empty {
            reason: "no_images",
        });
    }
    let matrix = generate_matrix(&images, config, max_parallel);
    Ok(MatrixPlan::Build { images, matrix })
}

fn skip_unneeded(images: Vec<BaseImage>, config: &Config) -> Vec<BaseImage> {
    if should_skip_build(config) {
        for base in &images {
            info!(base = %base, "Skipping image: no enabled tools");
        }
        return Vec::new();
    }
    images
}
