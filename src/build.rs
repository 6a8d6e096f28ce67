use std::fs;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::Config;
use crate::observability::MetricsCollector;
use crate::process::{CommandRunner, Invocation};
use crate::project::{Project, cache_relative, metadata_relative, template_relative};
use crate::release;

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// `--push` when set, `--load` otherwise.
    pub push: bool,
    /// Subset of the configured architectures; empty means all of them.
    pub architectures: Vec<String>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            push: true,
            architectures: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildOutcome {
    pub arch: String,
    pub image: String,
    pub digest: Option<String>,
}

impl BuildOutcome {
    /// `repo@sha256:...` when the digest is known, the tag otherwise.
    pub fn pinned_reference(&self) -> String {
        match &self.digest {
            Some(digest) => {
                let repository = self
                    .image
                    .rsplit_once(':')
                    .filter(|(repo, tag)| !repo.is_empty() && !tag.contains('/'))
                    .map(|(repo, _)| repo)
                    .unwrap_or(&self.image);
                format!("{repository}@{digest}")
            }
            None => self.image.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub outcomes: Vec<BuildOutcome>,
}

/// Partial view of the JSON buildx writes with `--metadata-file`.
#[derive(Deserialize)]
struct MetadataFile {
    #[serde(rename = "containerimage.digest")]
    containerimage_digest: Option<String>,
}

/// The configured architectures, narrowed to `filter` when it is non-empty.
pub fn select_architectures(config: &Config, filter: &[String]) -> Result<Vec<String>> {
    if filter.is_empty() {
        return Ok(config.base.architecture.clone());
    }
    for arch in filter {
        if !config.base.architecture.contains(arch) {
            bail!(
                "architecture '{}' is not configured (configured: {})",
                arch,
                config.base.architecture.join(", ")
            );
        }
    }
    Ok(config
        .base
        .architecture
        .iter()
        .filter(|arch| filter.contains(arch))
        .cloned()
        .collect())
}

pub fn buildx_invocation(config: &Config, project: &Project, arch: &str, push: bool) -> Invocation {
    let mut args = vec![
        "buildx".to_string(),
        "build".to_string(),
        "--platform".to_string(),
        Config::platform(arch),
        "--file".to_string(),
        template_relative(config.base.template.trim()),
        "--tag".to_string(),
        config.image_reference(arch),
    ];

    for build_arg in config.tool_build_args() {
        args.push("--build-arg".into());
        args.push(build_arg);
    }

    let labels = [
        ("title", config.name.as_str()),
        ("version", config.version.as_str()),
        ("description", config.description.as_str()),
        ("authors", config.author.as_str()),
        ("licenses", config.license.as_str()),
    ];
    for (key, value) in labels {
        if !value.trim().is_empty() {
            args.push("--label".into());
            args.push(format!("org.opencontainers.image.{key}={}", value.trim()));
        }
    }

    if config.optimization.cache_layers {
        let cache = cache_relative(arch);
        args.push("--cache-from".into());
        args.push(format!("type=local,src={cache}"));
        args.push("--cache-to".into());
        args.push(format!("type=local,dest={cache},mode=max"));
    }

    let attestation = &config.output.attestation;
    if push && attestation.enabled {
        if attestation.provenance {
            args.push("--provenance=mode=max".into());
        }
        if attestation.sbom_attestation {
            args.push("--sbom=true".into());
        }
    }

    if push {
        args.push("--metadata-file".into());
        args.push(metadata_relative(arch));
        args.push("--push".into());
    } else {
        args.push("--load".into());
    }
    args.push(".".into());

    Invocation::new("docker")
        .args(args)
        .current_dir(project.root())
}

pub fn run_hook(runner: &dyn CommandRunner, project: &Project, label: &str, script: &str) -> Result<()> {
    info!(hook = label, "Running {label} hook");
    let invocation = Invocation::shell(script).current_dir(project.root());
    runner
        .run(&invocation)
        .with_context(|| format!("{label} hook failed"))
}

fn read_digest(project: &Project, arch: &str) -> Option<String> {
    let path = project.path(metadata_relative(arch));
    let content = fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<MetadataFile>(&content) {
        Ok(metadata) => metadata.containerimage_digest,
        Err(err) => {
            warn!(path = %path.display(), "Unreadable buildx metadata: {err}");
            None
        }
    }
}

/// One `docker buildx build` per architecture, in configuration order.
pub fn build_images(
    config: &Config,
    project: &Project,
    runner: &dyn CommandRunner,
    options: &BuildOptions,
    metrics: &MetricsCollector,
) -> Result<BuildReport> {
    let architectures = select_architectures(config, &options.architectures)?;
    if options.push && runner.executes() {
        project.ensure_state_dir("")?;
    }

    let mut report = BuildReport::default();
    for arch in architectures {
        info!(arch = %arch, "Building for architecture");
        let invocation = buildx_invocation(config, project, &arch, options.push);
        metrics
            .time(&format!("build:{arch}"), || runner.run(&invocation))
            .with_context(|| format!("failed to build for {arch}"))?;

        let digest = if options.push && runner.executes() {
            read_digest(project, &arch)
        } else {
            None
        };
        let outcome = BuildOutcome {
            image: config.image_reference(&arch),
            arch,
            digest,
        };
        info!(image = %outcome.image, digest = ?outcome.digest, "Image built");
        report.outcomes.push(outcome);
    }
    Ok(report)
}

/// Pre-build hook, images, release steps, post-build hook.
pub fn run_build(
    config: &Config,
    project: &Project,
    runner: &dyn CommandRunner,
    options: &BuildOptions,
    metrics: &MetricsCollector,
) -> Result<BuildReport> {
    let started = Instant::now();

    let pre_build = config.custom.pre_build.trim();
    if !pre_build.is_empty() {
        metrics.time("hook:pre-build", || {
            run_hook(runner, project, "pre-build", pre_build)
        })?;
    }

    let report = build_images(config, project, runner, options, metrics)?;

    if options.push {
        release::publish(config, project, runner, &report, metrics)?;
    } else if release::has_release_steps(config) {
        warn!("Images were loaded locally, not pushed; skipping SBOM, signing and attestation");
    }

    let post_build = config.custom.post_build.trim();
    if !post_build.is_empty() {
        metrics.time("hook:post-build", || {
            run_hook(runner, project, "post-build", post_build)
        })?;
    }

    metrics.record_total_duration(started.elapsed());
    Ok(report)
}
