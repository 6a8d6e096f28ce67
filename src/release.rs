//! Post-build supply-chain steps: SBOM generation with syft, signing and
//! attestation with cosign. These only make sense for pushed images.

use anyhow::{Context, Result};
use tracing::info;

use crate::build::{BuildOutcome, BuildReport};
use crate::config::{Config, arch_slug};
use crate::observability::MetricsCollector;
use crate::process::{CommandRunner, Invocation};
use crate::project::{Project, STATE_DIR};

pub const DEFAULT_SBOM_FORMAT: &str = "spdx-json";
pub const COSIGN_KEY: &str = "cosign.key";

pub fn has_release_steps(config: &Config) -> bool {
    let output = &config.output;
    output.sbom.enabled || signing_enabled(config) || sbom_attestation_enabled(config)
}

fn signing_enabled(config: &Config) -> bool {
    config.output.signing.enabled && config.output.signing.cosign.enabled
}

fn sbom_attestation_enabled(config: &Config) -> bool {
    let attestation = &config.output.attestation;
    attestation.enabled && attestation.sbom_attestation && config.output.sbom.enabled
}

fn sbom_formats(config: &Config) -> Vec<String> {
    let formats: Vec<String> = config
        .output
        .sbom
        .formats
        .iter()
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect();
    if formats.is_empty() {
        vec![DEFAULT_SBOM_FORMAT.to_string()]
    } else {
        formats
    }
}

/// File extension syft output is stored under, e.g. `spdx.json` for `spdx-json`.
pub fn sbom_extension(format: &str) -> String {
    match format {
        "spdx-json" => "spdx.json".to_string(),
        "cyclonedx-json" => "cdx.json".to_string(),
        "cyclonedx-xml" | "cyclonedx" => "cdx.xml".to_string(),
        "syft-json" | "json" => "syft.json".to_string(),
        "spdx-tag-value" | "spdx" => "spdx".to_string(),
        other => other.replace('-', "."),
    }
}

pub fn sbom_relative(arch: &str, format: &str) -> String {
    format!("{STATE_DIR}/sbom/{}.{}", arch_slug(arch), sbom_extension(format))
}

pub fn sbom_invocations(config: &Config, project: &Project, outcome: &BuildOutcome) -> Vec<Invocation> {
    sbom_formats(config)
        .into_iter()
        .map(|format| {
            let target = sbom_relative(&outcome.arch, &format);
            Invocation::new("syft")
                .arg(outcome.pinned_reference())
                .arg("-o")
                .arg(format!("{format}={target}"))
                .current_dir(project.root())
        })
        .collect()
}

pub fn sign_invocation(config: &Config, project: &Project, outcome: &BuildOutcome) -> Invocation {
    let mut invocation = Invocation::new("cosign").args(["sign", "--yes"]);
    if !config.output.signing.cosign.keyless {
        invocation = invocation.args(["--key", COSIGN_KEY]);
    }
    invocation
        .arg(outcome.pinned_reference())
        .current_dir(project.root())
}

pub fn attest_invocation(config: &Config, project: &Project, outcome: &BuildOutcome) -> Invocation {
    let predicate = sbom_relative(&outcome.arch, DEFAULT_SBOM_FORMAT);
    let mut invocation = Invocation::new("cosign").args(["attest", "--yes"]);
    if !config.output.signing.cosign.keyless {
        invocation = invocation.args(["--key", COSIGN_KEY]);
    }
    invocation
        .args(["--type", "spdxjson", "--predicate"])
        .arg(predicate)
        .arg(outcome.pinned_reference())
        .current_dir(project.root())
}

/// SBOM, signature and SBOM attestation for every pushed image.
pub fn publish(
    config: &Config,
    project: &Project,
    runner: &dyn CommandRunner,
    report: &BuildReport,
    metrics: &MetricsCollector,
) -> Result<()> {
    if !has_release_steps(config) {
        return Ok(());
    }
    if config.output.sbom.enabled && runner.executes() {
        project.ensure_state_dir("sbom")?;
    }

    for outcome in &report.outcomes {
        let arch = outcome.arch.as_str();

        if config.output.sbom.enabled {
            info!(image = %outcome.image, "Generating SBOM");
            let mut invocations = sbom_invocations(config, project, outcome);
            // The attestation predicate is always SPDX JSON.
            if sbom_attestation_enabled(config)
                && !sbom_formats(config).iter().any(|f| f == DEFAULT_SBOM_FORMAT)
            {
                invocations.push(
                    Invocation::new("syft")
                        .arg(outcome.pinned_reference())
                        .arg("-o")
                        .arg(format!(
                            "{DEFAULT_SBOM_FORMAT}={}",
                            sbom_relative(arch, DEFAULT_SBOM_FORMAT)
                        ))
                        .current_dir(project.root()),
                );
            }
            for invocation in invocations {
                metrics
                    .time(&format!("sbom:{arch}"), || runner.run(&invocation))
                    .with_context(|| format!("SBOM generation failed for {arch}"))?;
            }
        }

        if signing_enabled(config) {
            info!(image = %outcome.image, "Signing image");
            let invocation = sign_invocation(config, project, outcome);
            metrics
                .time(&format!("sign:{arch}"), || runner.run(&invocation))
                .with_context(|| format!("signing failed for {arch}"))?;
        }

        if sbom_attestation_enabled(config) {
            info!(image = %outcome.image, "Attesting SBOM");
            let invocation = attest_invocation(config, project, outcome);
            metrics
                .time(&format!("attest:{arch}"), || runner.run(&invocation))
                .with_context(|| format!("attestation failed for {arch}"))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::DryRunRunner;

    fn outcome(arch: &str) -> BuildOutcome {
        BuildOutcome {
            arch: arch.into(),
            image: format!("ghcr.io/acme/app:latest-{arch}"),
            digest: Some("sha256:1234".into()),
        }
    }

    #[test]
    fn nothing_runs_without_output_settings() {
        let runner = DryRunRunner::quiet();
        let report = BuildReport {
            outcomes: vec![outcome("amd64")],
        };
        publish(
            &Config::default(),
            &Project::new("/work", "image-foundry.yaml"),
            &runner,
            &report,
            &MetricsCollector::new(),
        )
        .unwrap();
        assert!(runner.invocations().is_empty());
    }

    #[test]
    fn full_release_sequence() {
        let mut config = Config::default();
        config.output.sbom.enabled = true;
        config.output.sbom.formats = vec!["cyclonedx-json".into()];
        config.output.signing.enabled = true;
        config.output.signing.cosign.enabled = true;
        config.output.signing.cosign.keyless = true;
        config.output.attestation.enabled = true;
        config.output.attestation.sbom_attestation = true;

        let runner = DryRunRunner::quiet();
        let report = BuildReport {
            outcomes: vec![outcome("arm64")],
        };
        publish(
            &config,
            &Project::new("/work", "image-foundry.yaml"),
            &runner,
            &report,
            &MetricsCollector::new(),
        )
        .unwrap();

        assert_eq!(
            runner.command_lines(),
            vec![
                "syft ghcr.io/acme/app@sha256:1234 -o cyclonedx-json=.foundry/sbom/arm64.cdx.json",
                "syft ghcr.io/acme/app@sha256:1234 -o spdx-json=.foundry/sbom/arm64.spdx.json",
                "cosign sign --yes ghcr.io/acme/app@sha256:1234",
                "cosign attest --yes --type spdxjson --predicate .foundry/sbom/arm64.spdx.json ghcr.io/acme/app@sha256:1234",
            ]
        );
    }

    #[test]
    fn keyed_signing_passes_key() {
        let mut config = Config::default();
        config.output.signing.cosign.keyless = false;
        let invocation = sign_invocation(
            &config,
            &Project::new("/work", "image-foundry.yaml"),
            &BuildOutcome {
                digest: None,
                ..outcome("amd64")
            },
        );
        assert_eq!(
            invocation.to_string(),
            "cosign sign --yes --key cosign.key ghcr.io/acme/app:latest-amd64"
        );
    }
}
