use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use tracing::{info, warn};

use crate::config::{
    AttestationConfig, BaseSpec, CodeQlConfig, ComplianceConfig, Config, CosignConfig,
    ImageSpec, IntegrationTestsConfig, OptimizationSpec, OutputSpec, PerformanceTestsConfig,
    SastConfig, SbomConfig, SecuritySpec, SigningConfig, StructureTestsConfig, TestingSpec,
    ToolConfig, TrivyConfig,
};
use crate::image_tests::DEFAULT_STRUCTURE_CONFIG;
use crate::project::{COMPLIANCE_DIR, Project, SKELETON_TEMPLATE};
use crate::scan::ComplianceStandard;

pub const PROJECT_DIRS: &[&str] = &[
    "templates/base",
    "templates/agents",
    "configs",
    "tests",
    ".github/workflows",
    "scripts",
    COMPLIANCE_DIR,
];

const SKELETON: &str = include_str!("../assets/dockerfile-template.tmpl");
const STRUCTURE_TESTS: &str = include_str!("../assets/structure-tests.yaml");
const CIS_POLICY: &str = include_str!("../assets/compliance/cis-docker.rego");
const NIST_POLICY: &str = include_str!("../assets/compliance/nist-800-53.rego");
const PCI_POLICY: &str = include_str!("../assets/compliance/pci-dss.rego");

const CONFIG_HEADER: &str = "# ImageFoundry configuration\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Preset {
    /// Go toolchain and Trivy on Ubuntu 24.04 for amd64 and arm64.
    #[default]
    Default,
    /// Bare Alpine image for amd64.
    Minimal,
    /// Kubernetes, Helm, Terraform and Docker CLI tooling.
    Devops,
    /// Scanners, compliance policies, SBOMs and signed images.
    Security,
}

impl Preset {
    pub fn config(self) -> Config {
        match self {
            Preset::Default => default_preset(),
            Preset::Minimal => minimal_preset(),
            Preset::Devops => devops_preset(),
            Preset::Security => security_preset(),
        }
    }
}

#[derive(Debug, Default)]
pub struct InitReport {
    pub created: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

/// Lay out a new project under the project root.
///
/// An existing config file is an error unless `force` is set; other existing
/// files are left alone and reported as skipped.
pub fn init_project(project: &Project, preset: Preset, force: bool) -> Result<InitReport> {
    let config_path = project.config_path();
    if config_path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite",
            config_path.display()
        );
    }

    for dir in PROJECT_DIRS {
        let path = project.path(dir);
        fs::create_dir_all(&path)
            .with_context(|| format!("failed to create directory {}", path.display()))?;
    }

    let config = format!("{CONFIG_HEADER}{}", preset.config().to_yaml()?);
    let mut report = InitReport::default();
    write_file(config_path, &config, true, &mut report)?;

    let mut assets = vec![
        (project.path(SKELETON_TEMPLATE), SKELETON),
        (project.path(DEFAULT_STRUCTURE_CONFIG), STRUCTURE_TESTS),
    ];
    for standard in ComplianceStandard::ALL {
        assets.push((project.policy_path(standard.name()), policy(standard)));
    }
    for (path, content) in assets {
        write_file(&path, content, force, &mut report)?;
    }

    Ok(report)
}

pub fn policy(standard: ComplianceStandard) -> &'static str {
    match standard {
        ComplianceStandard::CisDocker => CIS_POLICY,
        ComplianceStandard::Nist80053 => NIST_POLICY,
        ComplianceStandard::PciDss => PCI_POLICY,
    }
}

pub fn next_steps() -> [&'static str; 4] {
    [
        "Edit image-foundry.yaml to configure your image",
        "Run 'foundry generate' to render Dockerfiles from the template",
        "Run 'foundry validate' to validate configuration",
        "Run 'foundry build' to build your image",
    ]
}

fn write_file(path: &Path, content: &str, overwrite: bool, report: &mut InitReport) -> Result<()> {
    if path.exists() && !overwrite {
        warn!(path = %path.display(), "File exists, skipping");
        report.skipped.push(path.to_path_buf());
        return Ok(());
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "Created");
    report.created.push(path.to_path_buf());
    Ok(())
}

fn default_preset() -> Config {
    let mut config = project_config("my-project", "My custom container image");
    config.image = image("my-custom-image");
    config.base = base("ubuntu-24.04", &["amd64", "arm64"]);
    config
        .tools
        .languages
        .insert("go".into(), ToolConfig::installed("1.22.0"));
    config
        .tools
        .security
        .insert("trivy".into(), ToolConfig::installed("0.50.0"));
    config.tools.packages = strings(&["curl", "git"]);
    config.security.trivy = trivy();
    config.optimization = optimization();
    config
}

fn minimal_preset() -> Config {
    let mut config = project_config("my-project", "Minimal container image");
    config.image = image("my-minimal-image");
    config.base = base("alpine-3.20", &["amd64"]);
    config.tools.packages = strings(&["ca-certificates"]);
    config
}

fn devops_preset() -> Config {
    let mut config = project_config("devops-toolbox", "Deployment tooling image");
    config.image = image("devops-toolbox");
    config.base = base("ubuntu-24.04", &["amd64", "arm64"]);
    let devops = &mut config.tools.devops;
    devops.insert("docker".into(), ToolConfig::installed("26.0"));
    devops.insert("kubectl".into(), ToolConfig::installed("1.29.0"));
    devops.insert("helm".into(), ToolConfig::installed("3.14.0"));
    devops.insert("terraform".into(), ToolConfig::installed("1.7.0"));
    config.tools.packages = strings(&["curl", "git", "jq"]);
    config.security.trivy = trivy();
    config.optimization = optimization();
    config.testing = TestingSpec {
        structure_tests: StructureTestsConfig {
            enabled: true,
            config: DEFAULT_STRUCTURE_CONFIG.into(),
        },
        integration_tests: IntegrationTestsConfig {
            enabled: true,
            timeout: "10m".into(),
        },
        performance_tests: PerformanceTestsConfig::default(),
    };
    config
}

fn security_preset() -> Config {
    let mut config = project_config("secure-base", "Hardened, signed container image");
    config.image = image("secure-base");
    config.base = base("ubuntu-24.04", &["amd64", "arm64"]);
    let security = &mut config.tools.security;
    security.insert("trivy".into(), ToolConfig::installed("0.50.0"));
    security.insert("cosign".into(), ToolConfig::installed("2.2.3"));
    security.insert("syft".into(), ToolConfig::installed("1.0.1"));
    config.security = SecuritySpec {
        trivy: TrivyConfig {
            ignore_unfixed: true,
            ..trivy()
        },
        codeql: CodeQlConfig::default(),
        compliance: ComplianceConfig {
            enabled: true,
            standards: ComplianceStandard::ALL
                .map(|s| s.name().to_string())
                .to_vec(),
        },
        sast: SastConfig {
            enabled: true,
            tools: strings(&["hadolint"]),
        },
    };
    config.optimization = optimization();
    config.testing.structure_tests = StructureTestsConfig {
        enabled: true,
        config: DEFAULT_STRUCTURE_CONFIG.into(),
    };
    config.output = OutputSpec {
        sbom: SbomConfig {
            enabled: true,
            formats: strings(&["spdx-json", "cyclonedx-json"]),
        },
        signing: SigningConfig {
            enabled: true,
            cosign: CosignConfig {
                enabled: true,
                keyless: true,
            },
        },
        attestation: AttestationConfig {
            enabled: true,
            provenance: true,
            sbom_attestation: true,
        },
    };
    config
}

fn project_config(name: &str, description: &str) -> Config {
    Config {
        name: name.into(),
        version: "1.0.0".into(),
        description: description.into(),
        ..Config::default()
    }
}

fn image(name: &str) -> ImageSpec {
    ImageSpec {
        name: name.into(),
        tag: "latest".into(),
        registry: "ghcr.io".into(),
        namespace: "myorg".into(),
    }
}

fn base(template: &str, architectures: &[&str]) -> BaseSpec {
    BaseSpec {
        template: template.into(),
        architecture: strings(architectures),
    }
}

fn trivy() -> TrivyConfig {
    TrivyConfig {
        enabled: true,
        severity: "HIGH,CRITICAL".into(),
        ..TrivyConfig::default()
    }
}

fn optimization() -> OptimizationSpec {
    OptimizationSpec {
        multi_stage: true,
        cache_layers: true,
        minify: false,
        strip_debug: false,
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}
