use std::fs;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::observability::MetricsCollector;
use crate::process::{CommandRunner, Invocation};
use crate::project::{Project, STATE_DIR, policy_relative, template_relative};

pub const DEFAULT_SEVERITY: &str = "HIGH,CRITICAL";
pub const COMPLIANCE_INPUT: &str = ".foundry/compliance-input.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplianceStandard {
    CisDocker,
    Nist80053,
    PciDss,
}

impl ComplianceStandard {
    pub const ALL: [ComplianceStandard; 3] = [
        ComplianceStandard::CisDocker,
        ComplianceStandard::Nist80053,
        ComplianceStandard::PciDss,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "cis" | "cis-docker" | "cis-docker-benchmark" => Some(Self::CisDocker),
            "nist" | "nist-800-53" => Some(Self::Nist80053),
            "pci" | "pci-dss" => Some(Self::PciDss),
            _ => None,
        }
    }

    /// Canonical name; also the policy file stem under `compliance/`.
    pub fn name(self) -> &'static str {
        match self {
            Self::CisDocker => "cis-docker",
            Self::Nist80053 => "nist-800-53",
            Self::PciDss => "pci-dss",
        }
    }

    /// Rego package below `foundry`, e.g. `data.foundry.cis`.
    pub fn package(self) -> &'static str {
        match self {
            Self::CisDocker => "cis",
            Self::Nist80053 => "nist",
            Self::PciDss => "pci",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SastTool {
    Semgrep,
    Gosec,
    Bandit,
    Hadolint,
}

impl SastTool {
    pub const ALL: [SastTool; 4] = [
        SastTool::Semgrep,
        SastTool::Gosec,
        SastTool::Bandit,
        SastTool::Hadolint,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|tool| tool.name().eq_ignore_ascii_case(name.trim()))
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Semgrep => "semgrep",
            Self::Gosec => "gosec",
            Self::Bandit => "bandit",
            Self::Hadolint => "hadolint",
        }
    }

    fn invocation(self, config: &Config) -> Invocation {
        match self {
            Self::Semgrep => Invocation::new("semgrep").args(["scan", "--config", "auto", "--error", "."]),
            Self::Gosec => Invocation::new("gosec").arg("./..."),
            Self::Bandit => Invocation::new("bandit").args(["-r", "."]),
            Self::Hadolint => {
                Invocation::new("hadolint").arg(template_relative(config.base.template.trim()))
            }
        }
    }
}

pub fn trivy_invocation(config: &Config, project: &Project, image: &str) -> Invocation {
    let trivy = &config.security.trivy;
    let severity = if trivy.severity.trim().is_empty() {
        DEFAULT_SEVERITY
    } else {
        trivy.severity.trim()
    };
    let mut invocation = Invocation::new("trivy").args([
        "image".to_string(),
        "--severity".to_string(),
        severity.to_string(),
        "--exit-code".to_string(),
        trivy.exit_code.to_string(),
    ]);
    if trivy.ignore_unfixed {
        invocation = invocation.arg("--ignore-unfixed");
    }
    invocation.arg(image).current_dir(project.root())
}

pub fn compliance_invocation(project: &Project, standard: ComplianceStandard) -> Invocation {
    Invocation::new("opa")
        .args([
            "eval",
            "--fail-defined",
            "--format",
            "pretty",
            "--input",
            COMPLIANCE_INPUT,
            "--data",
        ])
        .arg(policy_relative(standard.name()))
        .arg(format!("data.foundry.{}.deny[msg]", standard.package()))
        .current_dir(project.root())
}

pub fn codeql_invocations(project: &Project, language: &str) -> [Invocation; 2] {
    let database = format!("{STATE_DIR}/codeql/{language}");
    [
        Invocation::new("codeql")
            .args(["database", "create"])
            .arg(database.clone())
            .arg("--language")
            .arg(language)
            .arg("--overwrite")
            .current_dir(project.root()),
        Invocation::new("codeql")
            .args(["database", "analyze"])
            .arg(database.clone())
            .args(["--format", "sarif-latest", "--output"])
            .arg(format!("{database}.sarif"))
            .current_dir(project.root()),
    ]
}

fn run_compliance(
    config: &Config,
    project: &Project,
    runner: &dyn CommandRunner,
    image: &str,
    metrics: &MetricsCollector,
) -> Result<()> {
    let inspect = Invocation::new("docker")
        .args(["image", "inspect"])
        .arg(image)
        .current_dir(project.root());
    let document = runner
        .capture(&inspect)
        .with_context(|| format!("failed to inspect {image}"))?;
    if runner.executes() {
        project.ensure_state_dir("")?;
        let path = project.path(COMPLIANCE_INPUT);
        fs::write(&path, document)
            .with_context(|| format!("Failed to write compliance input: {}", path.display()))?;
    }

    for name in &config.security.compliance.standards {
        let standard = ComplianceStandard::parse(name)
            .with_context(|| format!("unknown compliance standard '{name}'"))?;
        info!(standard = standard.name(), "Evaluating compliance policy");
        let invocation = compliance_invocation(project, standard);
        metrics
            .time(&format!("compliance:{}", standard.name()), || {
                runner.run(&invocation)
            })
            .with_context(|| format!("{} policy reported violations", standard.name()))?;
    }
    Ok(())
}

/// Trivy, compliance, SAST, CodeQL; the first failure aborts.
pub fn run_scans(
    config: &Config,
    project: &Project,
    runner: &dyn CommandRunner,
    arch: &str,
    metrics: &MetricsCollector,
) -> Result<()> {
    let image = config.image_reference(arch);
    let security = &config.security;

    if security.trivy.enabled {
        info!(image = %image, "Running Trivy vulnerability scan");
        let invocation = trivy_invocation(config, project, &image);
        metrics
            .time("scan:trivy", || runner.run(&invocation))
            .context("Trivy scan failed")?;
    }

    if security.compliance.enabled {
        info!(image = %image, "Running compliance checks");
        run_compliance(config, project, runner, &image, metrics)
            .context("compliance check failed")?;
    }

    if security.sast.enabled {
        info!("Running SAST analysis");
        for name in &security.sast.tools {
            let tool = SastTool::parse(name)
                .with_context(|| format!("unknown SAST tool '{name}'"))?;
            let invocation = tool.invocation(config).current_dir(project.root());
            metrics
                .time(&format!("sast:{}", tool.name()), || runner.run(&invocation))
                .with_context(|| format!("SAST failed: {}", tool.name()))?;
        }
    }

    if security.codeql.enabled {
        info!("Running CodeQL analysis");
        for language in &security.codeql.languages {
            for invocation in codeql_invocations(project, language.trim()) {
                metrics
                    .time(&format!("codeql:{language}"), || runner.run(&invocation))
                    .with_context(|| format!("CodeQL failed for {language}"))?;
            }
        }
    }

    Ok(())
}
