use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::Config;
use crate::image_tests::BenchmarkTool;
use crate::process::parse_duration;
use crate::project::Project;
use crate::scan::{ComplianceStandard, SastTool};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_config(config: &Config, project: &Project) -> ValidationReport {
    let mut report = validate_required(config, project);
    report.merge(validate_tools(config));
    report.merge(validate_security(config));
    report.merge(validate_testing(config));
    report.merge(validate_output(config));
    report.merge(validate_pipeline(config));
    report
}

fn validate_required(config: &Config, project: &Project) -> ValidationReport {
    let mut report = ValidationReport::default();

    if config.name.trim().is_empty() {
        report.errors.push("project name is required".into());
    }

    if config.base.template.trim().is_empty() {
        report.errors.push("base template is required".into());
    }

    if config.base.architecture.is_empty() {
        report
            .errors
            .push("at least one architecture is required".into());
    }

    if !config.base.template.trim().is_empty() {
        let path = project.template_path(config.base.template.trim());
        if !path.is_file() {
            report.errors.push(format!(
                "template '{}' not found at {}",
                config.base.template,
                project.relative(&path).display()
            ));
        }
    }

    let mut seen = BTreeSet::new();
    for (idx, arch) in config.base.architecture.iter().enumerate() {
        if arch.trim().is_empty() {
            report
                .errors
                .push(format!("architecture {} is empty", idx + 1));
        } else if arch.chars().any(char::is_whitespace) {
            report
                .errors
                .push(format!("architecture '{arch}' must not contain whitespace"));
        } else if !seen.insert(arch.as_str()) {
            report
                .warnings
                .push(format!("architecture '{arch}' is listed more than once"));
        }
    }

    report
}

fn validate_tools(config: &Config) -> ValidationReport {
    let mut report = ValidationReport::default();
    for (_, name, tool) in config.tools.all() {
        if tool.install && tool.version.trim().is_empty() {
            report.warnings.push(format!(
                "tool '{name}' is installed without a version; the template default applies"
            ));
        }
    }
    for package in &config.tools.packages {
        if package.trim().is_empty() {
            report.errors.push("package names cannot be empty".into());
        }
    }
    report
}

fn validate_security(config: &Config) -> ValidationReport {
    let mut report = ValidationReport::default();
    let security = &config.security;

    if security.compliance.enabled {
        if security.compliance.standards.is_empty() {
            report
                .warnings
                .push("compliance is enabled but no standards are listed".into());
        }
        for standard in &security.compliance.standards {
            if ComplianceStandard::parse(standard).is_none() {
                report.errors.push(format!(
                    "unknown compliance standard '{standard}' (expected one of: {})",
                    ComplianceStandard::ALL.map(ComplianceStandard::name).join(", ")
                ));
            }
        }
    }

    if security.sast.enabled {
        for tool in &security.sast.tools {
            if SastTool::parse(tool).is_none() {
                report.errors.push(format!(
                    "unknown SAST tool '{tool}' (expected one of: {})",
                    SastTool::ALL.map(SastTool::name).join(", ")
                ));
            }
        }
    }

    if security.codeql.enabled && security.codeql.languages.is_empty() {
        report
            .warnings
            .push("CodeQL is enabled but no languages are listed".into());
    }

    report
}

fn validate_testing(config: &Config) -> ValidationReport {
    let mut report = ValidationReport::default();
    let testing = &config.testing;

    let timeout = testing.integration_tests.timeout.trim();
    if !timeout.is_empty() && parse_duration(timeout).is_none() {
        report.errors.push(format!(
            "integration test timeout '{timeout}' is not a duration like 30s, 10m or 1h"
        ));
    }

    let tool = testing.performance_tests.benchmark_tool.trim();
    if !tool.is_empty() && BenchmarkTool::parse(tool).is_none() {
        report.errors.push(format!(
            "unknown benchmark tool '{tool}' (expected one of: {})",
            BenchmarkTool::ALL.map(BenchmarkTool::name).join(", ")
        ));
    }

    report
}

fn validate_output(config: &Config) -> ValidationReport {
    let mut report = ValidationReport::default();
    let output = &config.output;

    if output.attestation.enabled && output.attestation.sbom_attestation && !output.sbom.enabled
    {
        report
            .errors
            .push("SBOM attestation requires output.sbom.enabled".into());
    }

    if output.signing.enabled && !output.signing.cosign.enabled {
        report
            .warnings
            .push("signing is enabled but cosign is not; images will not be signed".into());
    }

    report
}

fn validate_pipeline(config: &Config) -> ValidationReport {
    let mut report = ValidationReport::default();
    let pipeline = &config.pipeline;

    let slack = &pipeline.notifications.slack;
    if slack.enabled && slack.webhook.trim().is_empty() {
        report
            .warnings
            .push("slack notifications are enabled without a webhook".into());
    }

    let uses_actions = !pipeline.github_actions.matrix.os.is_empty()
        || !pipeline.github_actions.matrix.arch.is_empty();
    if uses_actions && pipeline.artifacts.retention_days == 0 {
        report
            .warnings
            .push("pipeline.artifacts.retention_days is 0; artifacts will use the CI default".into());
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BaseSpec, ToolConfig};
    use tempfile::{TempDir, tempdir};

    fn project_with_template(stem: &str) -> (TempDir, Project) {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("templates/base");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{stem}.Dockerfile")), "FROM ubuntu\n").unwrap();
        let project = Project::new(temp.path(), "image-foundry.yaml");
        (temp, project)
    }

    fn config(name: &str, template: &str, archs: &[&str]) -> Config {
        Config {
            name: name.into(),
            base: BaseSpec {
                template: template.into(),
                architecture: archs.iter().map(|a| a.to_string()).collect(),
            },
            ..Config::default()
        }
    }

    #[test]
    fn required_fields() {
        let cases = [
            ("valid config", config("test", "ubuntu-24.04", &["amd64"]), None),
            (
                "missing name",
                config("", "ubuntu-24.04", &["amd64"]),
                Some("project name is required"),
            ),
            (
                "missing template",
                config("test", "", &["amd64"]),
                Some("base template is required"),
            ),
            (
                "no architecture",
                config("test", "ubuntu-24.04", &[]),
                Some("at least one architecture is required"),
            ),
        ];

        for (label, cfg, expected) in cases {
            let (_temp, project) = project_with_template("ubuntu-24.04");
            let report = validate_config(&cfg, &project);
            match expected {
                None => assert!(report.is_ok(), "{label}: {:?}", report.errors),
                Some(message) => assert_eq!(
                    report.errors.first().map(String::as_str),
                    Some(message),
                    "{label}"
                ),
            }
        }
    }

    #[test]
    fn missing_template_file_is_reported() {
        let (_temp, project) = project_with_template("ubuntu-24.04");
        let report = validate_config(&config("test", "alpine-3.20", &["amd64"]), &project);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(
            report.errors[0],
            "template 'alpine-3.20' not found at templates/base/alpine-3.20.Dockerfile"
        );
    }

    #[test]
    fn architecture_variants_are_accepted() {
        let (_temp, project) = project_with_template("ubuntu-24.04");
        for arch in ["amd64", "arm64", "arm/v7", "386"] {
            let report = validate_config(&config("test", "ubuntu-24.04", &[arch]), &project);
            assert!(report.is_ok(), "{arch}: {:?}", report.errors);
        }
        let report = validate_config(
            &config("test", "ubuntu-24.04", &["amd64", "amd64", "arm 64"]),
            &project,
        );
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn semantic_checks() {
        let (_temp, project) = project_with_template("ubuntu-24.04");
        let mut cfg = config("test", "ubuntu-24.04", &["amd64"]);
        cfg.security.compliance.enabled = true;
        cfg.security.compliance.standards = vec!["cis".into(), "iso-27001".into()];
        cfg.security.sast.enabled = true;
        cfg.security.sast.tools = vec!["semgrep".into(), "sonar".into()];
        cfg.testing.integration_tests.timeout = "soon".into();
        cfg.testing.performance_tests.benchmark_tool = "ab".into();
        cfg.output.attestation.enabled = true;
        cfg.output.attestation.sbom_attestation = true;
        cfg.tools
            .languages
            .insert("go".into(), ToolConfig::installed(""));

        let report = validate_config(&cfg, &project);
        assert_eq!(report.errors.len(), 5, "{:?}", report.errors);
        assert!(report.errors.iter().any(|e| e.contains("iso-27001")));
        assert!(report.errors.iter().any(|e| e.contains("sonar")));
        assert!(report.errors.iter().any(|e| e.contains("soon")));
        assert!(report.errors.iter().any(|e| e.contains("'ab'")));
        assert!(report.errors.iter().any(|e| e.contains("SBOM attestation")));
        assert!(report.warnings.iter().any(|w| w.contains("'go'")));
    }

    #[test]
    fn slack_without_webhook_warns() {
        let (_temp, project) = project_with_template("ubuntu-24.04");
        let mut cfg = config("test", "ubuntu-24.04", &["amd64"]);
        cfg.pipeline.notifications.slack.enabled = true;

        let report = validate_config(&cfg, &project);
        assert!(report.is_ok());
        assert_eq!(
            report.warnings,
            vec!["slack notifications are enabled without a webhook"]
        );

        cfg.pipeline.notifications.slack.webhook = "https://hooks.slack.test/T000".into();
        assert!(validate_config(&cfg, &project).warnings.is_empty());
    }

    #[test]
    fn signing_without_cosign_warns() {
        let (_temp, project) = project_with_template("ubuntu-24.04");
        let mut cfg = config("test", "ubuntu-24.04", &["amd64"]);
        cfg.output.signing.enabled = true;

        let report = validate_config(&cfg, &project);
        assert!(report.is_ok());
        assert_eq!(
            report.warnings,
            vec!["signing is enabled but cosign is not; images will not be signed"]
        );

        cfg.output.signing.cosign.enabled = true;
        assert!(validate_config(&cfg, &project).warnings.is_empty());
    }

    #[test]
    fn zero_retention_warns_only_for_ci_matrices() {
        let (_temp, project) = project_with_template("ubuntu-24.04");
        let mut cfg = config("test", "ubuntu-24.04", &["amd64"]);
        assert!(validate_config(&cfg, &project).warnings.is_empty());

        cfg.pipeline.github_actions.matrix.os = vec!["ubuntu-latest".into()];
        let report = validate_config(&cfg, &project);
        assert!(report.is_ok());
        assert_eq!(
            report.warnings,
            vec!["pipeline.artifacts.retention_days is 0; artifacts will use the CI default"]
        );

        cfg.pipeline.artifacts.retention_days = 14;
        assert!(validate_config(&cfg, &project).warnings.is_empty());
    }
}
