use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "image-foundry.yaml";

/// In-memory form of `image-foundry.yaml`.
///
/// Every section is optional in the document; absent sections fall back to
/// their `Default` value so a minimal file only needs `name` and `base`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub license: String,
    #[serde(skip_serializing_if = "is_default")]
    pub image: ImageSpec,
    pub base: BaseSpec,
    #[serde(skip_serializing_if = "is_default")]
    pub tools: ToolsSpec,
    #[serde(skip_serializing_if = "is_default")]
    pub security: SecuritySpec,
    #[serde(skip_serializing_if = "is_default")]
    pub optimization: OptimizationSpec,
    #[serde(skip_serializing_if = "is_default")]
    pub testing: TestingSpec,
    #[serde(skip_serializing_if = "is_default")]
    pub pipeline: PipelineSpec,
    #[serde(skip_serializing_if = "is_default")]
    pub output: OutputSpec,
    #[serde(skip_serializing_if = "is_default")]
    pub custom: CustomSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ImageSpec {
    pub name: String,
    pub tag: String,
    pub registry: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BaseSpec {
    pub template: String,
    pub architecture: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolConfig {
    pub install: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
}

impl ToolConfig {
    pub fn installed(version: &str) -> Self {
        Self {
            install: true,
            version: version.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCategory {
    Languages,
    Security,
    DevOps,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolsSpec {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub languages: BTreeMap<String, ToolConfig>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub security: BTreeMap<String, ToolConfig>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub devops: BTreeMap<String, ToolConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,
}

impl ToolsSpec {
    pub fn category(&self, category: ToolCategory) -> &BTreeMap<String, ToolConfig> {
        match category {
            ToolCategory::Languages => &self.languages,
            ToolCategory::Security => &self.security,
            ToolCategory::DevOps => &self.devops,
        }
    }

    /// Every tool across all categories, languages first, each category in
    /// name order.
    pub fn all(&self) -> impl Iterator<Item = (ToolCategory, &str, &ToolConfig)> {
        [
            ToolCategory::Languages,
            ToolCategory::Security,
            ToolCategory::DevOps,
        ]
        .into_iter()
        .flat_map(move |category| {
            self.category(category)
                .iter()
                .map(move |(name, tool)| (category, name.as_str(), tool))
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SecuritySpec {
    #[serde(skip_serializing_if = "is_default")]
    pub trivy: TrivyConfig,
    #[serde(skip_serializing_if = "is_default")]
    pub codeql: CodeQlConfig,
    #[serde(skip_serializing_if = "is_default")]
    pub compliance: ComplianceConfig,
    #[serde(skip_serializing_if = "is_default")]
    pub sast: SastConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TrivyConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub severity: String,
    pub exit_code: i32,
    pub ignore_unfixed: bool,
}

impl Default for TrivyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            severity: String::new(),
            exit_code: 1,
            ignore_unfixed: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CodeQlConfig {
    pub enabled: bool,
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ComplianceConfig {
    pub enabled: bool,
    pub standards: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SastConfig {
    pub enabled: bool,
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OptimizationSpec {
    pub multi_stage: bool,
    pub cache_layers: bool,
    pub minify: bool,
    pub strip_debug: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TestingSpec {
    #[serde(skip_serializing_if = "is_default")]
    pub structure_tests: StructureTestsConfig,
    #[serde(skip_serializing_if = "is_default")]
    pub integration_tests: IntegrationTestsConfig,
    #[serde(skip_serializing_if = "is_default")]
    pub performance_tests: PerformanceTestsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StructureTestsConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub config: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct IntegrationTestsConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub timeout: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PerformanceTestsConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub benchmark_tool: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineSpec {
    #[serde(skip_serializing_if = "is_default")]
    pub github_actions: GitHubActionsConfig,
    #[serde(skip_serializing_if = "is_default")]
    pub artifacts: ArtifactsConfig,
    #[serde(skip_serializing_if = "is_default")]
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GitHubActionsConfig {
    pub matrix: MatrixConfig,
    pub parallel: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct MatrixConfig {
    pub os: Vec<String>,
    pub arch: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    pub retention_days: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub slack: SlackConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SlackConfig {
    pub enabled: bool,
    pub webhook: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputSpec {
    #[serde(skip_serializing_if = "is_default")]
    pub sbom: SbomConfig,
    #[serde(skip_serializing_if = "is_default")]
    pub signing: SigningConfig,
    #[serde(skip_serializing_if = "is_default")]
    pub attestation: AttestationConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SbomConfig {
    pub enabled: bool,
    pub formats: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SigningConfig {
    pub enabled: bool,
    pub cosign: CosignConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CosignConfig {
    pub enabled: bool,
    pub keyless: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AttestationConfig {
    pub enabled: bool,
    pub provenance: bool,
    pub sbom_attestation: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CustomSpec {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pre_build: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub post_build: String,
}

fn is_default<T: Default + PartialEq>(value: &T) -> bool {
    *value == T::default()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("config file not found: {}", path.display());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config YAML: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // An empty document deserializes to `()`, not a mapping.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Fully qualified per-architecture tag, e.g.
    /// `ghcr.io/myorg/myimage:latest-amd64`.
    pub fn image_reference(&self, arch: &str) -> String {
        format!("{}:{}-{}", self.repository(), self.tag(), arch_slug(arch))
    }

    /// `registry/namespace/name` with empty segments dropped.
    pub fn repository(&self) -> String {
        let name = if self.image.name.is_empty() {
            self.name.as_str()
        } else {
            self.image.name.as_str()
        };
        [
            self.image.registry.as_str(),
            self.image.namespace.as_str(),
            name,
        ]
        .into_iter()
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
    }

    pub fn tag(&self) -> &str {
        if self.image.tag.is_empty() {
            "latest"
        } else {
            &self.image.tag
        }
    }

    pub fn platform(arch: &str) -> String {
        format!("linux/{arch}")
    }

    pub fn tool(&self, category: ToolCategory, name: &str) -> Option<&ToolConfig> {
        self.tools.category(category).get(name)
    }

    pub fn tool_installed(&self, category: ToolCategory, name: &str) -> bool {
        self.tool(category, name)
            .map(|tool| tool.install)
            .unwrap_or(false)
    }

    /// `NAME_VERSION=version` for every installed tool that pins a version.
    pub fn tool_build_args(&self) -> Vec<String> {
        self.tools
            .all()
            .filter(|(_, _, tool)| tool.install && !tool.version.trim().is_empty())
            .map(|(_, name, tool)| {
                format!("{}_VERSION={}", build_arg_name(name), tool.version.trim())
            })
            .collect()
    }

    pub fn default_arch(&self) -> &str {
        self.base
            .architecture
            .first()
            .map(String::as_str)
            .unwrap_or("amd64")
    }
}

/// Architecture as it may appear inside a tag or file name: `arm/v7` → `arm-v7`.
pub fn arch_slug(arch: &str) -> String {
    arch.trim().replace('/', "-")
}

fn build_arg_name(tool: &str) -> String {
    tool.trim()
        .chars()
        .map(|c| match c {
            '-' | '.' | ' ' => '_',
            other => other.to_ascii_uppercase(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
name: test-project
version: "1.0.0"
image:
  name: "test-image"
  tag: "latest"
  registry: "ghcr.io"
  namespace: "testorg"
base:
  template: "ubuntu-24.04"
  architecture:
    - amd64
    - arm64
tools:
  languages:
    go:
      version: "1.22"
      install: true
    python:
      install: false
      version: "3.12"
  devops:
    kubectl:
      install: true
      version: "1.29.0"
  security:
    trivy:
      install: true
"#;

    #[test]
    fn load_reads_yaml_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("test-config.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.name, "test-project");
        assert_eq!(config.image.name, "test-image");
        assert_eq!(config.base.architecture, vec!["amd64", "arm64"]);
        assert!(config.tool_installed(ToolCategory::Languages, "go"));
        assert!(!config.tool_installed(ToolCategory::Languages, "python"));
    }

    #[test]
    fn load_reports_missing_file() {
        let temp = tempdir().unwrap();
        let err = Config::load(&temp.path().join("absent.yaml")).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn load_names_the_file_on_malformed_yaml() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("broken.yaml");
        std::fs::write(&path, "name: [unterminated\nbase: {\n").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Failed to parse config YAML: {}", path.display())
        );
        assert!(err.chain().count() > 1);
    }

    #[test]
    fn trivy_exit_code_defaults_to_one() {
        let config = Config::from_yaml("name: x\nsecurity:\n  trivy:\n    enabled: true\n").unwrap();
        assert!(config.security.trivy.enabled);
        assert_eq!(config.security.trivy.exit_code, 1);
    }

    #[test]
    fn image_reference_includes_arch_suffix() {
        let mut config = Config::default();
        config.image.registry = "ghcr.io".into();
        config.image.namespace = "myorg".into();
        config.image.name = "myimage".into();
        config.image.tag = "latest".into();

        assert_eq!(
            config.image_reference("amd64"),
            "ghcr.io/myorg/myimage:latest-amd64"
        );
        assert_eq!(
            config.image_reference("arm/v7"),
            "ghcr.io/myorg/myimage:latest-arm-v7"
        );
    }

    #[test]
    fn image_reference_skips_empty_segments() {
        let mut config = Config {
            name: "fallback".into(),
            ..Config::default()
        };
        assert_eq!(config.image_reference("386"), "fallback:latest-386");

        config.image.namespace = "team".into();
        config.image.tag = "v2".into();
        assert_eq!(config.image_reference("arm64"), "team/fallback:v2-arm64");
    }

    #[test]
    fn build_args_cover_installed_tools_in_order() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(
            config.tool_build_args(),
            vec!["GO_VERSION=1.22", "KUBECTL_VERSION=1.29.0"]
        );
    }

    #[test]
    fn to_yaml_omits_default_sections() {
        let config = Config {
            name: "demo".into(),
            base: BaseSpec {
                template: "alpine-3.20".into(),
                architecture: vec!["amd64".into()],
            },
            ..Config::default()
        };
        let rendered = config.to_yaml().unwrap();
        assert!(rendered.contains("name: demo"));
        assert!(!rendered.contains("security"));
        assert_eq!(Config::from_yaml(&rendered).unwrap(), config);
    }
}
