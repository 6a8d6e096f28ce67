//! Dockerfile generation from the project skeleton template.
//!
//! The skeleton uses a small, line-oriented subset of Go template syntax:
//! `{{ .Name }}` placeholders anywhere on a line, and `if`/`else`/`range`/`end`
//! actions on lines of their own. Blocks nest.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use clap::ValueEnum;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{Config, ToolCategory};
use crate::project::Project;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, ValueEnum)]
pub enum BaseImage {
    #[serde(rename = "ubuntu-24.04")]
    #[value(name = "ubuntu-24.04")]
    Ubuntu2404,
    #[serde(rename = "ubuntu-22.04")]
    #[value(name = "ubuntu-22.04")]
    Ubuntu2204,
    #[serde(rename = "alpine-3.20")]
    #[value(name = "alpine-3.20")]
    Alpine320,
}

impl BaseImage {
    pub const ALL: [BaseImage; 3] = [
        BaseImage::Ubuntu2404,
        BaseImage::Ubuntu2204,
        BaseImage::Alpine320,
    ];

    pub fn name(self) -> &'static str {
        match self {
            BaseImage::Ubuntu2404 => "ubuntu-24.04",
            BaseImage::Ubuntu2204 => "ubuntu-22.04",
            BaseImage::Alpine320 => "alpine-3.20",
        }
    }

    /// The upstream image the generated Dockerfile starts from.
    pub fn image(self) -> &'static str {
        match self {
            BaseImage::Ubuntu2404 => "ubuntu:24.04",
            BaseImage::Ubuntu2204 => "ubuntu:22.04",
            BaseImage::Alpine320 => "alpine:3.20",
        }
    }

    pub fn is_ubuntu(self) -> bool {
        matches!(self, BaseImage::Ubuntu2404 | BaseImage::Ubuntu2204)
    }

    pub fn is_alpine(self) -> bool {
        matches!(self, BaseImage::Alpine320)
    }
}

impl fmt::Display for BaseImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BaseImage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        BaseImage::ALL
            .into_iter()
            .find(|base| base.name() == s.trim())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown base image '{}'. Supported bases: {}",
                    s,
                    BaseImage::ALL.map(BaseImage::name).join(", ")
                )
            })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("line {line}: block opened here is never closed with `{{{{- end }}}}`")]
    Unterminated { line: usize },
    #[error("line {line}: `end` without a matching `if` or `range`")]
    StrayEnd { line: usize },
    #[error("line {line}: `else` outside of an `if` block")]
    StrayElse { line: usize },
    #[error("line {line}: unsupported template action `{action}`")]
    Unsupported { line: usize, action: String },
    #[error("line {line}: unknown variable `.{name}`")]
    UnknownVariable { line: usize, name: String },
    #[error("line {line}: unknown flag `.{name}`")]
    UnknownFlag { line: usize, name: String },
    #[error("line {line}: `{{{{ . }}}}` used outside of a `range` block")]
    DotOutsideRange { line: usize },
    #[error("line {line}: unclosed `{{{{`")]
    UnclosedAction { line: usize },
}

struct ToolBinding {
    category: ToolCategory,
    tool: &'static str,
    flag: &'static str,
    version: Option<(&'static str, &'static str)>,
}

const TOOL_BINDINGS: &[ToolBinding] = &[
    ToolBinding {
        category: ToolCategory::Languages,
        tool: "go",
        flag: "InstallGo",
        version: Some(("GoVersion", "1.22.0")),
    },
    ToolBinding {
        category: ToolCategory::Languages,
        tool: "nodejs",
        flag: "InstallNodeJS",
        version: Some(("NodeVersion", "20")),
    },
    ToolBinding {
        category: ToolCategory::Languages,
        tool: "python",
        flag: "InstallPython",
        version: Some(("PythonVersion", "3.12")),
    },
    ToolBinding {
        category: ToolCategory::Security,
        tool: "trivy",
        flag: "InstallTrivy",
        version: None,
    },
    ToolBinding {
        category: ToolCategory::Security,
        tool: "cosign",
        flag: "InstallCosign",
        version: None,
    },
    ToolBinding {
        category: ToolCategory::Security,
        tool: "syft",
        flag: "InstallSyft",
        version: None,
    },
    ToolBinding {
        category: ToolCategory::DevOps,
        tool: "docker",
        flag: "InstallDocker",
        version: None,
    },
    ToolBinding {
        category: ToolCategory::DevOps,
        tool: "kubectl",
        flag: "InstallKubectl",
        version: Some(("KubectlVersion", "1.29.0")),
    },
    ToolBinding {
        category: ToolCategory::DevOps,
        tool: "helm",
        flag: "InstallHelm",
        version: Some(("HelmVersion", "3.14.0")),
    },
    ToolBinding {
        category: ToolCategory::DevOps,
        tool: "terraform",
        flag: "InstallTerraform",
        version: Some(("TerraformVersion", "1.7.0")),
    },
];

/// Values a skeleton can reference while rendering for one base image.
#[derive(Debug, Clone)]
pub struct TemplateContext {
    base: BaseImage,
    values: BTreeMap<String, String>,
    flags: BTreeMap<String, bool>,
    packages: Vec<String>,
}

impl TemplateContext {
    pub fn new(base: BaseImage) -> Self {
        let mut values = BTreeMap::new();
        values.insert("Base".to_string(), base.name().to_string());
        values.insert("BaseImage".to_string(), base.image().to_string());
        Self {
            base,
            values,
            flags: BTreeMap::new(),
            packages: Vec::new(),
        }
    }

    pub fn from_config(config: &Config, base: BaseImage, timestamp: DateTime<Utc>) -> Self {
        let mut ctx = Self::new(base)
            .with_value("Arch", config.default_arch())
            .with_value("ProjectName", &config.name)
            .with_value("ProjectVersion", &config.version)
            .with_value(
                "Timestamp",
                timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            );

        for binding in TOOL_BINDINGS {
            let tool = config.tool(binding.category, binding.tool);
            ctx = ctx.with_flag(binding.flag, tool.map(|t| t.install).unwrap_or(false));
            if let Some((variable, default)) = binding.version {
                let version = tool
                    .map(|t| t.version.trim())
                    .filter(|v| !v.is_empty())
                    .unwrap_or(default);
                ctx = ctx.with_value(variable, version);
            }
        }

        let optimization = &config.optimization;
        ctx.with_flag("InstallCompliance", config.security.compliance.enabled)
            .with_flag("MultiStage", optimization.multi_stage)
            .with_flag("CacheLayers", optimization.cache_layers)
            .with_flag("Minify", optimization.minify)
            .with_flag("StripDebug", optimization.strip_debug)
            .with_packages(config.tools.packages.iter().cloned())
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn with_flag(mut self, name: impl Into<String>, enabled: bool) -> Self {
        self.flags.insert(name.into(), enabled);
        self
    }

    pub fn with_packages<I: IntoIterator<Item = String>>(mut self, packages: I) -> Self {
        self.packages = packages
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        self
    }

    pub fn base(&self) -> BaseImage {
        self.base
    }

    pub fn value(&self, name: &str) -> Option<String> {
        self.values
            .get(name)
            .cloned()
            .or_else(|| self.flags.get(name).map(bool::to_string))
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.flags.get(name).copied()
    }
}

#[derive(Debug)]
enum Condition {
    Flag { name: String, negate: bool },
    BaseIn(Vec<String>),
}

#[derive(Debug)]
enum Node {
    Text {
        line: usize,
        text: String,
    },
    If {
        line: usize,
        condition: Condition,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
    Range {
        body: Vec<Node>,
    },
}

enum Directive {
    If(Condition),
    Range,
    Else,
    End,
}

enum FrameKind {
    If(Condition),
    Range,
}

struct Frame {
    kind: FrameKind,
    line: usize,
    then: Vec<Node>,
    otherwise: Option<Vec<Node>>,
}

impl Frame {
    fn push(&mut self, node: Node) {
        match &mut self.otherwise {
            Some(otherwise) => otherwise.push(node),
            None => self.then.push(node),
        }
    }
}

/// Render `template` for the context's base image.
pub fn render(template: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
    let nodes = parse(template)?;
    let mut lines = Vec::new();
    render_nodes(&nodes, ctx, None, &mut lines)?;
    let mut output = lines.join("\n");
    if template.ends_with('\n') && !output.is_empty() {
        output.push('\n');
    }
    Ok(output)
}

fn parse(template: &str) -> Result<Vec<Node>, TemplateError> {
    let mut root = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();

    for (idx, raw) in template.lines().enumerate() {
        let line = idx + 1;
        let node = match directive(raw, line)? {
            None => Node::Text {
                line,
                text: raw.to_string(),
            },
            Some(Directive::If(condition)) => {
                stack.push(Frame {
                    kind: FrameKind::If(condition),
                    line,
                    then: Vec::new(),
                    otherwise: None,
                });
                continue;
            }
            Some(Directive::Range) => {
                stack.push(Frame {
                    kind: FrameKind::Range,
                    line,
                    then: Vec::new(),
                    otherwise: None,
                });
                continue;
            }
            Some(Directive::Else) => {
                match stack.last_mut() {
                    Some(frame)
                        if matches!(frame.kind, FrameKind::If(_)) && frame.otherwise.is_none() =>
                    {
                        frame.otherwise = Some(Vec::new());
                    }
                    _ => return Err(TemplateError::StrayElse { line }),
                }
                continue;
            }
            Some(Directive::End) => {
                let frame = stack.pop().ok_or(TemplateError::StrayEnd { line })?;
                match frame.kind {
                    FrameKind::If(condition) => Node::If {
                        line: frame.line,
                        condition,
                        then: frame.then,
                        otherwise: frame.otherwise.unwrap_or_default(),
                    },
                    FrameKind::Range => Node::Range { body: frame.then },
                }
            }
        };

        match stack.last_mut() {
            Some(frame) => frame.push(node),
            None => root.push(node),
        }
    }

    if let Some(frame) = stack.last() {
        return Err(TemplateError::Unterminated { line: frame.line });
    }
    Ok(root)
}

/// Classify a line that consists of exactly one `{{ ... }}` action.
fn directive(raw: &str, line: usize) -> Result<Option<Directive>, TemplateError> {
    let trimmed = raw.trim();
    let Some(inner) = trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
    else {
        return Ok(None);
    };
    if inner.contains("{{") || inner.contains("}}") {
        return Ok(None);
    }
    let action = strip_trim_markers(inner);
    let mut words = action.split_whitespace();
    let unsupported = || TemplateError::Unsupported {
        line,
        action: action.to_string(),
    };

    match words.next() {
        Some("if") => parse_condition(words.collect(), line, action).map(|c| Some(Directive::If(c))),
        Some("range") => match words.collect::<Vec<_>>().as_slice() {
            [".AdditionalPackages"] | ["$.AdditionalPackages"] => Ok(Some(Directive::Range)),
            _ => Err(unsupported()),
        },
        Some("else") if words.next().is_none() => Ok(Some(Directive::Else)),
        Some("end") if words.next().is_none() => Ok(Some(Directive::End)),
        Some("else" | "end" | "with" | "define" | "template" | "block") => Err(unsupported()),
        _ => Ok(None),
    }
}

fn parse_condition(words: Vec<&str>, line: usize, action: &str) -> Result<Condition, TemplateError> {
    let unsupported = || TemplateError::Unsupported {
        line,
        action: action.to_string(),
    };
    match words.as_slice() {
        [flag] => Ok(Condition::Flag {
            name: field_name(flag).ok_or_else(unsupported)?.to_string(),
            negate: false,
        }),
        ["not", flag] => Ok(Condition::Flag {
            name: field_name(flag).ok_or_else(unsupported)?.to_string(),
            negate: true,
        }),
        ["eq", field, candidates @ ..] if !candidates.is_empty() => {
            if field_name(field) != Some("Base") {
                return Err(unsupported());
            }
            let names = candidates
                .iter()
                .map(|c| {
                    c.strip_prefix('"')
                        .and_then(|c| c.strip_suffix('"'))
                        .map(str::to_string)
                        .ok_or_else(unsupported)
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Condition::BaseIn(names))
        }
        _ => Err(unsupported()),
    }
}

fn strip_trim_markers(inner: &str) -> &str {
    let inner = inner.trim();
    let inner = inner.strip_prefix('-').unwrap_or(inner);
    let inner = inner.strip_suffix('-').unwrap_or(inner);
    inner.trim()
}

/// `.Name` or `$.Name` → `Name`.
fn field_name(word: &str) -> Option<&str> {
    let name = word
        .strip_prefix("$.")
        .or_else(|| word.strip_prefix('.'))?;
    (!name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
        .then_some(name)
}

fn render_nodes(
    nodes: &[Node],
    ctx: &TemplateContext,
    item: Option<&str>,
    out: &mut Vec<String>,
) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Text { line, text } => out.push(substitute(text, ctx, item, *line)?),
            Node::If {
                line,
                condition,
                then,
                otherwise,
            } => {
                let branch = if evaluate(condition, ctx, *line)? {
                    then
                } else {
                    otherwise
                };
                render_nodes(branch, ctx, item, out)?;
            }
            Node::Range { body } => {
                for package in &ctx.packages {
                    render_nodes(body, ctx, Some(package), out)?;
                }
            }
        }
    }
    Ok(())
}

fn evaluate(condition: &Condition, ctx: &TemplateContext, line: usize) -> Result<bool, TemplateError> {
    match condition {
        Condition::Flag { name, negate } => {
            let value = ctx.flag(name).ok_or_else(|| TemplateError::UnknownFlag {
                line,
                name: name.clone(),
            })?;
            Ok(value != *negate)
        }
        Condition::BaseIn(names) => Ok(names.iter().any(|n| n == ctx.base.name())),
    }
}

fn substitute(
    text: &str,
    ctx: &TemplateContext,
    item: Option<&str>,
    line: usize,
) -> Result<String, TemplateError> {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or(TemplateError::UnclosedAction { line })?;
        let action = strip_trim_markers(&after[..end]);
        if action == "." {
            output.push_str(item.ok_or(TemplateError::DotOutsideRange { line })?);
        } else {
            let name = field_name(action).ok_or_else(|| TemplateError::Unsupported {
                line,
                action: action.to_string(),
            })?;
            let value = ctx.value(name).ok_or_else(|| TemplateError::UnknownVariable {
                line,
                name: name.to_string(),
            })?;
            output.push_str(&value);
        }
        rest = &after[end + 2..];
    }
    output.push_str(rest);
    Ok(output)
}

/// Structural problems in a generated Dockerfile. Empty means it looks sane.
pub fn lint_dockerfile(content: &str) -> Vec<String> {
    let from_lines: Vec<Vec<&str>> = content
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .filter(|words| {
            words
                .first()
                .map(|w| w.eq_ignore_ascii_case("FROM"))
                .unwrap_or(false)
        })
        .collect();

    let mut issues = Vec::new();
    if from_lines.is_empty() {
        issues.push("Missing FROM instruction".to_string());
    }
    let has_final = from_lines.iter().any(|words| {
        matches!(words.as_slice(), [_, .., alias, name]
            if alias.eq_ignore_ascii_case("AS") && *name == "final")
    });
    if !has_final {
        issues.push("Missing final layer".to_string());
    }
    if from_lines.len() < 2 {
        issues.push("Expected multiple FROM instructions for multi-stage build".to_string());
    }
    issues
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedDockerfile {
    pub base: BaseImage,
    pub path: PathBuf,
    pub issues: Vec<String>,
}

/// Render the skeleton once per base and write `templates/base/<base>.Dockerfile`.
pub fn generate_dockerfiles(
    project: &Project,
    config: &Config,
    skeleton: &Path,
    bases: &[BaseImage],
    timestamp: DateTime<Utc>,
) -> Result<Vec<GeneratedDockerfile>> {
    let template = fs::read_to_string(skeleton)
        .with_context(|| format!("Failed to read template: {}", skeleton.display()))?;

    let bases = if bases.is_empty() {
        &BaseImage::ALL[..]
    } else {
        bases
    };

    let mut generated = Vec::with_capacity(bases.len());
    for &base in bases {
        info!(base = %base, "Processing base image");
        let ctx = TemplateContext::from_config(config, base, timestamp);
        let content = render(&template, &ctx)
            .with_context(|| format!("Failed to render {} for {}", skeleton.display(), base))?;

        let path = project.template_path(base.name());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        fs::write(&path, &content)
            .with_context(|| format!("Failed to write Dockerfile: {}", path.display()))?;
        info!(path = %path.display(), "Generated Dockerfile");

        let issues = lint_dockerfile(&content);
        for issue in &issues {
            warn!(base = %base, "{issue}");
        }
        generated.push(GeneratedDockerfile { base, path, issues });
    }

    Ok(generated)
}
