use std::fs::{self, File};
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::Shell;
use image_foundry::build::{BuildOptions, run_build, select_architectures};
use image_foundry::config::{Config, DEFAULT_CONFIG_FILE};
use image_foundry::image_tests::run_image_tests;
use image_foundry::lockfile::{DEFAULT_LOCKFILE, compute_lock, write_lock};
use image_foundry::matrix::{BuildMode, DEFAULT_MAX_PARALLEL, MatrixPlan, plan};
use image_foundry::observability::{MetricsCollector, log_snapshot};
use image_foundry::process::{CommandRunner, DryRunRunner, SystemRunner};
use image_foundry::project::Project;
use image_foundry::scaffold::{Preset, init_project, next_steps};
use image_foundry::scan::run_scans;
use image_foundry::template::{BaseImage, generate_dockerfiles};
use image_foundry::validation::validate_config;
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};

const TAGLINE: &str = "A powerful container image builder with E2E CI/CD";

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing(cli.otlp_endpoint.as_deref())?;

    let result = match cli.command {
        Some(command) => {
            let ctx = CommandContext::new(&cli.global)?;
            dispatch(command, &ctx)
        }
        None => {
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if cli.otlp_endpoint.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries machine output (matrix JSON, completions).
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal());

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "image-foundry")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
            return Ok(());
        }
    }

    #[cfg(not(feature = "otel"))]
    if let Some(endpoint) = otlp_endpoint {
        eprintln!(
            "warning: --otlp-endpoint '{}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel.",
            endpoint
        );
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

struct CommandContext {
    project: Project,
    runner: Box<dyn CommandRunner>,
}

impl CommandContext {
    fn new(global: &GlobalArgs) -> Result<Self> {
        let project = Project::discover(global.project_dir.as_deref(), Some(&global.config))?;
        let runner: Box<dyn CommandRunner> = if global.dry_run {
            info!("Dry run: external commands are printed, not executed");
            Box::new(DryRunRunner::new())
        } else {
            Box::new(SystemRunner)
        };
        Ok(Self { project, runner })
    }

    fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    fn config_label(&self) -> String {
        self.project
            .relative(self.project.config_path())
            .display()
            .to_string()
    }

    fn load_config(&self) -> Result<Config> {
        Config::load(self.project.config_path())
    }

    /// Load, validate and log every finding; errors abort.
    fn load_validated(&self, action: &str) -> Result<Config> {
        let config = self.load_config()?;
        let report = validate_config(&config, &self.project);
        let file = self.config_label();

        for warning in &report.warnings {
            warn!(file = %file, "{warning}");
        }
        if !report.is_ok() {
            for error_msg in &report.errors {
                error!(file = %file, "{error_msg}");
            }
            bail!(
                "Cannot {action} due to {} validation error(s)",
                report.errors.len()
            );
        }
        Ok(config)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project.path(path)
        }
    }
}

fn dispatch(command: Commands, ctx: &CommandContext) -> Result<()> {
    match command {
        Commands::Init { preset, force } => init_cmd(ctx, preset, force),
        Commands::Validate => validate_cmd(ctx),
        Commands::Generate { bases, template } => generate_cmd(ctx, &bases, template),
        Commands::Build {
            arch,
            no_push,
            print_metrics,
            metrics_json,
            metrics_prometheus,
        } => build_cmd(
            ctx,
            BuildOptions {
                push: !no_push,
                architectures: arch,
            },
            print_metrics,
            metrics_json,
            metrics_prometheus,
        ),
        Commands::Test { arch } => test_cmd(ctx, arch),
        Commands::Scan { arch } => scan_cmd(ctx, arch),
        Commands::Matrix {
            mode,
            images,
            max_parallel,
            output,
            summary,
        } => matrix_cmd(ctx, mode, &images, max_parallel, output, summary),
        Commands::Lock { output } => lock_cmd(ctx, output),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "foundry", &mut io::stdout());
            Ok(())
        }
        Commands::Version => {
            println!("ImageFoundry v{}", env!("CARGO_PKG_VERSION"));
            println!("{TAGLINE}");
            Ok(())
        }
    }
}

fn init_cmd(ctx: &CommandContext, preset: Preset, force: bool) -> Result<()> {
    info!(root = %ctx.project.root().display(), ?preset, "Initializing ImageFoundry project");
    let report = init_project(&ctx.project, preset, force)?;
    info!(
        created = report.created.len(),
        skipped = report.skipped.len(),
        "Project initialized"
    );

    println!("Project initialized!");
    println!();
    println!("Next steps:");
    for (idx, step) in next_steps().iter().enumerate() {
        println!("{}. {step}", idx + 1);
    }
    Ok(())
}

fn validate_cmd(ctx: &CommandContext) -> Result<()> {
    let config = ctx.load_config()?;
    let report = validate_config(&config, &ctx.project);
    let file = ctx.config_label();

    for warning in &report.warnings {
        warn!(file = %file, "{warning}");
    }

    if report.is_ok() {
        info!(file = %file, "Configuration validation passed");
        println!("Configuration is valid");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %file, "{error_msg}");
        }
        Err(anyhow!(
            "Configuration validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn generate_cmd(ctx: &CommandContext, bases: &[BaseImage], template: Option<PathBuf>) -> Result<()> {
    let config = ctx.load_config()?;
    let skeleton = match template {
        Some(path) => ctx.resolve(&path),
        None => ctx.project.skeleton_path(),
    };

    let generated = generate_dockerfiles(&ctx.project, &config, &skeleton, bases, Utc::now())?;
    let with_issues = generated.iter().filter(|g| !g.issues.is_empty()).count();
    for dockerfile in &generated {
        println!("{}", ctx.project.relative(&dockerfile.path).display());
    }
    if with_issues > 0 {
        warn!(
            files = with_issues,
            "Generated Dockerfiles have structural warnings"
        );
    }
    info!(count = generated.len(), "Dockerfile generation complete");
    Ok(())
}

fn build_cmd(
    ctx: &CommandContext,
    options: BuildOptions,
    print_metrics: bool,
    metrics_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
) -> Result<()> {
    let config = ctx.load_validated("build")?;
    let metrics = MetricsCollector::new();

    let report = run_build(&config, &ctx.project, ctx.runner(), &options, &metrics)?;
    for outcome in &report.outcomes {
        info!(
            arch = %outcome.arch,
            image = %outcome.image,
            digest = outcome.digest.as_deref().unwrap_or("-"),
            "Build completed"
        );
    }

    if print_metrics || metrics_json.is_some() || metrics_prometheus.is_some() {
        let snapshot = metrics.snapshot();
        if print_metrics {
            log_snapshot(&snapshot);
        }
        if let Some(path) = metrics_json {
            let path = ctx.resolve(&path);
            ensure_parent(&path, "metrics")?;
            let file = File::create(&path)
                .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
            to_writer_pretty(file, &snapshot)
                .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
            info!(metrics = %path.display(), "Metrics JSON written");
        }
        if let Some(path) = metrics_prometheus {
            let path = ctx.resolve(&path);
            ensure_parent(&path, "metrics")?;
            fs::write(&path, snapshot.to_prometheus()).with_context(|| {
                format!("Failed to write Prometheus metrics: {}", path.display())
            })?;
            info!(metrics = %path.display(), "Prometheus metrics written");
        }
    }

    Ok(())
}

fn target_arch(config: &Config, arch: Option<String>) -> Result<String> {
    match arch {
        Some(arch) => {
            select_architectures(config, std::slice::from_ref(&arch))?;
            Ok(arch)
        }
        None => Ok(config.default_arch().to_string()),
    }
}

fn test_cmd(ctx: &CommandContext, arch: Option<String>) -> Result<()> {
    let config = ctx.load_validated("test")?;
    let arch = target_arch(&config, arch)?;
    let metrics = MetricsCollector::new();

    let report = run_image_tests(&config, &ctx.project, ctx.runner(), &arch, &metrics)?;
    if !(report.structure || report.integration || report.performance.is_some()) {
        warn!("No test suites are enabled in the configuration");
    }
    info!(
        arch = %arch,
        structure = report.structure,
        integration = report.integration,
        "Image tests passed"
    );
    Ok(())
}

fn scan_cmd(ctx: &CommandContext, arch: Option<String>) -> Result<()> {
    let config = ctx.load_validated("scan")?;
    let arch = target_arch(&config, arch)?;
    let metrics = MetricsCollector::new();

    run_scans(&config, &ctx.project, ctx.runner(), &arch, &metrics)?;
    if metrics.snapshot().steps.is_empty() {
        warn!("No security scans are enabled in the configuration");
    }
    info!(arch = %arch, image = %config.image_reference(&arch), "Security scans passed");
    Ok(())
}

fn matrix_cmd(
    ctx: &CommandContext,
    mode: BuildMode,
    images: &[BaseImage],
    max_parallel: usize,
    output: Option<PathBuf>,
    summary: bool,
) -> Result<()> {
    // Only tool selection matters here; a missing config means no tools.
    let config = if ctx.project.config_path().exists() {
        ctx.load_config()?
    } else {
        warn!(file = %ctx.config_label(), "Config file not found, assuming no tools");
        Config::default()
    };

    let (images, matrix) = match plan(mode, images, max_parallel, &config, &ctx.project, ctx.runner())? {
        MatrixPlan::Empty { reason } => {
            println!("{}", serde_json::json!({ "images": [], "reason": reason }));
            return Ok(());
        }
        MatrixPlan::Build { images, matrix } => (images, matrix),
    };

    match output {
        Some(path) => {
            let path = ctx.resolve(&path);
            ensure_parent(&path, "matrix")?;
            let file = File::create(&path)
                .with_context(|| format!("Failed to create matrix file: {}", path.display()))?;
            to_writer_pretty(file, &matrix)
                .with_context(|| format!("Failed to write build matrix: {}", path.display()))?;
            info!(path = %path.display(), "Build matrix written");
        }
        None => println!("{}", serde_json::to_string(&matrix)?),
    }

    if summary {
        let names: Vec<&str> = images.iter().map(|b| b.name()).collect();
        println!("Would build: {}", names.join(", "));
        println!("Matrix: {} jobs", matrix.include.len());
    }
    Ok(())
}

fn lock_cmd(ctx: &CommandContext, output: PathBuf) -> Result<()> {
    let config = ctx.load_validated("generate lockfile")?;
    let lock = compute_lock(&config, &ctx.project, Utc::now())?;
    let path = ctx.resolve(&output);
    write_lock(&lock, &path)?;
    info!(lockfile = %path.display(), "Lockfile generated successfully");
    Ok(())
}

fn ensure_parent(path: &Path, what: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create {what} directory: {}", parent.display())
        })?;
    }
    Ok(())
}

#[derive(Parser)]
#[command(name = "foundry", version, about = TAGLINE)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[arg(long = "otlp-endpoint", global = true)]
    otlp_endpoint: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Args)]
struct GlobalArgs {
    /// Configuration file, relative to the project directory.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE, value_hint = ValueHint::FilePath)]
    config: PathBuf,
    #[arg(short = 'C', long = "project-dir", global = true, value_hint = ValueHint::DirPath)]
    project_dir: Option<PathBuf>,
    /// Print external commands instead of running them.
    #[arg(long, global = true)]
    dry_run: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new project with configuration, template and policies.
    Init {
        #[arg(long, value_enum, default_value_t = Preset::Default)]
        preset: Preset,
        #[arg(long)]
        force: bool,
    },
    /// Check the configuration file.
    Validate,
    /// Render per-base Dockerfiles from the template.
    Generate {
        #[arg(value_enum)]
        bases: Vec<BaseImage>,
        #[arg(long, value_hint = ValueHint::FilePath)]
        template: Option<PathBuf>,
    },
    /// Build images with docker buildx, then SBOM, sign and attest.
    Build {
        #[arg(long)]
        arch: Vec<String>,
        /// Load images into the local daemon instead of pushing.
        #[arg(long)]
        no_push: bool,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long = "metrics-json")]
        metrics_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
    },
    /// Run structure, integration and performance tests.
    Test {
        #[arg(long)]
        arch: Option<String>,
    },
    /// Run vulnerability, compliance and static analysis scans.
    Scan {
        #[arg(long)]
        arch: Option<String>,
    },
    /// Plan a CI build matrix for selective rebuilds.
    Matrix {
        #[arg(long, value_enum, default_value_t = BuildMode::Changed)]
        mode: BuildMode,
        #[arg(long, value_enum, num_args = 1..)]
        images: Vec<BaseImage>,
        #[arg(long, default_value_t = DEFAULT_MAX_PARALLEL)]
        max_parallel: usize,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        summary: bool,
    },
    /// Pin configuration, Dockerfile and build arguments.
    Lock {
        #[arg(long, default_value = DEFAULT_LOCKFILE)]
        output: PathBuf,
    },
    /// Print shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
    /// Print version information.
    Version,
}
