use std::{fs, process::ExitCode};

use anstream::{eprintln, print, println, stream::IsTerminal as _};
use anyhow::{Context as _, Result, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, ValueEnum};
use clap_verbosity_flag::InfoLevel;
use ignore::WalkBuilder;
use indexmap::IndexMap;
use owo_colors::OwoColorize;
use secureflow::{
    config::Config,
    github::{self, GitHubHost, GitHubToken},
    harden::{DEFAULT_WRAPPER_ACTION, is_valid_wrapper},
    knowledge_base::{DirectoryKnowledgeBase, InMemoryKnowledgeBase, KnowledgeBase},
    maintained::load_maintained_actions_file,
    missing::LoggingSink,
    oci_registry::OciRegistry,
    pin::Exemptions,
    pipeline::{Collaborators, PipelineError, PipelineOptions, secure_workflow},
    remote::{Registry, SourceControl},
    report::{WorkflowReport, render_plain},
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};

/// Hardens GitHub Actions workflows: least-privilege permissions, pinned
/// actions and images, and runtime monitoring.
#[derive(Parser)]
#[command(about, version)]
struct App {
    /// Don't infer and insert `permissions:` blocks.
    #[arg(long)]
    no_permissions: bool,

    /// Don't pin actions and images.
    #[arg(long)]
    no_pin: bool,

    /// Don't inject the harden-runner step.
    #[arg(long)]
    no_harden_runner: bool,

    /// Rewrite inputs in place instead of printing the result.
    #[arg(short, long)]
    write: bool,

    /// Perform only offline operations.
    ///
    /// Pinning and maintained-action substitution need the network and
    /// are skipped.
    #[arg(short, long, env = "SECUREFLOW_OFFLINE")]
    offline: bool,

    /// The GitHub API token to use.
    #[arg(long, env = "GH_TOKEN", value_parser = GitHubToken::new)]
    gh_token: Option<GitHubToken>,

    /// The GitHub Server Hostname. Defaults to github.com
    #[arg(long, env = "GH_HOST", default_value = "github.com", value_parser = GitHubHost::new)]
    gh_hostname: GitHubHost,

    /// Pin to immutable release versions where available, instead of commits.
    #[arg(long)]
    pin_to_immutable: bool,

    /// An action (glob) that is never pinned. May be repeated.
    #[arg(long = "exempt", value_name = "PATTERN")]
    exempt_actions: Vec<String>,

    /// The monitoring action to inject.
    #[arg(long, value_name = "REFERENCE")]
    harden_runner: Option<String>,

    /// Don't inject the monitoring step into jobs that run in a container.
    #[arg(long)]
    skip_container_jobs: bool,

    /// A directory of `action-security.yml` knowledge base entries.
    #[arg(long, value_name = "DIR")]
    knowledge_base: Option<Utf8PathBuf>,

    /// A JSON list of maintained replacements for unmaintained actions.
    #[arg(long, value_name = "FILE")]
    maintained_actions_file: Option<Utf8PathBuf>,

    #[command(flatten)]
    verbose: clap_verbosity_flag::Verbosity<InfoLevel>,

    /// The output format to emit. By default, a human-readable summary
    /// is written to stderr.
    #[arg(long, value_enum, default_value_t)]
    format: OutputFormat,

    /// Control the use of color in output.
    #[arg(long, value_enum, value_name = "MODE")]
    color: Option<ColorMode>,

    /// The configuration file to load. By default, any config will be
    /// discovered relative to $CWD.
    #[arg(short, long, env = "SECUREFLOW_CONFIG", group = "conf")]
    config: Option<Utf8PathBuf>,

    /// Disable all configuration loading.
    #[arg(long, group = "conf")]
    no_config: bool,

    /// The workflow files or directories to harden.
    #[arg(required = true)]
    inputs: Vec<Utf8PathBuf>,
}

#[derive(Debug, Default, Copy, Clone, ValueEnum)]
enum OutputFormat {
    /// A colored summary per workflow on stderr.
    #[default]
    Plain,
    /// Every report as JSON on stdout.
    Json,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
enum ColorMode {
    /// Use color output if the output supports it.
    Auto,
    /// Force color output, even if the output isn't a terminal.
    Always,
    /// Disable color output, even if the output is a compatible terminal.
    Never,
}

impl From<ColorMode> for anstream::ColorChoice {
    fn from(value: ColorMode) -> Self {
        match value {
            ColorMode::Auto => Self::Auto,
            ColorMode::Always => Self::Always,
            ColorMode::Never => Self::Never,
        }
    }
}

impl App {
    fn load_config(&self) -> Result<Config> {
        if self.no_config {
            tracing::debug!("skipping config discovery: explicitly disabled");
            return Ok(Config::default());
        }

        match &self.config {
            Some(path) => Ok(Config::global(path)?),
            None => {
                let cwd = Utf8PathBuf::try_from(std::env::current_dir()?)?;
                Ok(Config::discover(&cwd)?.unwrap_or_default())
            }
        }
    }

    /// Merges the config file under the command line.
    fn pipeline_options(&self, config: &Config) -> Result<PipelineOptions> {
        let harden_runner = self
            .harden_runner
            .clone()
            .or_else(|| config.harden_runner.clone())
            .unwrap_or_else(|| DEFAULT_WRAPPER_ACTION.into());
        if !is_valid_wrapper(&harden_runner) {
            return Err(anyhow!("invalid harden-runner reference: {harden_runner}"));
        }

        let mut maintained_actions = match self
            .maintained_actions_file
            .as_ref()
            .or(config.maintained_actions_file.as_ref())
        {
            Some(path) => load_maintained_actions_file(path)?,
            None => Default::default(),
        };
        maintained_actions.extend(config.maintained_actions.clone());

        let exemptions: Vec<_> = config
            .exempt_actions
            .iter()
            .chain(&self.exempt_actions)
            .collect();

        Ok(PipelineOptions {
            add_permissions: !self.no_permissions,
            pin_actions: !self.no_pin,
            add_harden_runner: !self.no_harden_runner,
            add_empty_top_level_permissions: config.add_empty_top_level_permissions,
            add_project_comment: config.add_project_comment,
            ignore_missing_kbs: config.ignore_missing_kbs,
            exemptions: Exemptions::new(&exemptions),
            pin_to_immutable: self.pin_to_immutable || config.pin_to_immutable,
            harden_runner,
            skip_container_jobs: self.skip_container_jobs || config.skip_container_jobs,
            maintained_actions,
        })
    }
}

/// Expands directories into the workflow files beneath them.
fn collect_inputs(inputs: &[Utf8PathBuf]) -> Result<Vec<Utf8PathBuf>> {
    let mut collected = vec![];

    for input in inputs {
        if input.is_file() {
            collected.push(input.clone());
            continue;
        }
        if !input.is_dir() {
            return Err(anyhow!("{input} is neither a file nor a directory"));
        }

        // A repository root means its workflows, not every YAML file in it.
        let workflows = input.join(".github/workflows");
        let root = match workflows.is_dir() {
            true => workflows,
            false => input.clone(),
        };

        let mut walker = WalkBuilder::new(&root);
        walker
            .standard_filters(false)
            .require_git(false)
            .git_ignore(true)
            .git_exclude(true);

        for entry in walker.build() {
            let entry = entry?;
            let path = <&Utf8Path>::try_from(entry.path())?;
            if path.is_file() && matches!(path.extension(), Some("yml" | "yaml")) {
                collected.push(path.to_path_buf());
            }
        }
    }

    if collected.is_empty() {
        return Err(anyhow!("no workflow files found"));
    }

    Ok(collected)
}

async fn run(app: App) -> Result<ExitCode> {
    let config = app
        .load_config()
        .context("failed to load config")?;
    let options = app.pipeline_options(&config)?;
    let inputs = collect_inputs(&app.inputs)?;

    let knowledge_base: Box<dyn KnowledgeBase> =
        match app.knowledge_base.as_ref().or(config.knowledge_base.as_ref()) {
            Some(root) => Box::new(DirectoryKnowledgeBase::new(root.clone())),
            None => {
                tracing::warn!("no knowledge base configured; every action will be reported missing");
                Box::new(InMemoryKnowledgeBase::new())
            }
        };

    let (client, registry) = match app.offline {
        true => (None, None),
        false => (
            Some(github::Client::new(&app.gh_hostname, app.gh_token.as_ref())?),
            Some(OciRegistry::new()),
        ),
    };

    let collaborators = Collaborators {
        knowledge_base: knowledge_base.as_ref(),
        missing: &LoggingSink,
        source_control: client.as_ref().map(|c| c as &dyn SourceControl),
        registry: registry.as_ref().map(|r| r as &dyn Registry),
    };

    let mut reports = IndexMap::new();
    let mut malformed = false;

    for input in &inputs {
        let text = fs::read_to_string(input).with_context(|| format!("couldn't read {input}"))?;

        let report = match secure_workflow(&text, &options, collaborators).await {
            Ok(report) => report,
            Err(PipelineError::MalformedDocument(e)) => {
                tracing::warn!("{input}: {e}");
                malformed = true;
                WorkflowReport::malformed(&text)
            }
        };

        if app.write {
            if report.changed() {
                fs::write(input, &report.final_output)
                    .with_context(|| format!("couldn't write {input}"))?;
            }
        } else if matches!(app.format, OutputFormat::Plain) && !report.incorrect_yaml {
            print!("{}", report.final_output);
        }

        if matches!(app.format, OutputFormat::Plain) {
            render_plain(input.as_str(), &report);
        }
        reports.insert(input.to_string(), report);
    }

    if matches!(app.format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }

    Ok(match malformed {
        true => ExitCode::from(2),
        false => ExitCode::SUCCESS,
    })
}

fn main() -> ExitCode {
    human_panic::setup_panic!();

    let app = App::parse();

    let color_mode = match app.color {
        Some(color_mode) => color_mode,
        None if std::env::var("NO_COLOR").is_ok() => ColorMode::Never,
        None if std::env::var("FORCE_COLOR").is_ok() => ColorMode::Always,
        None => ColorMode::Auto,
    };
    anstream::ColorChoice::write_global(color_mode.into());

    let filter = EnvFilter::builder()
        .with_default_directive(app.verbose.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_ansi(std::io::stderr().is_terminal() && !matches!(color_mode, ColorMode::Never))
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("couldn't start the async runtime")
        .and_then(|runtime| runtime.block_on(run(app)));

    // Returning an ExitCode rather than exiting lets destructors run.
    match result {
        Ok(exit) => exit,
        Err(err) => {
            eprintln!("{fatal}: {err:#}", fatal = "fatal".red().bold());
            ExitCode::FAILURE
        }
    }
}
