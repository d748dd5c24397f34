mod chunk;
mod config;
mod input;
mod markers;
mod monitor;
mod orchestrator;
mod report;
mod retry;
mod signals;
mod transcript;
mod transport;
mod vm;
mod watchdog;

use clap::Parser;
use config::HarnessConfig;
use orchestrator::{OrchestratorSettings, StageOrchestrator};
use report::RunOutcome;
use signals::Shutdown;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use vm::vboxmanage::VBoxManage;

/// Exit status for configuration problems found before any VM work.
const EXIT_CONFIG: u8 = 5;

/// Unattended boot regression testing: boot an OS image in a VirtualBox VM
/// stage by stage, watch its debug console, and report whether every stage
/// reached its checkpoint.
#[derive(Parser, Debug)]
#[command(name = "sysreg", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "sysreg.toml")]
    config: PathBuf,

    /// Boot attempts per stage (overrides config)
    #[arg(long)]
    retries: Option<u32>,

    /// Inactivity timeout per attempt in seconds (overrides config)
    #[arg(long)]
    timeout: Option<u64>,

    /// Identical lines tolerated before an attempt counts as stuck (overrides config)
    #[arg(long)]
    duplicate_limit: Option<u32>,

    /// Transcript file (overrides config)
    #[arg(long, conflicts_with = "no_transcript")]
    transcript: Option<PathBuf>,

    /// Do not write a transcript
    #[arg(long)]
    no_transcript: bool,

    /// VM name (overrides config)
    #[arg(long)]
    vm_name: Option<String>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (watchdog, injected input, VBoxManage commands)
    #[arg(short, long)]
    verbose: bool,

    /// Don't echo guest output, only progress and summary
    #[arg(short, long)]
    quiet: bool,

    /// Print the run report as JSON instead of the summary
    #[arg(long)]
    json: bool,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded config.
    fn apply(&self, config: &mut HarnessConfig) {
        if let Some(retries) = self.retries {
            config.retry.max_retries = retries;
        }
        if let Some(timeout) = self.timeout {
            config.monitor.timeout_secs = timeout;
        }
        if let Some(limit) = self.duplicate_limit {
            config.monitor.duplicate_line_limit = limit;
        }
        if let Some(path) = &self.transcript {
            config.transcript.enabled = true;
            config.transcript.path = path.clone();
        }
        if self.no_transcript {
            config.transcript.enabled = false;
        }
        if let Some(name) = &self.vm_name {
            config.vm.name = name.clone();
        }
        if self.quiet {
            config.monitor.echo = false;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let mut config = match HarnessConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "could not load config");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    cli.apply(&mut config);
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "config rejected");
        return ExitCode::from(EXIT_CONFIG);
    }

    if cli.dry_run {
        match toml::to_string_pretty(&config) {
            Ok(text) => {
                println!("# resolved from {}", cli.config.display());
                print!("{text}");
                return ExitCode::SUCCESS;
            }
            Err(e) => {
                tracing::error!(error = %e, "could not render config");
                return ExitCode::from(EXIT_CONFIG);
            }
        }
    }

    if let Some(path) = config.transcript_path() {
        tracing::info!(path = %path.display(), "serial log path");
    }

    let backend = VBoxManage::new(&config.vm);
    let settings = OrchestratorSettings::from_config(&config);

    let report = match orchestrator::provision(&backend, &config.vm.name, &settings.endpoint).await
    {
        Ok(handle) => {
            StageOrchestrator::new(&backend, handle, settings, Shutdown::install())
                .run_all()
                .await
        }
        Err(e) => {
            tracing::error!(error = %e, vm = %config.vm.name, "could not prepare the VM");
            let mut report = report::RunReport::new();
            report.finish(RunOutcome::VmFailure {
                stage: None,
                error: e.to_string(),
            });
            report
        }
    };

    if cli.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => tracing::error!(error = %e, "could not render report"),
        }
    } else {
        print!("{}", report.summary());
    }

    ExitCode::from(report.exit_code())
}
