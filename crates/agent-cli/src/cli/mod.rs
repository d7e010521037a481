mod run;

use std::process::ExitCode;

use clap::{
    ArgAction,
    Parser,
    Subcommand,
};
use eyre::{
    Context,
    Result,
};
use run::RunArgs;
use tracing_appender::non_blocking::{
    NonBlocking,
    WorkerGuard,
};
use tracing_appender::rolling::{
    RollingFileAppender,
    Rotation,
};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{
    EnvFilter,
    Registry,
};

#[derive(Debug, Clone, Parser)]
pub struct CliArgs {
    #[command(subcommand)]
    pub subcommand: Option<RootSubcommand>,
    /// Increase logging verbosity
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

impl CliArgs {
    pub async fn execute(self) -> Result<ExitCode> {
        let _guard = Self::setup_logging().context("failed to initialize logging")?;

        let subcommand = self.subcommand.unwrap_or_default();

        subcommand.execute().await
    }

    fn setup_logging() -> Result<WorkerGuard> {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agent_cli=info,agent_core=info"));
        let (non_blocking, file_guard) = NonBlocking::new(RollingFileAppender::new(Rotation::NEVER, ".", "agent-cli.log"));
        let file_layer = tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false);

        Registry::default().with(env_filter).with(file_layer).init();

        Ok(file_guard)
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum RootSubcommand {
    /// Run a single prompt against a demo agent
    Run(RunArgs),
}

impl RootSubcommand {
    pub async fn execute(self) -> Result<ExitCode> {
        match self {
            RootSubcommand::Run(run_args) => run_args.execute().await,
        }
    }
}

impl Default for RootSubcommand {
    fn default() -> Self {
        Self::Run(Default::default())
    }
}
