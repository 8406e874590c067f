use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use mailprint::config::{default_config_dir, load_or_init};
use mailprint::context::{self, AppContext};
use mailprint::error::{ConfigError, MailprintError, Result};
use mailprint::print::LpPrinter;
use mailprint::provider::{ContextProviderFactory, ProviderKind};
use mailprint::scheduler::{PollScheduler, SchedulerSettings, SystemClock};

/// Prints attachments from allowed senders as they arrive.
#[derive(Parser, Debug)]
#[command(name = "mailprint", version, about)]
struct Cli {
    /// Directory holding config.json, state.json and stored tokens.
    #[arg(long, env = "MAILPRINT_CONFIG_DIR", global = true)]
    config_dir: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Poll and print until interrupted (the default).
    Run,
    /// Sign in again and store a fresh token.
    Auth,
    /// Delete the state file and stored tokens.
    Reset,
    /// Write a default config.json if there is none.
    InitConfig,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_log::LogTracer::init()?;

    let filter = if verbose {
        EnvFilter::new("info,mailprint=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => default_config_dir()?,
    };
    let command = cli.command.unwrap_or(Command::Run);

    match command {
        Command::InitConfig => return init_config(&config_dir),
        Command::Reset => {
            context::reset(&config_dir)?;
            println!("Removed state and stored tokens from {}", config_dir.display());
            return Ok(());
        }
        Command::Run | Command::Auth => {}
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        if shutdown_tx.send_replace(true) {
            std::process::exit(130);
        }
        eprintln!("Interrupted, finishing the current cycle (press Ctrl-C again to quit now)");
    }) {
        warn!("Could not install the Ctrl-C handler: {}", e);
    }

    let ctx = Arc::new(AppContext::open(&config_dir, shutdown_rx)?);
    let kind = ctx.provider_kind()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(MailprintError::Runtime)?;

    let result = runtime.block_on(execute(command, kind, ctx));

    // A console read blocked on stdin would otherwise keep the runtime alive.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn execute(command: Command, kind: ProviderKind, ctx: Arc<AppContext>) -> Result<()> {
    if command == Command::Auth {
        if kind.reauthorize(&ctx).await? {
            println!("Signed in; token stored for {}", kind);
        } else {
            println!("The {} provider uses a password, nothing to authorize", kind);
        }
        return Ok(());
    }

    info!(
        "Starting mailprint v{} with the {} provider",
        env!("CARGO_PKG_VERSION"),
        kind
    );
    let factory = ContextProviderFactory::new(Arc::clone(&ctx), kind);
    let sink = LpPrinter::new(ctx.print_options());
    let mut scheduler = PollScheduler::new(
        Box::new(factory),
        Box::new(sink),
        &ctx.state,
        Arc::new(SystemClock),
        SchedulerSettings::from_config(&ctx.config),
    );
    scheduler.run(ctx.shutdown.clone()).await
}

fn init_config(config_dir: &std::path::Path) -> Result<()> {
    match load_or_init(config_dir) {
        Err(ConfigError::NotInitialized(path)) => {
            println!("Wrote a default config to {}", path.display());
            Ok(())
        }
        Ok(_) => {
            println!("A config already exists in {}", config_dir.display());
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
