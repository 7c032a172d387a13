mod config;
mod logging;
mod run_cmd;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use flowprobe_core::harness::is_executable;

use config::{CliOverrides, ProbeConfig};
use logging::LogLevel;
use run_cmd::{NodeArgs, RunArgs};

#[derive(Parser)]
#[command(name = "flowprobe", about = "Drive a flow engine over framed stdio and print its output")]
struct Cli {
    /// Log filter level (overrides RUST_LOG)
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,

    /// Engine executable (overrides FLOWPROBE_ENGINE)
    #[arg(long, global = true)]
    engine: Option<PathBuf>,

    /// Cargo workspace the engine is built in (overrides FLOWPROBE_BUILD_ROOT)
    #[arg(long, global = true)]
    build_root: Option<PathBuf>,

    /// Engine home directory (overrides EDGELINK_HOME)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Per-read timeout in seconds
    #[arg(long, global = true)]
    read_timeout: Option<u64>,

    /// Overall deadline in seconds
    #[arg(long, global = true)]
    deadline: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a flowprobe config file
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run a flows file and print the first N events
    Run {
        /// Flow definition (JSON array)
        flows: PathBuf,
        /// JSON array of messages (or {"nid","msg"} envelopes) to inject
        #[arg(long)]
        injections: Option<PathBuf>,
        /// Target node for messages that are not envelopes
        #[arg(long, default_value = "1")]
        node: String,
        /// Number of events to wait for
        #[arg(long)]
        expect: usize,
        /// Let the engine load the flows file itself (no injections)
        #[arg(long)]
        from_file: bool,
        /// Exit with code 2 if the engine stops before `--expect` events
        #[arg(long)]
        strict: bool,
        /// JSON object written to the engine's edgelinkd.toml
        #[arg(long)]
        runtime_config: Option<PathBuf>,
    },
    /// Run a single node between an injector and a console-json sink
    Node {
        /// Node definition (JSON object)
        node: PathBuf,
        /// JSON array of messages to inject into the node
        #[arg(long)]
        msgs: Option<PathBuf>,
        /// Number of events to wait for
        #[arg(long)]
        expect: usize,
        /// Exit with code 2 if the engine stops before `--expect` events
        #[arg(long)]
        strict: bool,
        /// JSON object written to the engine's edgelinkd.toml
        #[arg(long)]
        runtime_config: Option<PathBuf>,
    },
    /// Print the resolved configuration
    Config,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            engine: self.engine.clone(),
            build_root: self.build_root.clone(),
            home: self.home.clone(),
            read_timeout_secs: self.read_timeout,
            deadline_secs: self.deadline,
        }
    }
}

/// Execute the `flowprobe init` command: write config file.
fn cmd_init(cli_engine: Option<PathBuf>, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        engine: config::EngineSection {
            binary: cli_engine,
            ..config::EngineSection::default()
        },
        timeouts: config::TimeoutsSection {
            read_secs: Some(flowprobe_core::RunnerConfig::DEFAULT_READ_TIMEOUT.as_secs()),
            deadline_secs: Some(flowprobe_core::RunnerConfig::DEFAULT_DEADLINE.as_secs()),
            grace_secs: Some(flowprobe_core::RunnerConfig::DEFAULT_GRACE.as_secs()),
        },
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    match &cfg.engine.binary {
        Some(engine) => println!("  engine.binary = {}", engine.display()),
        None => println!("  engine.binary unset; the engine is looked up in the build tree"),
    }
    Ok(())
}

/// Execute the `flowprobe config` command: print resolved settings.
fn cmd_config(resolved: &ProbeConfig) {
    let found = if is_executable(&resolved.engine) {
        ""
    } else {
        " (not found)"
    };
    println!("config file: {}", config::config_path().display());
    println!(
        "engine:       {}{found} [from {}]",
        resolved.engine.display(),
        resolved.engine_source
    );
    match &resolved.home {
        Some(home) => println!("home:         {}", home.display()),
        None => println!("home:         (engine default)"),
    }
    println!("verbosity:    {}", resolved.verbosity);
    println!("read timeout: {:?}", resolved.runner.read_timeout);
    println!("deadline:     {:?}", resolved.runner.deadline);
    println!("grace:        {:?}", resolved.runner.grace);
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let overrides = cli.overrides();

    match cli.command {
        Commands::Init { force } => {
            cmd_init(overrides.engine, force)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config => {
            let resolved = ProbeConfig::resolve(&overrides)?;
            cmd_config(&resolved);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run {
            flows,
            injections,
            node,
            expect,
            from_file,
            strict,
            runtime_config,
        } => {
            let resolved = ProbeConfig::resolve(&overrides)?;
            let args = RunArgs {
                flows,
                injections,
                node,
                expect,
                from_file,
                strict,
                runtime_config,
            };
            run_cmd::run_flows(&resolved, &args).await
        }
        Commands::Node {
            node,
            msgs,
            expect,
            strict,
            runtime_config,
        } => {
            let resolved = ProbeConfig::resolve(&overrides)?;
            let args = NodeArgs {
                node,
                msgs,
                expect,
                strict,
                runtime_config,
            };
            run_cmd::run_node(&resolved, &args).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_logging(cli.log_level);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
