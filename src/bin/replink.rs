//! replink - drive the dev-runtime REPL inside a running Spring Boot JVM
//!
//! # Usage
//!
//! ```bash
//! # Rank local JVMs that look like Spring Boot applications
//! replink candidates
//!
//! # Inject the agent into the best candidate (or a given pid)
//! replink attach
//! replink attach --pid 4242
//!
//! # Evaluate, hot-swap, inspect the application context
//! replink eval 'return orderService.count();'
//! replink hot-swap src/main/java/com/acme/OrderService.java
//! replink bind
//! replink beans
//!
//! # Snapshots
//! replink snapshot save recent 'repo.findTop10()'
//! replink snapshot list
//!
//! # Enable debug logging
//! RUST_LOG=replink_client=debug replink eval '1 + 1'
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::sleep;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use replink_attach::{AgentLookup, AttachOptions, AttachOutcome};
use replink_client::{ClientConfig, SessionManager};

/// How long to wait for the clone handshake before giving up.
const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 5;

/// Connect attempts after an injection while the agent's server starts.
const POST_ATTACH_CONNECT_ATTEMPTS: u32 = 20;

const POST_ATTACH_CONNECT_DELAY: Duration = Duration::from_millis(250);

// ============================================================================
// CLI Arguments
// ============================================================================

/// replink - attach to a running JVM and talk to its dev-runtime REPL
#[derive(Parser, Debug)]
#[command(name = "replink", version, about)]
struct Args {
    /// REPL host (overrides config and REPLINK_HOST)
    #[arg(long, global = true)]
    host: Option<String>,

    /// REPL port (overrides config and REPLINK_PORT)
    #[arg(long, short = 'p', global = true)]
    port: Option<u16>,

    /// Seconds to wait for the session handshake
    #[arg(long, global = true, default_value_t = DEFAULT_SESSION_TIMEOUT_SECS)]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List JVMs ranked by how likely they run Spring Boot
    Candidates {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Inject the dev-runtime agent
    Attach {
        /// Attach to this pid instead of the best-ranked candidate
        #[arg(long)]
        pid: Option<u32>,

        /// Preferred agent port (falls back to an ephemeral port when busy)
        #[arg(long)]
        agent_port: Option<u16>,

        /// Agent JAR to load
        #[arg(long)]
        agent_jar: Option<PathBuf>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Evaluate code with the server's preferred evaluation op
    Eval {
        /// Code to evaluate ("-" reads stdin)
        code: String,
    },
    /// Evaluate code with the one-shot java-eval op
    JavaEval {
        /// Code to evaluate ("-" reads stdin)
        code: String,
    },
    /// Recompile and redefine a class from its source file
    HotSwap {
        /// Java source file ("-" reads stdin)
        file: PathBuf,
    },
    /// Bind the Spring application context
    Bind {
        /// Expression producing the context
        #[arg(long)]
        expr: Option<String>,
    },
    /// List beans in the bound application context
    Beans,
    /// Snapshot operations
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
    /// Drop every binding held by the remote session
    Reset,
    /// Print every frame the server sends until interrupted
    Watch,
}

#[derive(Subcommand, Debug)]
enum SnapshotCommand {
    /// Snapshot names
    List,
    /// Legacy snapshot summary
    Summary,
    /// Store the result of an expression
    Save { name: String, expr: String },
    /// Store the result of an expression as JSON
    SaveJson { name: String, expr: String },
    /// Pin an expression under a name
    Pin { name: String, expr: String },
    /// Load a snapshot into the session
    Load {
        name: String,
        /// Variable to bind the snapshot to
        #[arg(long)]
        var: Option<String>,
    },
    /// Rebuild a typed object from a JSON snapshot
    Materialize {
        name: String,
        /// Fully qualified type name
        type_name: String,
        /// Variable to bind the result to
        #[arg(long)]
        target: Option<String>,
    },
    /// Describe a snapshot
    Info { name: String },
    /// Delete a snapshot
    Delete { name: String },
}

// ============================================================================
// Helpers
// ============================================================================

fn read_input(arg: &str) -> Result<String> {
    if arg == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read stdin")?;
        Ok(buf)
    } else {
        Ok(arg.to_string())
    }
}

fn print_value(value: Option<String>) {
    if let Some(value) = value {
        println!("{value}");
    }
}

fn load_config(args: &Args) -> Result<ClientConfig> {
    let mut config = ClientConfig::load().context("Failed to load configuration")?;
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    Ok(config)
}

/// Connects and waits for the session token.
async fn connect(config: &ClientConfig, timeout: Duration) -> Result<SessionManager> {
    let manager = SessionManager::from_config(config);
    manager
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", config.address()))?;

    match manager.wait_for_session(timeout).await? {
        Some(session) => debug!(session = %session, "Session ready"),
        None => bail!("No session established within {timeout:?}"),
    }
    Ok(manager)
}

/// Retries the connect while the freshly injected agent starts its server.
async fn verify_agent(config: &ClientConfig, timeout: Duration) -> Result<()> {
    for attempt in 1..=POST_ATTACH_CONNECT_ATTEMPTS {
        match connect(config, timeout).await {
            Ok(manager) => {
                info!(address = %config.address(), "Agent REPL reachable");
                manager.disconnect().await;
                return Ok(());
            }
            Err(e) => {
                debug!(attempt, error = %e, "Agent REPL not reachable yet");
                sleep(POST_ATTACH_CONNECT_DELAY).await;
            }
        }
    }
    bail!("Agent REPL at {} did not come up", config.address())
}

// ============================================================================
// Commands
// ============================================================================

async fn run_candidates(json: bool) -> Result<()> {
    let candidates = replink_attach::list_candidates().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&candidates)?);
        return Ok(());
    }
    if candidates.is_empty() {
        println!("No candidate Spring Boot JVM found");
        return Ok(());
    }
    println!("{:>8}  {:>5}  COMMAND", "PID", "SCORE");
    for candidate in candidates {
        println!(
            "{:>8}  {:>5}  {}",
            candidate.descriptor.pid, candidate.score, candidate.descriptor.display_name
        );
    }
    Ok(())
}

async fn run_attach(
    mut config: ClientConfig,
    pid: Option<u32>,
    agent_port: Option<u16>,
    agent_jar: Option<PathBuf>,
    json: bool,
    timeout: Duration,
) -> Result<()> {
    let mut agent =
        AgentLookup::default().with_explicit(agent_jar.or_else(|| config.agent_jar_path.clone()));
    if let Some(version) = &config.agent_maven_version {
        agent = agent.with_version(version.clone());
    }
    let options = AttachOptions {
        preferred_port: agent_port.unwrap_or(config.agent_port),
        agent,
    };

    let outcome: AttachOutcome = match pid {
        Some(pid) => replink_attach::attach_pid(pid, options).await,
        None => replink_attach::auto_attach(options).await,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", outcome.summary());
    }
    if !outcome.attached {
        bail!(
            "{}",
            outcome.message.as_deref().unwrap_or("attach failed")
        );
    }

    // the agent serves on the port it was given, on this machine
    if let Some(port) = outcome.port {
        config.host = replink_client::config::DEFAULT_HOST.to_string();
        config.port = port;
    }
    if config.auto_connect {
        verify_agent(&config, timeout).await?;
    }
    Ok(())
}

async fn run_session(config: ClientConfig, command: Command, timeout: Duration) -> Result<()> {
    let manager = connect(&config, timeout).await?;

    match command {
        Command::Eval { code } => print_value(manager.eval(&read_input(&code)?).await?),
        Command::JavaEval { code } => print_value(manager.java_eval(&read_input(&code)?).await?),
        Command::HotSwap { file } => {
            let source = if file.as_os_str() == "-" {
                read_input("-")?
            } else {
                fs::read_to_string(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?
            };
            println!("{}", manager.hot_swap(&source).await?);
        }
        Command::Bind { expr } => {
            print_value(manager.bind_context(expr.as_deref()).await?);
            if !manager.is_context_bound() {
                bail!("Application context not bound");
            }
        }
        Command::Beans => {
            for bean in manager.list_beans().await? {
                println!("{}\t{}", bean.name, bean.class_name);
            }
        }
        Command::Snapshot(snapshot) => run_snapshot(&manager, snapshot).await?,
        Command::Reset => print_value(manager.reset_session().await?),
        Command::Watch => {
            let mut frames = manager.subscribe();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    frame = frames.recv() => match frame {
                        Some(frame) => println!("{}", serde_json::to_string(&frame.iter().collect::<BTreeMap<_, _>>())?),
                        None => break,
                    },
                }
                if !manager.is_connected() {
                    break;
                }
            }
        }
        Command::Candidates { .. } | Command::Attach { .. } => {}
    }

    manager.disconnect().await;
    Ok(())
}

async fn run_snapshot(manager: &SessionManager, command: SnapshotCommand) -> Result<()> {
    match command {
        SnapshotCommand::List => {
            for line in manager.snapshot_list().await? {
                println!("{line}");
            }
        }
        SnapshotCommand::Summary => print_value(manager.snapshots().await?),
        SnapshotCommand::Save { name, expr } => {
            print_value(manager.snapshot_save(&name, &expr).await?)
        }
        SnapshotCommand::SaveJson { name, expr } => {
            print_value(manager.snapshot_save_json(&name, &expr).await?)
        }
        SnapshotCommand::Pin { name, expr } => {
            print_value(manager.snapshot_pin(&name, &expr).await?)
        }
        SnapshotCommand::Load { name, var } => {
            print_value(manager.snapshot_load(&name, var.as_deref()).await?)
        }
        SnapshotCommand::Materialize {
            name,
            type_name,
            target,
        } => print_value(
            manager
                .snapshot_materialize(&name, &type_name, target.as_deref())
                .await?,
        ),
        SnapshotCommand::Info { name } => print_value(manager.snapshot_info(&name).await?),
        SnapshotCommand::Delete { name } => print_value(manager.snapshot_delete(&name).await?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("replink=info".parse()?)
                .add_directive("replink_client=warn".parse()?)
                .add_directive("replink_attach=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let timeout = Duration::from_secs(args.timeout);

    match args.command {
        Command::Candidates { json } => run_candidates(json).await,
        Command::Attach {
            pid,
            agent_port,
            agent_jar,
            json,
        } => run_attach(config, pid, agent_port, agent_jar, json, timeout).await,
        command => run_session(config, command, timeout).await,
    }
}
