//! Demo host binary: an embedding program serving a few worker types.
//!
//! Invoked with the worker marker flag this process becomes the worker a
//! launcher document describes; any other invocation is a small CLI that
//! provisions those same workers out of process. The integration tests use
//! this binary as their runner executable.

use std::path::PathBuf;

use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ganger_wire::WireError;

use ganger::{
    BootstrapProfile, EventedWorkerImpl, Message, MessageChannel, PeerHandle, RawWorkerImpl,
    Result, SharedWorkerImpl, WorkerCounter, WorkerFactory, WorkerRegistry, WorkerStatus,
};

/// Demo host for out-of-process workers.
#[derive(Parser)]
#[command(name = "ganger-host", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Round-trip messages through a dedicated echo worker
    Echo {
        /// Messages to send; defaults to a single ping
        text: Vec<String>,
    },
    /// Start a shared tally worker and leave it running
    Start {
        #[command(flatten)]
        target: Target,
        /// Kill-switch file the worker consults before binding
        #[arg(long)]
        kill_switch: Option<PathBuf>,
    },
    /// Stop a running shared worker
    Stop {
        #[command(flatten)]
        target: Target,
    },
    /// Print a running shared worker's status
    Query {
        #[command(flatten)]
        target: Target,
    },
}

#[derive(Args)]
struct Target {
    /// Worker socket address, e.g. unix:///tmp/tally.sock or tcp://127.0.0.1:7700
    #[arg(long)]
    address: String,
    /// Admin cookie; stop and query refuse to run without one
    #[arg(long)]
    cookie: Option<String>,
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let mut registry = build_registry();
    if ganger::bootstrap::run_worker_from_args(&mut registry)? {
        return Ok(());
    }

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_command(cli.command))
}

/// In dedicated mode stdout is the message channel, so logs go to stderr.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_registry() -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    registry.register_raw("Echo", |_args| Ok(Echo));
    registry.register_evented("Double", |_args| Ok(Double));
    registry.register_module("tally", |registry| {
        registry.register_shared("Tally", |_args| Ok(Tally::default()));
    });
    registry
}

async fn run_command(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Echo { text } => {
            let factory = WorkerFactory::default();
            let mut worker = factory.create_worker("Echo").await?;
            let texts = if text.is_empty() {
                vec!["ping".to_owned()]
            } else {
                text
            };
            for text in texts {
                worker.send_message(Message::data(json!(text))).await?;
                let reply = worker.receive_message().await?;
                match reply.payload() {
                    Some(Value::String(text)) => println!("{text}"),
                    Some(other) => println!("{other}"),
                    None => println!("(no payload)"),
                }
            }
            let status = worker.join().await?;
            info!(%status, "echo worker finished");
        }
        Command::Start {
            target,
            kill_switch,
        } => {
            let factory = tally_factory(&target, kill_switch);
            factory
                .start_shared_worker(target.address.as_str(), "Tally")
                .await?;
            println!("started a tally worker at {}", target.address);
        }
        Command::Stop { target } => {
            let factory = tally_factory(&target, None);
            if factory.stop_shared_worker(target.address.as_str()).await? {
                println!("stop request delivered to {}", target.address);
            } else {
                println!("no worker listening at {}", target.address);
            }
        }
        Command::Query { target } => {
            let factory = tally_factory(&target, None);
            let status = factory.query_shared_worker(target.address.as_str()).await?;
            if let Some(text) = &status.text_status {
                println!("{text}");
            }
            for counter in &status.counters {
                let name = counter.name.as_deref().unwrap_or("(unnamed)");
                let value = counter.value.unwrap_or(f64::NAN);
                match counter.unit.as_deref() {
                    Some(unit) => println!("  {name} = {value} {unit}"),
                    None => println!("  {name} = {value}"),
                }
            }
        }
    }
    Ok(())
}

fn tally_factory(target: &Target, kill_switch: Option<PathBuf>) -> WorkerFactory {
    let mut profile = BootstrapProfile::new();
    profile
        .add_module("tally")
        .set_admin_cookie(target.cookie.clone())
        .set_kill_switch_path(kill_switch);
    WorkerFactory::new(profile)
}

/// Hands every message straight back until the master hangs up.
struct Echo;

#[async_trait(?Send)]
impl RawWorkerImpl for Echo {
    async fn run(&mut self, mut channel: MessageChannel) -> Result<()> {
        loop {
            match channel.recv().await {
                Ok(message) => channel.send(message).await?,
                Err(WireError::Closed) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Replies to `{"n": x}` with `{"n": 2x}`.
struct Double;

impl EventedWorkerImpl for Double {
    fn on_message(&mut self, message: Message, peer: &PeerHandle) -> Result<()> {
        let n = message
            .payload()
            .and_then(|payload| payload.get("n"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        peer.send_message(Message::data(json!({ "n": n * 2 })))
    }
}

/// Shared worker that counts messages across all connections and reports
/// the tally on every message and in status queries.
#[derive(Default)]
struct Tally {
    total: u64,
    connections: u64,
}

impl EventedWorkerImpl for Tally {
    fn on_connect(&mut self, _peer: &PeerHandle) -> Result<()> {
        self.connections += 1;
        Ok(())
    }

    fn on_message(&mut self, _message: Message, peer: &PeerHandle) -> Result<()> {
        self.total += 1;
        peer.send_message(Message::data(json!({ "total": self.total })))
    }

    fn on_disconnect(&mut self, _peer: &PeerHandle) -> Result<()> {
        self.connections = self.connections.saturating_sub(1);
        Ok(())
    }
}

impl SharedWorkerImpl for Tally {
    fn on_query(&mut self, privileged: bool) -> WorkerStatus {
        let mut counters = vec![
            WorkerCounter::new("messages", self.total as f64).with_bounds(Some(0.0), None),
            WorkerCounter::new("connections", self.connections as f64),
        ];
        if privileged {
            counters.extend(WorkerCounter::system_counters());
        }
        WorkerStatus::new(Some(format!("tallied {} messages", self.total)), counters)
    }

    fn on_stop(&mut self) {
        info!(total = self.total, "tally worker stopping");
    }
}
