// crates/flowcli/src/main.rs

use anyhow::Result;
use clap::{Parser, Subcommand};
use flowcore::{FlowEvent, NodeContext, NodeError};
use flowruntime::{Flow, FlowConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow runtime CLI", long_about = None)]
struct Cli {
    /// Show debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the fan-out/fan-in demo graph: Start => (A, B) => C => Done
    Demo {
        /// Flow configuration JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the run deadline, in milliseconds
        #[arg(short, long)]
        deadline_ms: Option<u64>,

        /// The sink never signals completion, so the run times out
        #[arg(long)]
        stall: bool,

        /// Node A panics instead of forwarding its value
        #[arg(long)]
        fault: bool,

        /// Print run events as JSON lines
        #[arg(long)]
        events: bool,
    },

    /// Write the default configuration
    Config {
        /// Output file path; prints to stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Demo {
            config,
            deadline_ms,
            stall,
            fault,
            events,
        } => {
            let mut config = match config {
                Some(path) => FlowConfig::from_json_file(path)?,
                None => FlowConfig::default(),
            };
            if let Some(ms) = deadline_ms {
                config = config.with_deadline(Duration::from_millis(ms));
            }
            run_demo(config, stall, fault, events).await?;
        }

        Commands::Config { output } => {
            let json = FlowConfig::default().to_json()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    println!("Wrote default configuration to {}", path.display());
                }
                None => println!("{json}"),
            }
        }
    }

    Ok(())
}

async fn start(ctx: NodeContext) -> Result<(), NodeError> {
    ctx.send("A", 1).await?;
    ctx.close("A")?;
    ctx.send("B", "2").await?;
    ctx.close("B")?;
    tracing::info!("Start sent 1 and \"2\"");
    Ok(())
}

async fn forward(mut ctx: NodeContext) -> Result<(), NodeError> {
    let value = ctx.recv("Start").await?;
    tracing::info!(?value, "A got");
    ctx.send("C", value).await?;
    Ok(())
}

async fn fault(_ctx: NodeContext) -> Result<(), NodeError> {
    panic!("A was asked to fail")
}

async fn parse(mut ctx: NodeContext) -> Result<(), NodeError> {
    let value = ctx.recv("Start").await?;
    let text = value.as_str().ok_or_else(|| NodeError::InvalidInputType {
        edge: "Start2B".to_string(),
        expected: "string".to_string(),
        actual: value.type_name().to_string(),
    })?;
    let parsed: i64 = text
        .parse()
        .map_err(|e| NodeError::failed(format!("B cannot parse {text:?}: {e}")))?;
    tracing::info!(parsed, "B got");
    ctx.send("C", parsed).await?;
    Ok(())
}

async fn sum(mut ctx: NodeContext) -> Result<(), NodeError> {
    let a = ctx.recv("A").await?;
    let b = ctx.recv("B").await?;
    let total = a.as_i64().zip(b.as_i64()).map(|(a, b)| a + b);
    tracing::info!(?total, "sink got sum");
    ctx.complete(total.is_some())?;
    Ok(())
}

async fn stalled_sum(mut ctx: NodeContext) -> Result<(), NodeError> {
    ctx.recv("A").await?;
    ctx.recv("B").await?;
    tracing::info!("sink received both values and stays silent");
    Ok(())
}

async fn run_demo(config: FlowConfig, stall: bool, fail: bool, print_events: bool) -> Result<()> {
    let mut flow = Flow::with_config(config);
    let mut events = flow.subscribe();

    flow.declare_start("Start")?.set_task(start);
    if fail {
        flow.declare_node("A")?.set_task(fault);
    } else {
        flow.declare_node("A")?.set_task(forward);
    }
    flow.declare_node("B")?.set_task(parse);
    if stall {
        flow.declare_sink("C")?.set_task(stalled_sum);
    } else {
        flow.declare_sink("C")?.set_task(sum);
    }

    flow.connect("Start", "A")?;
    flow.connect("Start", "B")?;
    flow.connect("A", "C")?;
    flow.connect("B", "C")?;

    println!("🚀 Running demo flow (deadline {:?})", flow.deadline());
    let result = flow.run().await;
    flow.cleanup();

    if print_events {
        while let Ok(event) = events.try_recv() {
            println!("{}", serde_json::to_string(&event)?);
        }
    } else {
        while let Ok(event) = events.try_recv() {
            if let FlowEvent::RunFinished { duration_ms, .. } = event {
                println!("   Finished in {duration_ms}ms");
            }
        }
    }

    match result {
        Ok(()) => {
            println!("✅ Flow completed");
            Ok(())
        }
        Err(e) => {
            println!("❌ Flow failed: {e}");
            Err(e.into())
        }
    }
}
