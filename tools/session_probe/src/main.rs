use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use fle_core::{load_session_config_from_env, Session};
use fle_schema::GameState;

#[derive(Parser, Debug)]
#[command(author, version, about = "Connect to a running simulation and evaluate agent programs", long_about = None)]
struct Args {
    /// Program to evaluate; repeat to run several in order
    #[arg(long = "program")]
    programs: Vec<PathBuf>,

    /// Agent the programs run as
    #[arg(long, default_value_t = 0)]
    agent: usize,

    /// Override the configured simulation address
    #[arg(long)]
    address: Option<String>,

    /// Override the configured RCON port
    #[arg(long)]
    port: Option<u16>,

    /// Override the configured RCON password
    #[arg(long)]
    password: Option<String>,

    /// Override the configured number of agents
    #[arg(long)]
    agents: Option<usize>,

    /// Per-program evaluation timeout (seconds)
    #[arg(long)]
    timeout: Option<u64>,

    /// Restore this saved game state before evaluating
    #[arg(long)]
    restore: Option<PathBuf>,

    /// Write the game state after evaluation to this file
    #[arg(long)]
    save: Option<PathBuf>,

    /// Report profits for each program
    #[arg(long)]
    profits: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let (mut config, source) = load_session_config_from_env();
    if let Some(address) = args.address {
        config.address = address;
    }
    if let Some(port) = args.port {
        config.tcp_port = port;
    }
    if let Some(password) = args.password {
        config.rcon_password = password;
    }
    if let Some(agents) = args.agents {
        config.num_agents = agents;
    }
    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.eval_timeout());
    let target = format!("{}:{}", config.address, config.tcp_port);

    let session = Session::connect(config)
        .with_context(|| format!("Failed to start a session against {target}"))?;
    println!(
        "=== session {} at {} ({} agents, config: {}) ===",
        session.id(),
        session.address(),
        session.num_agents(),
        source
            .as_ref()
            .map_or_else(|| "builtin".to_string(), |path| path.display().to_string())
    );

    if let Some(path) = &args.restore {
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read game state at {}", path.display()))?;
        let state = GameState::from_json(&data)
            .with_context(|| format!("Failed to parse game state at {}", path.display()))?;
        session
            .reset(Some(&state))
            .with_context(|| format!("Failed to restore game state from {}", path.display()))?;
        println!("Restored {}", path.display());
    }

    for path in &args.programs {
        let program = fs::read_to_string(path)
            .with_context(|| format!("Failed to read program at {}", path.display()))?;
        println!("=== {} ===", path.display());
        if args.profits {
            let report = session
                .eval_with_profits(&program, args.agent, timeout)
                .with_context(|| format!("Failed to sample production around {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            let outcome = session.eval(&program, args.agent, timeout);
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }

    for warning in session.warnings(10).context("Failed to read alerts")? {
        println!("warning: {warning}");
    }

    if let Some(path) = &args.save {
        let state = session.game_state().context("Failed to capture game state")?;
        fs::write(path, state.to_json_pretty()?)
            .with_context(|| format!("Failed to write game state to {}", path.display()))?;
        println!("Saved {}", path.display());
    }

    session.cleanup();
    Ok(())
}
