//! Main binary for the idlegpu scheduling daemon (idlegpud)

use clap::{Parser, Subcommand};
use idlegpu_agent::{init_agent, AgentConfig, AgentError, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "idlegpud")]
#[command(about = "Runs background indexing while the GPU is idle")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (overrides the configuration file)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// HTTP bind address
    #[arg(long, value_name = "ADDR")]
    bind: Option<SocketAddr>,

    /// PID file path
    #[arg(long, value_name = "FILE")]
    pid_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default)
    Run,
    /// Query a running daemon
    Status {
        /// Base URL of the daemon
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        url: String,
    },
    /// Generate default configuration
    Config {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration
    Validate {
        /// Configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Status { ref url }) => check_status(url).await,
        Some(Commands::Config { ref output }) => generate_config(output.clone()),
        Some(Commands::Validate { ref config }) => validate_config(config.clone()),
        Some(Commands::Run) | None => run_agent(&cli).await,
    }
}

async fn run_agent(cli: &Cli) -> Result<()> {
    let mut config = AgentConfig::load(cli.config.as_deref())?;

    // Apply CLI overrides
    if let Some(ref level) = cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(bind) = cli.bind {
        config.http.bind_addr = bind;
    }
    if let Some(ref pid_file) = cli.pid_file {
        config.agent.pid_file = Some(pid_file.clone());
    }

    let mut agent = init_agent(&config).await?;

    info!("Starting idlegpu daemon: {}", config.agent.name);

    if let Err(e) = agent.run().await {
        error!("Agent failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn check_status(url: &str) -> Result<()> {
    let endpoint = format!("{}/v1/scheduler", url.trim_end_matches('/'));
    let response = match reqwest::get(&endpoint).await {
        Ok(response) => response,
        Err(e) => {
            println!("Status: NOT RUNNING");
            println!("Could not reach {}: {}", endpoint, e);
            return Ok(());
        }
    };

    let status: serde_json::Value = response.error_for_status()?.json().await?;
    println!("Status: RUNNING");
    println!("Phase: {}", status["scheduler"]["phase"].as_str().unwrap_or("unknown"));
    println!("Idle for: {:.0}s", status["scheduler"]["idle_seconds"].as_f64().unwrap_or(0.0));

    let gpu = &status["gpu"];
    if gpu["available"].as_bool().unwrap_or(false) {
        println!("GPU utilization: {:.1}%", gpu["utilization"].as_f64().unwrap_or(0.0));
    } else {
        println!("GPU: unavailable");
    }

    match status["workload"]["name"].as_str() {
        Some(name) => println!(
            "Resident workload: {} ({})",
            name,
            status["workload"]["kind"].as_str().unwrap_or("unknown")
        ),
        None => println!("Resident workload: none"),
    }
    println!("Observers: {}", status["observers"]);

    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> Result<()> {
    let config = AgentConfig::default();

    if let Some(output_path) = output {
        config.to_file(&output_path)?;
        println!("Generated configuration file: {}", output_path.display());
    } else {
        println!("{}", config.to_yaml()?);
    }

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());

    let config = AgentConfig::from_file(&config_path)?;
    match config.validate() {
        Ok(()) => {
            println!("Configuration is valid");
            Ok(())
        }
        Err(e) => {
            println!("Configuration is invalid: {}", e);
            Err(AgentError::Config(format!(
                "{} failed validation",
                config_path.display()
            )))
        }
    }
}
