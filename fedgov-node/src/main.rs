mod config;
mod service;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use config::{load_config, ConfigError, ConfigFormat, NodeKind};
use fedgov_usercode::VerifyKey;
use service::{read_request, NodeService, PublishRequest, SubmitRequest};

#[derive(Debug, Parser)]
#[command(
    name = "fedgov-node",
    version,
    about = "Reference FedGov node: privacy-budgeted publish and governed user code"
)]
struct Cli {
    /// Path to configuration file (TOML or YAML).
    #[arg(long, default_value = "configs/fedgov-node.toml")]
    config: PathBuf,
    /// Explicit configuration format override.
    #[arg(long, value_enum, default_value_t = ConfigFormat::Auto)]
    config_format: ConfigFormat,
    /// Override the node name defined in the config file.
    #[arg(long)]
    node_name: Option<String>,
    /// Override the node type defined in the config file.
    #[arg(long, value_enum)]
    node_type: Option<NodeKind>,
    /// Override the executor step limit.
    #[arg(long)]
    max_steps: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Release a noised aggregate described by a JSON request.
    Publish {
        request: PathBuf,
        #[arg(long)]
        budget: Option<f64>,
        #[arg(long)]
        sigma: Option<f64>,
    },
    /// Run a JSON code submission through the transform pipeline.
    Submit {
        request: PathBuf,
        /// Label the submitter's verify key is derived from.
        #[arg(long, default_value = "data-scientist")]
        user: String,
    },
    /// Submit, approve and execute a sample function, then publish.
    Demo,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config, cli.config_format)?;
    if let Some(name) = cli.node_name {
        config.node.name = name;
    }
    if let Some(kind) = cli.node_type {
        config.node.node_type = kind;
    }
    if let Some(steps) = cli.max_steps {
        config.executor.max_steps = steps;
    }
    config.validate().map_err(|err| match err {
        ConfigError::Validation(reason) => color_eyre::eyre::eyre!(reason),
        other => other.into(),
    })?;

    let mut service = NodeService::new(&config)?;
    match cli.command {
        Command::Publish {
            request,
            budget,
            sigma,
        } => {
            let mut request: PublishRequest = read_request(&request)?;
            request.budget = budget.or(request.budget);
            request.sigma = sigma.or(request.sigma);
            let receipt = service.publish(&request)?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
        }
        Command::Submit { request, user } => {
            let request: SubmitRequest = read_request(&request)?;
            let report = service.submit(&request, VerifyKey::derive(&user))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Demo => {
            let report = service.run_demo()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
