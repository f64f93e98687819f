use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use run_panel::agent::config::Config;
use run_panel::commands::CommandExecutor;
use run_panel::comms::local_api;
use run_panel::transport::CommandRequest;
use run_panel::utils;

#[derive(Parser)]
#[command(name = "run-panel", version, about = "Remote command runner with live telemetry streams")]
struct AppCli {
    /// Config file path
    #[arg(short, long, default_value = "config.json", global = true)]
    config: String,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server and telemetry producers
    Serve {
        /// Overrides the configured port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run a single command through the policy and print the result
    Run {
        /// Allow dangerous verbs (rm, mv, kill, sudo, ...)
        #[arg(long = "unsafe")]
        allow_dangerous: bool,
        /// Command line to execute
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        cmd: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init();

    let args = AppCli::parse();
    let config = Config::load(&args.config)?;

    match args.command {
        Some(Commands::Serve { port }) => {
            let port = port.unwrap_or(config.port);
            info!("Starting run panel on port {port}");
            local_api::serve(config, port).await?;
        }
        Some(Commands::Run {
            allow_dangerous,
            cmd,
        }) => {
            let executor = CommandExecutor::from_config(&config.command);
            let request = CommandRequest::new(cmd.join(" "), !allow_dangerous);
            let result = executor.execute(&request).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.succeeded {
                std::process::exit(1);
            }
        }
        None => {
            let port = config.port;
            info!("Starting run panel on port {port}");
            local_api::serve(config, port).await?;
        }
    }

    Ok(())
}
