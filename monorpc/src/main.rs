use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use monorpc_core::{config::Config, ClientConnection, Controller, Endpoint, Server, Stub};
use monorpc_services::echo::{EchoRequest, EchoResponse, EchoService, ECHO1, SERVICE};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the echo service
    Serve {
        /// Path of the config file
        #[clap(short, long, value_parser)]
        config: PathBuf,
    },
    /// Call Echo1 once and print the answer
    Call {
        /// `host:port` or `unix:<path>`
        #[clap(short, long, value_parser)]
        endpoint: String,
        #[clap(short, long, default_value = "client question")]
        question: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    match Args::parse().command {
        Command::Serve { config } => serve(config),
        Command::Call { endpoint, question } => call(&endpoint, question),
    }
}

fn serve(path: PathBuf) -> Result<()> {
    let config = Config::load(&path)?;
    let endpoint = Endpoint::try_from(config.listener).context("listener address")?;
    let server = Server::with_config(config.runtime, config.connection);
    server.register_service(EchoService::new().service())?;
    let local = server.listen(&endpoint)?;
    tracing::info!("echo service ready on {local}");

    // reactors and workers do the serving
    loop {
        std::thread::park();
    }
}

fn call(endpoint: &str, question: String) -> Result<()> {
    let endpoint: Endpoint = endpoint
        .parse()
        .with_context(|| format!("invalid endpoint {endpoint}"))?;
    let client = ClientConnection::new(endpoint);
    client.register_service(EchoService::new().service())?;
    client.connect()?;

    let response: EchoResponse = Stub::new(&client, SERVICE).call_blocking(
        ECHO1,
        &EchoRequest::new(question),
        &Controller::new(),
    )?;
    println!("{}", response.text);
    client.disconnect();
    Ok(())
}
