mod colors;
mod config;
mod endpoint;
mod error;
mod eventstream;
mod mapping;
mod proxy;
mod server;
mod sigv4;
mod transcode;
mod transform;

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use colors::*;
use config::{Config, ConfigError};
use server::ServerState;

/// Options for running the server.
#[derive(Debug, Default, PartialEq)]
struct ServeOptions {
    port: Option<u16>,
    host: Option<String>,
    config_path: Option<PathBuf>,
    debug: bool,
}

#[derive(Debug, PartialEq)]
enum Command {
    Serve(ServeOptions),
    Config(Option<PathBuf>),
    Help,
    Version,
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    match args.first().map(String::as_str) {
        Some("help") => return Ok(Command::Help),
        Some("version") => return Ok(Command::Version),
        _ => {}
    }

    let mut options = ServeOptions::default();
    let mut show_config = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "config" if i == 0 => show_config = true,
            "--port" | "-p" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or("--port requires a port number")?;
                match value.parse::<u16>() {
                    Ok(p) if p > 0 => options.port = Some(p),
                    _ => {
                        return Err(format!(
                            "'{}' is not a valid port number (1-65535)",
                            value
                        ));
                    }
                }
            }
            "--host" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or("--host requires a hostname or IP address")?;
                options.host = Some(value.clone());
            }
            "--config" | "-c" => {
                i += 1;
                let value = args.get(i).ok_or("--config requires a file path")?;
                options.config_path = Some(PathBuf::from(value));
            }
            "--debug" | "-d" => options.debug = true,
            "-h" | "--help" => return Ok(Command::Help),
            "-V" | "--version" => return Ok(Command::Version),
            arg if arg.starts_with('-') => return Err(format!("Unknown option: {}", arg)),
            arg => return Err(format!("Unknown command: {}", arg)),
        }
        i += 1;
    }

    if show_config {
        Ok(Command::Config(options.config_path))
    } else {
        Ok(Command::Serve(options))
    }
}

#[tokio::main]
async fn main() {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("{RED}Error:{RESET} failed to install rustls crypto provider");
        std::process::exit(1);
    }

    let args: Vec<String> = env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{RED}Error:{RESET} {}", e);
            eprintln!();
            eprintln!("Run '{YELLOW}abcp --help{RESET}' for usage information.");
            std::process::exit(1);
        }
    };

    match command {
        Command::Help => print_help(),
        Command::Version => println!("abcp {}", env!("CARGO_PKG_VERSION")),
        Command::Config(path) => {
            let config = load_config(path.as_deref());
            run_config_command(&config, path.as_deref());
        }
        Command::Serve(options) => {
            let config = load_config(options.config_path.as_deref()).with_overrides(
                options.port,
                options.host,
                options.debug,
            );
            if let Err(e) = config.validate() {
                eprintln!("{RED}Invalid configuration:{RESET} {}", e);
                std::process::exit(1);
            }
            init_logging_foreground(config.logging.debug);
            run_server(config).await;
        }
    }
}

/// Load the config file (default location unless given) and apply
/// environment overrides. Exits on unreadable or malformed files.
fn load_config(path: Option<&std::path::Path>) -> Config {
    let loaded = match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };

    match loaded {
        Ok(config) => config.with_env(),
        Err(e) => {
            eprintln!("{RED}Error:{RESET} {}", e);
            if let ConfigError::ParseError { path, source } = &e {
                eprintln!();
                eprintln!("  Config file: {}", path.display());
                let msg = source.to_string();
                if let Some(line_info) = msg.split(" at line ").nth(1) {
                    eprintln!(
                        "  Location: line {}",
                        line_info.split_whitespace().next().unwrap_or("?")
                    );
                }
                eprintln!();
                eprintln!("  {DIM}Fix the syntax error and try again.{RESET}");
            }
            std::process::exit(1);
        }
    }
}

async fn run_server(config: Config) {
    let addr: SocketAddr = match format!("{}:{}", config.host(), config.port()).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(host = %config.host(), port = config.port(), error = %e, "Invalid listen address");
            std::process::exit(1);
        }
    };

    if config.bedrock.access_key.is_empty() || config.bedrock.secret_key.is_empty() {
        warn!("AWS credentials are not configured; requests to Bedrock will fail");
    }
    info!(
        region = %config.bedrock.region,
        default_model = %config.bedrock.default_model,
        mappings = config.bedrock.model_mappings.len(),
        computer_use = config.bedrock.enable_computer_use,
        output_reasoning = config.bedrock.enable_output_reasoning,
        "Bedrock settings"
    );

    let state = Arc::new(ServerState::new(config));

    info!(address = %addr, "Starting ABCP proxy server");
    if let Err(e) = run_server_with_shutdown(addr, state).await {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }
}

fn init_logging_foreground(debug: bool) {
    let filter = if debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("abcp=debug,warn"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("abcp=info,warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();
}

async fn run_server_with_shutdown(
    addr: SocketAddr,
    state: Arc<ServerState>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "Server listening");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Received shutdown signal, stopping server");
                break;
            }
            result = listener.accept() => {
                let (stream, remote_addr) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let state = state.clone();

                tokio::spawn(async move {
                    if let Err(e) = server::handle_connection(stream, remote_addr, state).await {
                        warn!(error = %e, remote = %remote_addr, "Connection error");
                    }
                });
            }
        }
    }

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn run_config_command(config: &Config, path: Option<&std::path::Path>) {
    println!();
    println!("{}{}ABCP Configuration{}", BOLD, GREEN, RESET);
    println!();

    let config_path = path.map(PathBuf::from).unwrap_or_else(Config::path);
    println!("{}Config file:{}", BOLD, RESET);
    if config_path.exists() {
        println!("  {}{}{}", CYAN, config_path.display(), RESET);
    } else {
        println!(
            "  {} {}{}(not created yet){}",
            config_path.display(),
            DIM,
            YELLOW,
            RESET
        );
    }
    println!();

    println!("{}Effective settings:{}", BOLD, RESET);
    println!();
    for line in config.to_masked_toml().lines() {
        println!("  {}", line);
    }
    println!();

    match config.validate() {
        Ok(()) => println!("{}Configuration is valid{}", GREEN, RESET),
        Err(e) => println!("{}Invalid:{} {}", RED, RESET, e),
    }
    println!();
}

fn print_help() {
    println!(
        r#"
{BOLD}abcp{RESET} {DIM}Anthropic Messages API to AWS Bedrock proxy{RESET}

{BOLD}USAGE:{RESET}  {GREEN}abcp{RESET} [COMMAND] [OPTIONS]

{BOLD}COMMANDS{RESET}
  {YELLOW}config{RESET}       Show the effective configuration
  {YELLOW}help{RESET}         Show this help
  {YELLOW}version{RESET}      Show version

{BOLD}OPTIONS{RESET}
  {YELLOW}-p, --port{RESET} <N>        Port to listen on (default 8080)
      {YELLOW}--host{RESET} <HOST>     Address to bind (default 127.0.0.1)
  {YELLOW}-c, --config{RESET} <PATH>   Config file (default {config})
  {YELLOW}-d, --debug{RESET}           Enable debug logging

{BOLD}ENVIRONMENT{RESET}
  {CYAN}AWS_BEDROCK_ACCESS_KEY{RESET}, {CYAN}AWS_BEDROCK_SECRET_KEY{RESET}, {CYAN}AWS_BEDROCK_REGION{RESET},
  {CYAN}AWS_BEDROCK_MODEL_MAPPINGS{RESET} (a=b,c=d), {CYAN}API_KEY{RESET}, {CYAN}HTTP_LISTEN{RESET} (host:port)
"#,
        config = Config::path().display()
    );
}
