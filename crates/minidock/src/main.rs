//! mini-docker CLI entry point.

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use minidock::cli::Cli;

fn log_filter(debug: bool) -> EnvFilter {
    let level = if debug {
        "debug".to_string()
    } else {
        std::env::var("MINI_DOCKER_LOG_LEVEL").unwrap_or_else(|_| "warn".to_string())
    };
    EnvFilter::try_new(format!("minidock={level},mini_docker={level}"))
        .unwrap_or_else(|_| EnvFilter::new("warn"))
}

fn main() {
    if let Err(e) = color_eyre::install() {
        eprintln!("failed to install error reporting: {e}");
    }

    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(log_filter(cli.debug))
        .init();

    match cli.execute() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("mini-docker: {err}");
            std::process::exit(err.exit_code());
        }
    }
}
