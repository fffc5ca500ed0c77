mod config;
mod qmtp_server;
mod store;

use crate::config::Config;
use anyhow::Result;
use log::error;
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

fn run() -> Result<i32> {
    let config = Config::from_env()?;
    match &config.listen {
        Some(addr) => {
            qmtp_server::serve_tcp(&config, addr)?;
            Ok(qmtp::EXIT_DISCONNECT)
        }
        None => qmtp_server::serve_stdio(&config),
    }
}

fn main() -> Result<()> {
    let level = config::log_level(std::env::var("QMTPD_LOG").ok())?;
    let log_config = ConfigBuilder::new()
        .add_filter_allow_str("qmtpd")
        .add_filter_allow_str("qmtp")
        .build();
    // stdout carries the protocol
    TermLogger::init(level, log_config, TerminalMode::Stderr, ColorChoice::Auto)?;
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(qmtp::EXIT_RESOURCES);
        }
    }
}
