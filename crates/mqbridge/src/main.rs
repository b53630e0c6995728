//! mqbridge - MQTT relay between broker connections.

mod config;
mod connection;
mod error;
mod reader;
mod relay;
mod writer;

use std::thread;
use std::time::Duration;

use log::{error, info};

use crate::config::Config;
use crate::relay::Relay;

struct Args {
    config_path: String,
    properties: Vec<String>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = "mqbridge.toml".to_string();
    let mut properties = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                if i + 1 < args.len() {
                    config_path = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("Error: -c requires a file path");
                    std::process::exit(1);
                }
            }
            "-p" | "--property" => {
                if i + 1 < args.len() {
                    properties.push(args[i + 1].clone());
                    i += 2;
                } else {
                    eprintln!("Error: -p requires <connection>.<property>=<value>");
                    std::process::exit(1);
                }
            }
            "-h" | "--help" => {
                println!("mqbridge - MQTT relay between brokers");
                println!();
                println!("Usage: mqbridge [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <FILE>       Config file path (default: mqbridge.toml)");
                println!("  -p, --property <C.K=V>    Set client property K on connection C");
                println!("  -h, --help                Show this help message");
                println!();
                println!("Configuration:");
                println!("  Config file uses TOML format. Settings can be overridden");
                println!("  with environment variables using MQBRIDGE__ prefix:");
                println!();
                println!("  MQBRIDGE__LOG__LEVEL=debug");
                println!("  MQBRIDGE__LOG__STATS_INTERVAL=10");
                println!();
                println!("  Client properties, e.g.:");
                println!("  -p cloud.client.servers='ssl://a:8883;ssl://b:8883'");
                println!("  -p edge.client.keep_alive_period.sec=30");
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                eprintln!("Use --help for usage information");
                std::process::exit(1);
            }
        }
    }

    Args {
        config_path,
        properties,
    }
}

fn main() {
    let args = parse_args();

    let config = match Config::load(&args.config_path, &args.properties) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log.level))
        .init();

    info!(
        "Loaded configuration from {} ({} connection(s), {} route(s))",
        args.config_path,
        config.connection.len(),
        config.route.len()
    );
    if config.route.is_empty() {
        error!("No routes configured, nothing to do");
        std::process::exit(1);
    }

    let mut relay = match Relay::from_config(&config) {
        Ok(r) => r,
        Err(e) => {
            error!("Failed to create connections: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = relay.connect_all() {
        error!("Failed to connect: {}", e);
        std::process::exit(1);
    }

    for route in &config.route {
        if let Err(e) = relay.start_route(route) {
            error!("Failed to start route '{}': {}", route.name, e);
            std::process::exit(1);
        }
    }

    let interval = match config.log.stats_interval {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    loop {
        match interval {
            Some(interval) => {
                thread::sleep(interval);
                relay.log_stats();
            }
            None => thread::park(),
        }
    }
}
