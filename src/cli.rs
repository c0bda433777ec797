// CLI module - command-line argument parsing and handlers
//
// Flags override the config file; the `config` subcommand inspects the
// effective configuration without starting the server.

use crate::config::{Config, VERSION};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CC-Proxy - Claude-compatible proxy for OpenAI and Anthropic backends
#[derive(Parser)]
#[command(name = "ccproxy")]
#[command(version = VERSION)]
#[command(about = "Claude-compatible proxy for OpenAI and Anthropic backends", long_about = None)]
pub struct Cli {
    /// Path to config file (default: ~/.config/ccproxy/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the bind address (e.g. 127.0.0.1:8082)
    #[arg(long)]
    pub bind: Option<String>,

    /// Override the history database path
    #[arg(long)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

/// Handle subcommands. Returns true if one was handled (exit after).
pub fn handle_command(cli: &Cli) -> anyhow::Result<bool> {
    match &cli.command {
        Some(Commands::Config { show, path }) => {
            if *path {
                match cli
                    .config
                    .clone()
                    .or_else(Config::default_path)
                {
                    Some(p) => println!("{}", p.display()),
                    None => anyhow::bail!("could not determine config path"),
                }
            } else if *show {
                let config = Config::load(cli.config.as_deref())?;
                print_effective(&config);
            } else {
                println!("Usage: ccproxy config [--show|--path]");
            }
            Ok(true)
        }
        None => Ok(false),
    }
}

fn print_effective(config: &Config) {
    println!("# Effective configuration (env > file > defaults)");
    println!();
    println!("bind_addr = {:?}", config.bind_addr.to_string());
    println!("db_path = {:?}", config.db_path.display().to_string());
    println!("log_level = {:?}", config.log_level);
    println!("request_timeout_secs = {}", config.request_timeout_secs);
    println!("upstream_retries = {}", config.upstream_retries);
    println!("max_tokens_limit = {}", config.max_tokens_limit);
    println!("min_tokens_limit = {}", config.min_tokens_limit);
    println!("client_auth = {}", config.api_key.is_some());
    println!();
    for provider in &config.providers {
        println!("[[provider]] {}", provider.name);
        println!("  base_url = {:?}", provider.base_url);
        println!("  provider_type = {:?}", provider.provider_type);
        // Key values are never printed
        println!("  key_configured = {}", provider.resolve_key().is_some());
        println!("  big_models = {:?}", provider.big_models);
        println!("  middle_models = {:?}", provider.middle_models);
        println!("  small_models = {:?}", provider.small_models);
    }
    println!();
    for t in &config.transformers {
        println!(
            "[transformers.{}] enabled={} providers={:?} models={:?}",
            t.name, t.enabled, t.providers, t.models
        );
    }
}
