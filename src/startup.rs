// Startup module - banner and startup logging
//
// Prints a short banner to stderr before the server starts, then mirrors
// the important facts into the structured log.

use crate::config::{Config, VERSION};

/// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const CYAN: &str = "\x1b[36m";
    pub const MAGENTA: &str = "\x1b[35m";
}

/// Print the startup banner
pub fn print_startup(config: &Config) {
    use colors::*;

    eprintln!();
    eprintln!("  {BOLD}{CYAN}CC-Proxy{RESET} {DIM}v{VERSION}{RESET}");
    eprintln!("  {DIM}Claude-compatible proxy for OpenAI and Anthropic backends{RESET}");
    eprintln!();

    for provider in &config.providers {
        let models =
            provider.big_models.len() + provider.middle_models.len() + provider.small_models.len();
        eprintln!(
            "  {DIM}Provider:{RESET} {} ({:?}, {} model{})",
            provider.name,
            provider.provider_type,
            models,
            if models == 1 { "" } else { "s" }
        );
    }
    if config.providers.is_empty() {
        eprintln!("  {DIM}Provider:{RESET} none configured");
    }

    let enabled = config.transformers.iter().filter(|t| t.enabled).count();
    if enabled > 0 {
        eprintln!("  {DIM}Transformers:{RESET} {enabled} enabled");
    }

    eprintln!("  {DIM}History:{RESET} {}", config.db_path.display());
    eprintln!();
    eprintln!(
        "  {MAGENTA}▸{RESET} Listening on {BOLD}{}{RESET}",
        config.bind_addr
    );
    eprintln!();
}

/// Mirror startup facts into the structured log
pub fn log_startup(config: &Config) {
    tracing::info!(
        version = VERSION,
        bind = %config.bind_addr,
        providers = config.providers.len(),
        transformers = config.transformers.iter().filter(|t| t.enabled).count(),
        db = %config.db_path.display(),
        "Starting ccproxy"
    );
    if config.api_key.is_none() {
        tracing::warn!("No client api_key configured; accepting any token");
    }
}
