// CLI Command Implementations
// Commands that run without starting the engine

use super::{error, info, success, Commands};
use crate::config::EngineConfig;
use colored::*;
use std::path::Path;

/// Execute a command that does not need the engine
pub fn execute(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Validate { file } => validate_command(&file),
        Commands::Start { .. } => anyhow::bail!("start is handled by the daemon entry point"),
    }
}

/// Validate configuration file
fn validate_command(file: &str) -> anyhow::Result<()> {
    info(&format!("Validating {}", file.bright_white()));

    if !Path::new(file).exists() {
        error(&format!("Configuration file {} not found", file));
        anyhow::bail!("configuration file {file} not found");
    }

    match EngineConfig::load(file) {
        Ok(config) => {
            success("Configuration is valid");
            println!();
            println!("  {} {}", "Listen:".bright_white(), format!("{}:{}", config.server.bind_addr, config.server.listen_port).cyan());
            println!("  {} {}", "Clients:".bright_white(), config.limits.max_connections.to_string().cyan());
            println!("  {} {}", "Provider calls:".bright_white(), config.limits.max_provider_calls.to_string().cyan());
            println!("  {} {} bytes", "Slice size:".bright_white(), config.limits.slice_size.to_string().cyan());
            println!("  {} {}s", "Client timeout:".bright_white(), config.limits.client_timeout_secs.to_string().cyan());
            if config.server.router_mode {
                println!(
                    "  {} {} ports {:?}",
                    "Provider:".bright_white(),
                    config.provider.ip.as_deref().unwrap_or("-").cyan(),
                    config.provider.ports
                );
            }
            Ok(())
        }
        Err(e) => {
            error(&format!("Configuration is invalid: {e:#}"));
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_validate_accepts_good_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[limits]\nmax_connections = 32\n").unwrap();
        let path = file.path().to_string_lossy().to_string();
        assert!(execute(Commands::Validate { file: path }).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_router_section() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nrouter_mode = true\n").unwrap();
        let path = file.path().to_string_lossy().to_string();
        assert!(execute(Commands::Validate { file: path }).is_err());
    }

    #[test]
    fn test_validate_missing_file() {
        assert!(execute(Commands::Validate { file: "/nonexistent/txn.toml".into() }).is_err());
    }
}
