//! Command-line interface.

use std::path::PathBuf;

use clap::Parser;

/// Keyfront - Backend-for-Frontend security gateway.
#[derive(Parser, Debug)]
#[command(name = "keyfront", version, about)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "KEYFRONT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the bind port.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Override the bind host.
    #[arg(long)]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "KEYFRONT_LOG_LEVEL")]
    pub log_level: String,

    /// Log format ("json" for structured output).
    #[arg(long, env = "KEYFRONT_LOG_FORMAT")]
    pub log_format: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults() {
        let cli = Cli::parse_from(["keyfront"]);
        assert!(cli.config.is_none());
        assert!(cli.port.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn parses_overrides() {
        let cli = Cli::parse_from([
            "keyfront",
            "--config",
            "/etc/keyfront.yaml",
            "--port",
            "9000",
            "--host",
            "0.0.0.0",
            "--log-format",
            "json",
        ]);
        assert_eq!(cli.config.unwrap().to_str().unwrap(), "/etc/keyfront.yaml");
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(cli.log_format.as_deref(), Some("json"));
    }
}
