//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

/// Hosted-channel provider plugin for Core Lightning.
#[derive(Parser, Debug, Clone)]
#[command(name = "hostchan-node")]
#[command(about = "Hosted-channel provider plugin binary")]
#[command(version)]
pub struct Cli {
    /// Data directory for channel state.
    #[arg(long, default_value = "~/.hostchan")]
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error). Logs go to stderr;
    /// stdout carries the plugin JSON-RPC stream.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Expand the data directory path (handle ~ for home).
    pub fn expanded_data_dir(&self) -> PathBuf {
        let path_str = self.data_dir.to_string_lossy();
        if let Some(stripped) = path_str.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped);
            }
        }
        self.data_dir.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let cli = Cli::parse_from(["hostchan-node"]);
        assert_eq!(cli.log_level, "info");
        assert_eq!(cli.data_dir, PathBuf::from("~/.hostchan"));
    }

    #[test]
    fn test_data_dir_flag() {
        let cli = Cli::parse_from(["hostchan-node", "--data-dir", "/tmp/hc"]);
        assert_eq!(cli.expanded_data_dir(), PathBuf::from("/tmp/hc"));
    }
}
