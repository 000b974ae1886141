use crate::PortalConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Move files between local processes through shared memory
#[derive(Parser, Debug, PartialEq)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand
    #[clap(subcommand)]
    pub command: Command,

    /// Config file path
    #[clap(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[clap(short, long, global = true)]
    pub log_level: Option<String>,

    /// Write logs to this file instead of stdout
    #[clap(long, value_name = "FILE", global = true)]
    pub log_file: Option<PathBuf>,
}

/// Roles
#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Transmit local files to a running server
    Client {
        /// Files to transmit
        #[clap(required = true, value_name = "PATH")]
        paths: Vec<PathBuf>,
    },

    /// Create the shared segment and receive files
    Server {
        /// Directory received files are written to
        #[clap(short, long, value_name = "DIR")]
        output_dir: Option<PathBuf>,
    },
}

impl Cli {
    /// Apply command line overrides on top of a loaded config
    pub fn apply_to(&self, config: &mut PortalConfig) {
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Command::Server { output_dir: Some(dir) } = &self.command {
            config.output_dir = dir.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_parsing() {
        let cli = Cli::try_parse_from(&["file-portal", "client", "a.txt", "dir/b.bin"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Client { paths: vec![PathBuf::from("a.txt"), PathBuf::from("dir/b.bin")] }
        );
        assert_eq!(cli.config, None);
    }

    #[test]
    fn test_client_requires_paths() {
        assert!(Cli::try_parse_from(&["file-portal", "client"]).is_err());
        assert!(Cli::try_parse_from(&["file-portal"]).is_err());
        assert!(Cli::try_parse_from(&["file-portal", "relay"]).is_err());
    }

    #[test]
    fn test_server_with_options() {
        let cli = Cli::try_parse_from(&[
            "file-portal",
            "server",
            "--output-dir",
            "/srv/inbox",
            "--log-level",
            "debug",
            "--config",
            "portal.toml",
        ])
        .unwrap();

        assert_eq!(cli.command, Command::Server { output_dir: Some(PathBuf::from("/srv/inbox")) });
        assert_eq!(cli.config, Some(PathBuf::from("portal.toml")));

        let mut config = PortalConfig::default();
        cli.apply_to(&mut config);
        assert_eq!(config.output_dir, PathBuf::from("/srv/inbox"));
        assert_eq!(config.log_level, "debug");
    }
}
