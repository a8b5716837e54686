//! Command-line interface definitions and parsing

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Radio backend
    #[arg(short, long, value_enum, default_value_t = Backend::Tcp)]
    pub backend: Backend,

    /// Override the TCP listen address
    #[arg(long)]
    pub listen_addr: Option<String>,
}

/// Which radio stack to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// TCP stand-in with a configured peer list
    Tcp,
    /// Bluetooth Classic through BlueZ (Linux)
    Bluez,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan for nearby devices
    Scan {
        /// How long to keep the scan window open
        #[arg(short, long)]
        seconds: Option<u64>,
        /// Print snapshots as JSON
        #[arg(long)]
        json: bool,
    },
    /// List bonded devices
    Paired {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Wait for a peer to connect, then chat
    Listen,
    /// Connect to a peer, then chat
    Connect {
        /// Peer address
        address: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_with_backend() {
        let cli = Cli::parse_from(["bluechat", "--backend", "bluez", "connect", "00:11:22:33:44:55"]);
        assert_eq!(cli.backend, Backend::Bluez);
        assert!(matches!(cli.command, Commands::Connect { ref address } if address == "00:11:22:33:44:55"));
    }

    #[test]
    fn test_scan_defaults() {
        let cli = Cli::parse_from(["bluechat", "scan"]);
        assert_eq!(cli.backend, Backend::Tcp);
        assert!(matches!(cli.command, Commands::Scan { seconds: None, json: false }));
    }
}
