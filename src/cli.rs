//! Command-line surface.

use std::path::PathBuf;

use clap::{ArgAction, Parser};

#[derive(Parser, Debug)]
#[command(
    name = "filemesh",
    version,
    about = "Distributed file access with Ricart-Agrawala mutual exclusion",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Node identity, unique across the cluster (1-255).
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..))]
    pub id: u8,

    /// Listening port for the peer mesh (client) or for clients (server).
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// Path to the cluster properties file.
    #[arg(long = "props_file", alias = "props-file", value_name = "PATH")]
    pub props_file: PathBuf,

    /// Scratch directory for received file transfers.
    #[arg(
        long = "temp_dir",
        alias = "temp-dir",
        value_name = "PATH",
        default_value = ".proj2_temp"
    )]
    pub temp_dir: PathBuf,

    /// Socket poll timeout in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = 60_000)]
    pub timeout: u64,

    /// Delay between connect attempts in milliseconds.
    #[arg(
        long = "retry_timeout",
        alias = "retry-timeout",
        value_name = "MS",
        default_value_t = 15_000
    )]
    pub retry_timeout: u64,

    /// Run as a file server.
    #[arg(long, conflicts_with = "client")]
    pub server: bool,

    /// Run as a client node in the peer mesh.
    #[arg(long)]
    pub client: bool,

    /// Stop the client after this many workload operations (default: run
    /// until killed).
    #[arg(long, value_name = "N", requires = "client")]
    pub operations: Option<u64>,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::parse_from(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "filemesh",
            "--id",
            "3",
            "--port",
            "4000",
            "--props_file",
            "cluster.properties",
            "--client",
        ]
    }

    #[test]
    fn parses_required_options() {
        let cli = parse_from(base_args());
        assert_eq!(cli.id, 3);
        assert_eq!(cli.port, 4000);
        assert!(cli.client);
        assert!(!cli.server);
        assert_eq!(cli.timeout, 60_000);
        assert_eq!(cli.retry_timeout, 15_000);
        assert_eq!(cli.temp_dir, PathBuf::from(".proj2_temp"));
    }

    #[test]
    fn rejects_id_zero() {
        let mut args = base_args();
        args[2] = "0";
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn rejects_port_zero() {
        let mut args = base_args();
        args[4] = "0";
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn server_and_client_conflict() {
        let mut args = base_args();
        args.push("--server");
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn accepts_dashed_aliases() {
        let cli = parse_from(vec![
            "filemesh",
            "--id",
            "1",
            "--port",
            "4000",
            "--props-file",
            "a.properties",
            "--retry-timeout",
            "100",
            "--client",
        ]);
        assert_eq!(cli.retry_timeout, 100);
    }
}
