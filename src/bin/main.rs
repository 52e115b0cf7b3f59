use std::time::Duration;

use filemesh::cli::{self, Cli};
use filemesh::config::{Config, ConfigError};
use filemesh::node::{ClientNode, NodeOptions};
use filemesh::pool::{WorkerPool, DEFAULT_WORKERS};
use filemesh::proto::NodeId;
use filemesh::server::FileServer;
use filemesh::telemetry;
use filemesh::tempstore::TempStore;

fn main() {
    let cli = cli::parse_from(std::env::args_os());
    telemetry::init(cli.verbose);

    if !cli.server && !cli.client {
        tracing::error!("one of --server or --client must be set");
        std::process::exit(1);
    }

    if let Err(err) = run(cli) {
        tracing::error!("fatal: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> filemesh::Result<()> {
    let config = Config::load(&cli.props_file, cli.port)?;

    if cli.server {
        run_server(cli, config)
    } else {
        run_client(cli, config)
    }
}

fn run_server(cli: Cli, config: Config) -> filemesh::Result<()> {
    let root = config
        .root_dir
        .ok_or(ConfigError::MissingKey { key: "root_dir" })?;
    let pool = WorkerPool::start(DEFAULT_WORKERS);
    let temp = TempStore::new(&cli.temp_dir);
    let server = FileServer::new(root, cli.port, pool, temp)?;
    let handle = server.start()?;
    handle.join();
    Ok(())
}

fn run_client(cli: Cli, config: Config) -> filemesh::Result<()> {
    let options = NodeOptions {
        node_id: NodeId::new(cli.id),
        port: cli.port,
        temp_dir: cli.temp_dir.clone(),
        poll_timeout: Duration::from_millis(cli.timeout),
        retry_timeout: Duration::from_millis(cli.retry_timeout),
        operations: cli.operations,
    };
    ClientNode::run(options, config)
}
