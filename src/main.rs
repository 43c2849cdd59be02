use clap::Parser;
use raftstream::actor::ActorScheduler;
use raftstream::config::MemberConfig;
use raftstream::engine::SystemClock;
use raftstream::logging::create_logger;
use raftstream::raft::{HttpMessageSender, HttpServer};
use raftstream::{Broker, BrokerConfig};
use slog::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "raftstream")]
#[command(about = "Partitioned, Raft-replicated stream processing broker", long_about = None)]
struct Args {
    /// TOML configuration file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node ID of this broker
    #[arg(short, long)]
    node_id: Option<u64>,

    /// Address the peer endpoint binds to (e.g. 0.0.0.0:26501)
    #[arg(short, long)]
    listen: Option<String>,

    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Cluster members as id=url pairs (e.g. 1=http://10.0.0.1:26501,2=http://10.0.0.2:26501)
    #[arg(short, long, value_delimiter = ',')]
    members: Vec<String>,

    #[arg(long)]
    partitions: Option<u32>,

    #[arg(long)]
    replication_factor: Option<usize>,

    #[arg(long)]
    log_level: Option<String>,
}

fn parse_member(value: &str) -> Result<MemberConfig, String> {
    let (id, address) = value
        .split_once('=')
        .ok_or_else(|| format!("expected id=url, got '{}'", value))?;
    let node_id = id.trim().parse::<u64>().map_err(|e| format!("bad node id '{}': {}", id, e))?;
    Ok(MemberConfig {
        node_id,
        address: address.trim().to_string(),
    })
}

fn load_config(args: &Args) -> Result<BrokerConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => BrokerConfig::from_file(path)?,
        None => BrokerConfig::default(),
    };
    if let Some(node_id) = args.node_id {
        config = config.with_node_id(node_id);
    }
    if let Some(listen) = &args.listen {
        config = config.with_listen_address(listen.clone());
    }
    if let Some(data_dir) = &args.data_dir {
        config = config.with_data_dir(data_dir.clone());
    }
    if !args.members.is_empty() {
        let members = args
            .members
            .iter()
            .map(|m| parse_member(m))
            .collect::<Result<Vec<_>, _>>()?;
        config = config.with_members(members);
    }
    let partitions = args.partitions.unwrap_or(config.partition_count);
    let replication_factor = args.replication_factor.unwrap_or(config.replication_factor);
    config = config.with_partitions(partitions, replication_factor);
    if let Some(level) = &args.log_level {
        config = config.with_log_level(level);
    }
    config.validate()?;
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args)?;
    let logger = create_logger(&config.log_level);
    info!(logger, "Starting raftstream broker";
        "node_id" => config.node_id, "listen" => &config.listen_address,
        "data_dir" => config.data_dir.display());

    let scheduler = ActorScheduler::new(config.actor_threads, logger.clone())?;
    let result = scheduler.block_on(async {
        let sender = Arc::new(HttpMessageSender::new(logger.clone())?);
        let broker = Broker::start(config.clone(), &scheduler, sender, Arc::new(SystemClock), logger.clone()).await?;

        let server = HttpServer::new(broker.router(), broker.status_provider(), logger.clone());
        let listener = HttpServer::bind(&config.listen_address).await?;
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let serving = tokio::spawn(server.serve(listener, async move {
            let _ = stop_rx.await;
        }));

        info!(logger, "Press Ctrl+C to shutdown gracefully");
        signal::ctrl_c().await?;

        info!(logger, "Shutdown requested");
        broker.shutdown().await;
        let _ = stop_tx.send(());
        if let Ok(Err(e)) = serving.await {
            error!(logger, "Peer endpoint stopped with an error"; "error" => %e);
        }
        Ok::<(), Box<dyn std::error::Error>>(())
    });

    if let Err(e) = &result {
        error!(logger, "Broker failed"; "error" => %e);
    }
    result
}
