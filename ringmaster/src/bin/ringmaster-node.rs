use clap::Parser;
use ringmaster::cluster::{Node, NodeConfig};
use ringmaster::core::UdpTransport;
use ringmaster::testkit::{init_logging, LogLevel};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Runs one ringmaster node over UDP until interrupted.
#[derive(Parser, Debug)]
#[command(name = "ringmaster-node", version, about)]
struct Args {
  /// Name other nodes reach this one by. Overrides the config file.
  #[arg(long)]
  hostname: Option<String>,

  /// Found a new group instead of joining one.
  #[arg(long)]
  first: bool,

  /// Host of a group member to join through.
  #[arg(long, conflicts_with = "first")]
  join: Option<String>,

  #[arg(long)]
  membership_port: Option<u16>,

  #[arg(long)]
  election_port: Option<u16>,

  /// JSON file with a `NodeConfig`. Missing fields take their defaults.
  #[arg(long)]
  config: Option<PathBuf>,

  /// trace, debug, info, warn, error or off. `RUST_LOG` takes precedence.
  #[arg(long, default_value = "info")]
  log_level: LogLevel,

  /// Seconds between status reports.
  #[arg(long, default_value_t = 5)]
  report_every: u64,
}

fn load_config(args: &Args) -> ringmaster::Result<NodeConfig> {
  let mut config = match &args.config {
    Some(path) => NodeConfig::from_json_file(path)?,
    None => NodeConfig::default(),
  };
  if let Some(hostname) = &args.hostname {
    config.hostname = hostname.clone();
  }
  config.first_node |= args.first;
  if let Some(port) = args.membership_port {
    config.membership_port = port;
  }
  if let Some(port) = args.election_port {
    config.election_port = port;
  }
  Ok(config)
}

async fn run(args: Args) -> ringmaster::Result<()> {
  let config = load_config(&args)?;
  let transport = Arc::new(UdpTransport::new(config.hostname.clone()));
  let node = Node::new(config, transport)?;
  node.start().await?;
  if let Some(seed) = &args.join {
    node.join(seed).await?;
  }
  info!(id = node.id(), "node running, ctrl-c to leave");

  let mut report = tokio::time::interval(Duration::from_secs(args.report_every.max(1)));
  loop {
    tokio::select! {
      res = tokio::signal::ctrl_c() => {
        res?;
        break;
      }
      _ = report.tick() => {
        let members = node.members().iter().map(|m| format!("{}@{}", m.id, m.hostname)).collect::<Vec<_>>();
        match node.master() {
          Some(master) => info!(id = node.id(), master = master.id, ?members, "status"),
          None => info!(id = node.id(), phase = ?node.election().phase(), ?members, "status, no master"),
        }
      }
    }
  }

  node.leave();
  // Give the departure a few gossip rounds to spread.
  let rounds = node.config().detector.redundancy as u32 + 1;
  tokio::time::sleep(node.config().detector.gossip_interval * rounds).await;
  node.stop().await;
  Ok(())
}

#[tokio::main]
async fn main() {
  let args = Args::parse();
  init_logging(args.log_level);
  if let Err(e) = run(args).await {
    error!(error = %e, "node failed");
    std::process::exit(1);
  }
}
