//! l2link - L2TPv3 tunnel management
//!
//! Manages tunnel records, brings tunnels up through iproute2 and forwards
//! TCP ports across them. Commands talk to the running daemon when its socket
//! is reachable and otherwise operate on local state directly.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use ipnetwork::Ipv4Network;
use l2link_daemon::{
    Daemon, DaemonCommand, HostStatus, IpcClient, IpcRequest, IpcResponse, L2linkConfig,
    LifecycleOutcome, Manager, DEFAULT_CONFIG_DIR,
};
use l2link_lifecycle::{IpRouteControl, LifecycleController, Modprobe};
use l2link_proto::{parse_port_list, Side, TunnelCandidate, TunnelIds, TunnelRecord};
use l2link_registry::{FileStore, TunnelRegistry};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::prelude::*;

/// l2link - point-to-point L2TPv3 tunnels with TCP port forwarding
#[derive(Parser, Debug)]
#[command(name = "l2link")]
#[command(about = "Manage L2TPv3 tunnels and forward TCP ports across them", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding config.json
    #[arg(long, global = true, env = "L2LINK_CONFIG_DIR", default_value = DEFAULT_CONFIG_DIR)]
    config_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a new tunnel
    #[command(long_about = r#"
Register a new tunnel. The link subnet, the L2TP identifiers and the
interface slot are allocated automatically unless given explicitly.

EXAMPLES:
  # Side A of a tunnel forwarding 443 and 8443
  l2link create edge --side a --local-ip 203.0.113.10 \
    --remote-ip 198.51.100.20 --ports 443,8443

  # The matching side B on the other host
  l2link create edge --side b --local-ip 198.51.100.20 \
    --remote-ip 203.0.113.10
    "#)]
    Create(CreateArgs),

    /// Change an existing tunnel; omitted options keep their current values
    Update(UpdateArgs),

    /// Tear down a tunnel and remove its record
    Delete {
        name: String,

        /// Remove the record even if kernel teardown fails
        #[arg(long)]
        force: bool,
    },

    /// List registered tunnels
    List,

    /// Show one tunnel record as JSON
    Show { name: String },

    /// Manage forwarded ports
    Ports {
        #[command(subcommand)]
        command: PortsCommands,
    },

    /// Bring one tunnel (default: all) up in the kernel
    Apply { name: Option<String> },

    /// Remove kernel objects of one tunnel (default: all)
    Teardown { name: Option<String> },

    /// Recompute forwarding listeners in the running daemon
    Reconcile,

    /// Run the forwarding daemon in the foreground
    Daemon,

    /// Show tunnels, kernel state and listeners
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum PortsCommands {
    /// Add ports, e.g. `l2link ports add edge 80,443`
    Add { name: String, ports: String },
    /// Remove ports
    Remove { name: String, ports: String },
}

#[derive(Args, Debug)]
struct CreateArgs {
    name: String,

    /// Which endpoint this host is (a or b)
    #[arg(long)]
    side: Side,

    /// This host's public address
    #[arg(long)]
    local_ip: Ipv4Addr,

    /// The peer's public address
    #[arg(long)]
    remote_ip: Ipv4Addr,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Args, Debug)]
struct UpdateArgs {
    name: String,

    #[arg(long)]
    side: Option<Side>,

    #[arg(long)]
    local_ip: Option<Ipv4Addr>,

    #[arg(long)]
    remote_ip: Option<Ipv4Addr>,

    #[command(flatten)]
    overrides: Overrides,
}

/// Explicit values for normally allocated fields
#[derive(Args, Debug)]
struct Overrides {
    /// Interface address with /30 prefix, e.g. 10.30.0.1/30
    #[arg(long)]
    interface_ip: Option<Ipv4Network>,

    /// Address forwarded connections are sent to
    #[arg(long)]
    remote_forward_ip: Option<Ipv4Addr>,

    /// All four identifiers as tunnel,peer_tunnel,session,peer_session
    #[arg(long, value_parser = parse_ids)]
    ids: Option<TunnelIds>,

    #[arg(long)]
    interface_index: Option<u32>,

    /// Comma-separated port list, e.g. 443,8443
    #[arg(long)]
    ports: Option<String>,
}

fn parse_ids(input: &str) -> Result<TunnelIds, String> {
    let values: Vec<u32> = input
        .split(',')
        .map(|v| v.trim().parse::<u32>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("invalid identifier: {}", e))?;
    match values.as_slice() {
        [tunnel_id, peer_tunnel_id, session_id, peer_session_id] => Ok(TunnelIds {
            tunnel_id: *tunnel_id,
            peer_tunnel_id: *peer_tunnel_id,
            session_id: *session_id,
            peer_session_id: *peer_session_id,
        }),
        _ => Err("expected four comma-separated identifiers".to_string()),
    }
}

/// Where requests are answered: the running daemon or this process
enum Session {
    Daemon(IpcClient),
    Local(Manager),
}

impl Session {
    async fn open(config: &L2linkConfig) -> Result<Self> {
        match IpcClient::connect_to(&config.socket_path).await {
            Ok(client) => {
                debug!("Connected to daemon at {:?}", config.socket_path);
                Ok(Session::Daemon(client))
            }
            Err(e) => {
                debug!("Daemon not reachable ({:#}), running locally", e);
                Ok(Session::Local(local_manager(config)?))
            }
        }
    }

    async fn request(&mut self, request: IpcRequest) -> Result<IpcResponse> {
        match self {
            Session::Daemon(client) => client.request(&request).await,
            Session::Local(manager) => Ok(manager.handle(request).await),
        }
    }
}

fn local_manager(config: &L2linkConfig) -> Result<Manager> {
    let store = FileStore::open(config.tunnels_dir())
        .with_context(|| format!("Failed to open tunnel store {:?}", config.tunnels_dir()))?;
    let registry = TunnelRegistry::open(config.address_pool()?, Arc::new(store))
        .context("Failed to load tunnel registry")?;
    let controller = LifecycleController::new(Arc::new(IpRouteControl::new()?), Arc::new(Modprobe));
    Ok(Manager::new(Arc::new(registry), Arc::new(controller)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = L2linkConfig::load(&cli.config_dir)?;

    match cli.command {
        Commands::Daemon => run_daemon(config).await,
        command => {
            let mut session = Session::open(&config).await?;
            run_command(&mut session, command).await
        }
    }
}

async fn run_daemon(config: L2linkConfig) -> Result<()> {
    info!("Starting daemon...");

    let control = IpRouteControl::new()?;
    let daemon = Daemon::new(config, Arc::new(control), Arc::new(Modprobe))?;
    let (command_tx, command_rx) = tokio::sync::mpsc::channel(32);

    let signal_tx = command_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal_tx.send(DaemonCommand::Shutdown).await.ok();
    });

    daemon.run(command_tx, command_rx).await
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
                _ = terminate.recv() => info!("Received SIGTERM"),
            }
        }
        Err(_) => {
            tokio::signal::ctrl_c().await.ok();
            info!("Received Ctrl+C");
        }
    }
}

async fn run_command(session: &mut Session, command: Commands) -> Result<()> {
    match command {
        Commands::Create(args) => {
            let candidate = TunnelCandidate::new(args.name, args.side, args.local_ip, args.remote_ip);
            let candidate = apply_overrides(candidate, &args.overrides, Vec::new())?;
            let record = expect_tunnel(
                session
                    .request(IpcRequest::CreateTunnel { candidate })
                    .await?,
            )?;
            println!("✅ Tunnel '{}' created", record.name);
            print_record(&record);
            println!();
            println!("Configure the peer with:");
            println!("  {}", peer_command(&record));
            Ok(())
        }

        Commands::Update(args) => {
            let current = expect_tunnel(
                session
                    .request(IpcRequest::GetTunnel {
                        name: args.name.clone(),
                    })
                    .await?,
            )?;
            let candidate = update_candidate(&current, &args)?;
            let record = expect_tunnel(
                session
                    .request(IpcRequest::UpdateTunnel {
                        name: args.name,
                        candidate,
                    })
                    .await?,
            )?;
            println!("✅ Tunnel '{}' updated", record.name);
            print_record(&record);
            Ok(())
        }

        Commands::Delete { name, force } => {
            match session
                .request(IpcRequest::DeleteTunnel { name, force })
                .await?
            {
                IpcResponse::Ok { message } => {
                    println!("✅ {}", message.unwrap_or_else(|| "Deleted".to_string()));
                    Ok(())
                }
                other => Err(unexpected(other)),
            }
        }

        Commands::List => match session.request(IpcRequest::ListTunnels).await? {
            IpcResponse::Tunnels { records } => {
                if records.is_empty() {
                    println!("No tunnels configured");
                    println!("Add a tunnel with: l2link create <name> --side <a|b> --local-ip <ip> --remote-ip <ip>");
                    return Ok(());
                }
                println!("Configured tunnels ({})", records.len());
                println!();
                for record in &records {
                    print_record(record);
                    println!();
                }
                Ok(())
            }
            other => Err(unexpected(other)),
        },

        Commands::Show { name } => {
            let record = expect_tunnel(session.request(IpcRequest::GetTunnel { name }).await?)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }

        Commands::Ports { command } => {
            let request = match command {
                PortsCommands::Add { name, ports } => IpcRequest::AddPorts {
                    name,
                    ports: parse_port_list(&ports)?,
                },
                PortsCommands::Remove { name, ports } => IpcRequest::RemovePorts {
                    name,
                    ports: parse_port_list(&ports)?,
                },
            };
            let record = expect_tunnel(session.request(request).await?)?;
            println!(
                "✅ Tunnel '{}' forwards: {}",
                record.name,
                format_ports(&record.forwarded_ports)
            );
            Ok(())
        }

        Commands::Apply { name } => {
            let response = session.request(IpcRequest::Apply { name }).await?;
            print_outcomes("apply", response)
        }

        Commands::Teardown { name } => {
            let response = session.request(IpcRequest::Teardown { name }).await?;
            print_outcomes("teardown", response)
        }

        Commands::Reconcile => match session.request(IpcRequest::Reconcile).await? {
            IpcResponse::Reconciled { report } => {
                println!(
                    "Listeners: {} started, {} stopped, {} unchanged",
                    report.started.len(),
                    report.stopped.len(),
                    report.unchanged.len()
                );
                for failure in &report.failures {
                    println!(
                        "  ❌ {} -> {}: {} ({})",
                        failure.key, failure.target, failure.reason, failure.kind
                    );
                }
                if !report.failures.is_empty() {
                    bail!("{} listener(s) failed", report.failures.len());
                }
                Ok(())
            }
            other => Err(unexpected(other)),
        },

        Commands::Status { json } => match session.request(IpcRequest::Status).await? {
            IpcResponse::Status { status } => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&status)?);
                } else {
                    print_status(&status);
                }
                Ok(())
            }
            other => Err(unexpected(other)),
        },

        Commands::Daemon => bail!("The daemon cannot be started through another daemon"),
    }
}

fn apply_overrides(
    mut candidate: TunnelCandidate,
    overrides: &Overrides,
    current_ports: Vec<u16>,
) -> Result<TunnelCandidate> {
    candidate.interface_ip = overrides.interface_ip;
    candidate.remote_forward_ip = overrides.remote_forward_ip;
    candidate.ids = overrides.ids;
    candidate.interface_index = overrides.interface_index;
    candidate.forwarded_ports = match &overrides.ports {
        Some(ports) => parse_port_list(ports)?,
        None => current_ports,
    };
    Ok(candidate)
}

/// Start from the current record; fields derived from the side are left to
/// the registry when the side changes
fn update_candidate(current: &TunnelRecord, args: &UpdateArgs) -> Result<TunnelCandidate> {
    let side = args.side.unwrap_or(current.side);
    let candidate = TunnelCandidate::new(
        current.name.clone(),
        side,
        args.local_ip.unwrap_or(current.local_public_ip),
        args.remote_ip.unwrap_or(current.remote_public_ip),
    );
    let mut candidate = apply_overrides(candidate, &args.overrides, current.forwarded_ports.clone())?;

    if side == current.side {
        if candidate.interface_ip.is_none() {
            candidate.interface_ip = Some(current.interface_ip);
        }
        if candidate.remote_forward_ip.is_none() && args.overrides.interface_ip.is_none() {
            candidate.remote_forward_ip = Some(current.remote_forward_ip);
        }
    }
    Ok(candidate)
}

/// The `create` invocation for the other endpoint
fn peer_command(record: &TunnelRecord) -> String {
    let peer_side = record.side.peer();
    let peer_ip = Ipv4Network::new(record.remote_forward_ip, record.interface_ip.prefix())
        .map(|n| n.to_string())
        .unwrap_or_else(|_| record.remote_forward_ip.to_string());
    let ids = record.ids().mirrored();
    format!(
        "l2link create {} --side {} --local-ip {} --remote-ip {} --interface-ip {} --ids {},{},{},{}",
        record.name,
        peer_side,
        record.remote_public_ip,
        record.local_public_ip,
        peer_ip,
        ids.tunnel_id,
        ids.peer_tunnel_id,
        ids.session_id,
        ids.peer_session_id
    )
}

fn expect_tunnel(response: IpcResponse) -> Result<TunnelRecord> {
    match response {
        IpcResponse::Tunnel { record } => Ok(record),
        other => Err(unexpected(other)),
    }
}

fn unexpected(response: IpcResponse) -> anyhow::Error {
    match response {
        IpcResponse::Error { kind, message } => anyhow::anyhow!("{} ({})", message, kind),
        other => anyhow::anyhow!("Unexpected response: {:?}", other),
    }
}

fn print_outcomes(operation: &str, response: IpcResponse) -> Result<()> {
    let results: Vec<LifecycleOutcome> = match response {
        IpcResponse::Lifecycle { results } => results,
        other => return Err(unexpected(other)),
    };
    if results.is_empty() {
        println!("No tunnels configured");
        return Ok(());
    }

    let mut failed = 0;
    for outcome in &results {
        match (&outcome.state, &outcome.error) {
            (Some(state), _) => println!("  ✅ {}: {}", outcome.name, state),
            (None, Some(error)) => {
                failed += 1;
                println!("  ❌ {}: {}", outcome.name, error);
            }
            (None, None) => println!("  {}: unknown", outcome.name),
        }
    }
    if failed > 0 {
        bail!("{} of {} tunnel(s) failed to {}", failed, results.len(), operation);
    }
    Ok(())
}

fn print_record(record: &TunnelRecord) {
    println!("  {} (side {})", record.name, record.side);
    println!(
        "    Public:    {} -> {}",
        record.local_public_ip, record.remote_public_ip
    );
    println!(
        "    Interface: {} {} (peer {})",
        record.interface_name(),
        record.interface_ip,
        record.remote_forward_ip
    );
    println!(
        "    L2TP:      tunnel {}/{} session {}/{}",
        record.tunnel_id, record.peer_tunnel_id, record.session_id, record.peer_session_id
    );
    println!("    Ports:     {}", format_ports(&record.forwarded_ports));
}

fn print_status(status: &HostStatus) {
    println!(
        "Daemon: {}",
        if status.daemon_running {
            "running"
        } else {
            "not running"
        }
    );
    println!();

    if status.tunnels.is_empty() {
        println!("No tunnels configured");
    }
    for tunnel in &status.tunnels {
        let kernel = match (&tunnel.kernel_state, &tunnel.kernel_error) {
            (Some(state), _) => state.to_string(),
            (None, Some(error)) => format!("error: {}", error),
            (None, None) => "unknown".to_string(),
        };
        println!("  {} (side {}) [{}]", tunnel.name, tunnel.side, kernel);
        println!(
            "    Interface: {} {} -> {}",
            tunnel.interface, tunnel.interface_ip, tunnel.remote_forward_ip
        );
        if tunnel.listeners.is_empty() {
            println!("    Ports:     {}", format_ports(&tunnel.forwarded_ports));
        }
        for listener in &tunnel.listeners {
            match &listener.error {
                None => println!(
                    "    :{} -> {} listening ({} active, {} total, {} B out / {} B back)",
                    listener.port,
                    listener.target,
                    listener.stats.active_connections,
                    listener.stats.total_connections,
                    listener.stats.bytes_to_remote,
                    listener.stats.bytes_to_client
                ),
                Some(error) => println!(
                    "    :{} -> {} failed: {}",
                    listener.port, listener.target, error
                ),
            }
        }
        println!();
    }

    for skipped in &status.skipped {
        println!("  ⚠️  Skipped {}: {}", skipped.source, skipped.reason);
    }
}

fn format_ports(ports: &[u16]) -> String {
    if ports.is_empty() {
        return "none".to_string();
    }
    ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
