use chrono::Utc;
use clap::{Parser, Subcommand};
use splitroute::apply::ApplyReport;
use splitroute::config::SYSTEM_CONFIG_PATH;
use splitroute::controller::{DeviceUpdate, NewDevice};
use splitroute::model::{DeviceMode, GroupPolicy, SubscriptionFormat};
use splitroute::{Config, Controller};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "splitroute")]
#[command(about = "Selective per-service and per-device VPN routing for home routers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: /etc/splitroute/config.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate default config file
    Init,
    /// Compile the current state and push it to firewall, resolver and client
    Apply,
    /// Probe all tunnels and update group selections
    Health,
    /// Import a share link (vless, vmess, ss, trojan, hysteria2)
    Import { link: String },
    /// Show the last apply and the current outbound
    Status,
    /// Manage services
    #[command(subcommand)]
    Service(ServiceCommand),
    /// Manage LAN devices
    #[command(subcommand)]
    Device(DeviceCommand),
    /// Manage tunnels
    #[command(subcommand)]
    Tunnel(TunnelCommand),
    /// Manage tunnel groups
    #[command(subcommand)]
    Group(GroupCommand),
    /// Manage per-service route overrides
    #[command(subcommand)]
    Route(RouteCommand),
    /// Manage subscriptions
    #[command(subcommand)]
    Subscription(SubscriptionCommand),
    /// Set the default outbound (tunnel or group); omit to clear
    Active { tag: Option<String> },
    /// Apply, then keep probing tunnels and refreshing subscriptions
    Daemon,
}

#[derive(Subcommand)]
enum ServiceCommand {
    List,
    Show { id: String },
    Enable { id: String },
    Disable { id: String },
    /// Add user domains to a service
    AddDomain { id: String, domains: Vec<String> },
    RemoveDomain { id: String, domains: Vec<String> },
    /// Add user addresses or CIDRs to a service
    AddIp { id: String, networks: Vec<String> },
    RemoveIp { id: String, networks: Vec<String> },
    /// Create a user-defined service
    Create {
        id: String,
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value = "custom")]
        category: String,
    },
    /// Delete a user-defined service
    Delete { id: String },
    /// Re-download the service's source lists
    Refresh { id: String },
}

#[derive(Subcommand)]
enum DeviceCommand {
    List,
    Add {
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long)]
        ip: Option<String>,
        #[arg(long)]
        mac: Option<String>,
        /// default, vpn_all, direct_all or custom
        #[arg(long, default_value = "default")]
        mode: DeviceMode,
        /// Services routed through the tunnel in custom mode
        #[arg(long, value_delimiter = ',')]
        services: Vec<String>,
    },
    Set {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        mode: Option<DeviceMode>,
        #[arg(long)]
        enabled: Option<bool>,
        #[arg(long, value_delimiter = ',')]
        services: Option<Vec<String>>,
    },
    Remove { id: String },
    /// Add devices from the DHCP lease file
    Discover,
}

#[derive(Subcommand)]
enum TunnelCommand {
    List,
    Enable { tag: String },
    Disable { tag: String },
    Remove { tag: String },
    /// Probe one tunnel without recording the result
    Probe { tag: String },
}

#[derive(Subcommand)]
enum GroupCommand {
    List,
    Create {
        tag: String,
        #[arg(required = true)]
        members: Vec<String>,
        /// Select members by hand instead of by latency
        #[arg(long)]
        manual: bool,
    },
    Select { tag: String, member: String },
    Remove { tag: String },
}

#[derive(Subcommand)]
enum RouteCommand {
    List,
    /// Route a service ("all" for vpn_all devices) through an outbound
    Set { service: String, outbound: String },
    Clear { service: String },
}

#[derive(Subcommand)]
enum SubscriptionCommand {
    List,
    Add {
        url: String,
        #[arg(long, default_value = "")]
        name: String,
        /// auto, base64, singbox, clash or links
        #[arg(long, default_value = "auto")]
        format: SubscriptionFormat,
    },
    Refresh { id: String },
    Remove { id: String },
}

fn print_report(report: &ApplyReport) {
    println!("Applied:");
    println!("  Networks: {}", report.networks);
    println!("  Domains: {}", report.domains);
    println!("  Device rules: {}", report.device_rules);
    if report.skipped_networks > 0 {
        println!("  Skipped networks: {}", report.skipped_networks);
    }
    for failure in &report.failures {
        println!("  Warning: {}", failure);
    }
}

async fn apply_with_progress(ctl: &Controller) -> Result<ApplyReport, splitroute::CoreError> {
    let mut progress = ctl.apply_progress();
    let watcher = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let p = *progress.borrow();
            debug!("Apply {:?} ({}/{})", p.phase, p.completed, p.total);
        }
    });
    let result = ctl.apply().await;
    watcher.abort();
    result
}

async fn run_daemon(ctl: &Controller) -> Result<(), Box<dyn std::error::Error>> {
    let interval = Duration::from_secs(ctl.config().health.interval_secs.max(10));
    let mut health = tokio::time::interval(interval);
    let mut subscriptions = tokio::time::interval(Duration::from_secs(3600));

    match ctl.apply().await {
        Ok(report) if !report.is_clean() => warn!("Initial apply: {:?}", report.failures),
        Ok(_) => info!("Initial apply done"),
        Err(e) => error!("Initial apply failed: {}", e),
    }

    info!("Daemon running, probing every {:?}", interval);
    loop {
        tokio::select! {
            _ = health.tick() => {
                match ctl.health_check().await {
                    Ok(report) if !report.changed_groups.is_empty() => {
                        info!("Group selection changed: {:?}", report.changed_groups);
                        if let Err(e) = ctl.apply().await {
                            error!("Apply failed: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => error!("Health check failed: {}", e),
                }
            }
            _ = subscriptions.tick() => {
                let results = ctl.refresh_stale_subscriptions(Utc::now()).await;
                if results.iter().any(|(_, r)| r.is_ok()) {
                    if let Err(e) = ctl.apply().await {
                        error!("Apply failed: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::Init = cli.command {
        info!("Generating default config...");
        let path = cli
            .config
            .unwrap_or_else(|| PathBuf::from(SYSTEM_CONFIG_PATH));
        Config::default().save(&path)?;
        println!("Created default config: {}", path.display());
        return Ok(());
    }

    let config = match cli.config.clone().or_else(Config::discover) {
        Some(path) => {
            debug!("Loading config from {}", path.display());
            Config::load(&path)?
        }
        None => Config::default(),
    };
    let ctl = Controller::open(Arc::new(config))?;

    match cli.command {
        Commands::Init => {}
        Commands::Apply => {
            let report = apply_with_progress(&ctl).await?;
            print_report(&report);
        }
        Commands::Health => {
            let report = ctl.health_check().await?;
            for (tag, latency) in &report.latencies {
                println!("  {:<24} {}", tag, latency);
            }
            for tag in &report.changed_groups {
                println!("Group {} changed selection", tag);
            }
            for tag in &report.degraded_groups {
                println!("Group {} has no reachable member", tag);
            }
        }
        Commands::Import { link } => {
            let tunnel = ctl.import_link(&link).await?;
            println!(
                "Imported {} ({} {}:{})",
                tunnel.tag,
                tunnel.kind(),
                tunnel.server,
                tunnel.port
            );
        }
        Commands::Status => {
            let state = ctl.snapshot().await;
            let status = &state.status;
            match status.last_applied_at {
                Some(at) => println!("Last apply: {}", at.to_rfc3339()),
                None => println!("Last apply: never"),
            }
            println!("  Networks: {}", status.networks);
            println!("  Domains: {}", status.domains);
            println!("  Device rules: {}", status.device_rules);
            for err in &status.errors {
                println!("  Warning: {}", err);
            }
            println!(
                "Active outbound: {}",
                state.routes.active.as_deref().unwrap_or("none")
            );
            let enabled = state.services.iter().filter(|s| s.enabled).count();
            println!("Services enabled: {}/{}", enabled, state.services.len());
            println!("Devices: {}", state.devices.len());
            println!("Tunnels: {}", state.tunnels.len());
        }
        Commands::Service(cmd) => match cmd {
            ServiceCommand::List => {
                for svc in ctl.services().await {
                    println!(
                        "  [{}] {:<16} {:<24} {} domains, {} networks",
                        if svc.enabled { "x" } else { " " },
                        svc.id,
                        svc.name,
                        svc.effective_domains().len(),
                        svc.routed_networks().len()
                    );
                }
            }
            ServiceCommand::Show { id } => {
                let svc = ctl.service(&id).await?;
                println!("{}", serde_json::to_string_pretty(&svc)?);
            }
            ServiceCommand::Enable { id } => ctl.set_service_enabled(&id, true).await?,
            ServiceCommand::Disable { id } => ctl.set_service_enabled(&id, false).await?,
            ServiceCommand::AddDomain { id, domains } => {
                ctl.add_custom_domains(&id, &domains).await?
            }
            ServiceCommand::RemoveDomain { id, domains } => {
                ctl.remove_custom_domains(&id, &domains).await?
            }
            ServiceCommand::AddIp { id, networks } => {
                ctl.add_custom_networks(&id, &networks).await?
            }
            ServiceCommand::RemoveIp { id, networks } => {
                ctl.remove_custom_networks(&id, &networks).await?
            }
            ServiceCommand::Create { id, name, category } => {
                let svc = ctl.create_service(&id, &name, &category).await?;
                println!("Created service {}", svc.id);
            }
            ServiceCommand::Delete { id } => ctl.delete_service(&id).await?,
            ServiceCommand::Refresh { id } => {
                let content = ctl.refresh_sources(&id).await?;
                println!(
                    "{}: {} domains, {} networks",
                    id,
                    content.domains.len(),
                    content.networks.len()
                );
            }
        },
        Commands::Device(cmd) => match cmd {
            DeviceCommand::List => {
                for d in ctl.devices().await {
                    println!(
                        "  [{}] {:<6} {:<20} {:<16} {:<18} {:?} {}",
                        if d.enabled { "x" } else { " " },
                        d.id,
                        d.name,
                        d.ip.map(|ip| ip.to_string()).unwrap_or_default(),
                        d.mac.unwrap_or_default(),
                        d.mode,
                        d.services.join(",")
                    );
                }
            }
            DeviceCommand::Add {
                name,
                ip,
                mac,
                mode,
                services,
            } => {
                let device = ctl
                    .add_device(NewDevice {
                        name,
                        ip,
                        mac,
                        mode,
                        services,
                    })
                    .await?;
                println!("Added device {}", device.id);
            }
            DeviceCommand::Set {
                id,
                name,
                mode,
                enabled,
                services,
            } => {
                ctl.update_device(
                    &id,
                    DeviceUpdate {
                        name,
                        mode,
                        enabled,
                        services,
                    },
                )
                .await?;
            }
            DeviceCommand::Remove { id } => ctl.delete_device(&id).await?,
            DeviceCommand::Discover => {
                let found = ctl.discover_devices().await?;
                println!(
                    "Discovered {} new devices, updated {}",
                    found.added.len(),
                    found.updated.len()
                );
            }
        },
        Commands::Tunnel(cmd) => match cmd {
            TunnelCommand::List => {
                for t in ctl.tunnels().await {
                    println!(
                        "  [{}] {:<24} {:<12} {}:{} {}",
                        if t.enabled { "x" } else { " " },
                        t.tag,
                        t.kind(),
                        t.server,
                        t.port,
                        t.latency
                    );
                }
            }
            TunnelCommand::Enable { tag } => ctl.set_tunnel_enabled(&tag, true).await?,
            TunnelCommand::Disable { tag } => ctl.set_tunnel_enabled(&tag, false).await?,
            TunnelCommand::Remove { tag } => ctl.delete_tunnel(&tag).await?,
            TunnelCommand::Probe { tag } => {
                let latency = ctl.probe_tunnel(&tag).await?;
                println!("{}: {}", tag, latency);
            }
        },
        Commands::Group(cmd) => match cmd {
            GroupCommand::List => {
                for g in ctl.groups().await {
                    println!(
                        "  {:<16} {:?} -> {}{} [{}]",
                        g.tag,
                        g.policy,
                        g.selected.as_deref().unwrap_or("-"),
                        if g.degraded { " (degraded)" } else { "" },
                        g.members.join(",")
                    );
                }
            }
            GroupCommand::Create {
                tag,
                members,
                manual,
            } => {
                let policy = if manual {
                    GroupPolicy::Manual
                } else {
                    GroupPolicy::Auto
                };
                ctl.create_group(&tag, members, policy).await?;
            }
            GroupCommand::Select { tag, member } => {
                ctl.select_group_member(&tag, &member).await?
            }
            GroupCommand::Remove { tag } => ctl.delete_group(&tag).await?,
        },
        Commands::Route(cmd) => match cmd {
            RouteCommand::List => {
                let routes = ctl.routes().await;
                println!("  default -> {}", routes.active.as_deref().unwrap_or("none"));
                for (service, outbound) in &routes.overrides {
                    println!("  {} -> {}", service, outbound);
                }
            }
            RouteCommand::Set { service, outbound } => ctl.set_route(&service, &outbound).await?,
            RouteCommand::Clear { service } => ctl.clear_route(&service).await?,
        },
        Commands::Subscription(cmd) => match cmd {
            SubscriptionCommand::List => {
                for s in ctl.subscriptions().await {
                    println!(
                        "  {:<4} {:<20} {} nodes, updated {}  {}",
                        s.id,
                        s.name,
                        s.node_count,
                        s.last_updated
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_else(|| "never".to_string()),
                        s.url
                    );
                }
            }
            SubscriptionCommand::Add { url, name, format } => {
                let sub = ctl.add_subscription(&name, &url, format).await?;
                println!("Added subscription {} ({} nodes)", sub.id, sub.node_count);
            }
            SubscriptionCommand::Refresh { id } => {
                let sub = ctl.refresh_subscription(&id).await?;
                println!("Refreshed {} ({} nodes)", sub.id, sub.node_count);
            }
            SubscriptionCommand::Remove { id } => ctl.delete_subscription(&id).await?,
        },
        Commands::Active { tag } => ctl.set_active(tag.as_deref()).await?,
        Commands::Daemon => run_daemon(&ctl).await?,
    }

    Ok(())
}
