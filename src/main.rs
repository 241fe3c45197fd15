use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use beacon_satellite::config::{load_config_file, save_config_file};
use beacon_satellite::{Config, Satellite};

/// Beacon satellite - pairs with a voice assistant hub and keeps the session alive
#[derive(Parser)]
#[command(name = "satellite", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/omni/beacon/satellite.toml)
    #[arg(short, long, env = "SATELLITE_CONFIG")]
    config: Option<PathBuf>,

    /// Site name announced to the hub
    #[arg(long)]
    site_name: Option<String>,

    /// Remote bus host, normally learned during pairing
    #[arg(long)]
    mqtt_host: Option<String>,

    /// UDP port the hub broadcasts pairing announcements on
    #[arg(long)]
    broadcast_port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective configuration
    Show,
    /// Forget the hub pairing so the next start runs discovery again
    Unpair,
}

fn filter_for(verbose: u8) -> EnvFilter {
    EnvFilter::new(match verbose {
        0 => "info,beacon_satellite=info",
        1 => "info,beacon_satellite=debug",
        2 => "debug",
        _ => "trace",
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let loaded = load(&cli);

    // `debug = true` in the config file counts as one -v
    let verbose = match &loaded {
        Ok(config) if config.debug => cli.verbose.max(1),
        _ => cli.verbose,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(verbose))
        .init();

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(site) = &cli.site_name {
        config.device.site_name.clone_from(site);
    }
    if let Some(host) = &cli.mqtt_host {
        config.bus.host.clone_from(host);
    }
    if let Some(port) = cli.broadcast_port {
        config.pairing.broadcast_port = port;
    }

    Ok(config)
}

async fn run(command: Option<Command>, config: Config) -> anyhow::Result<()> {
    match command {
        Some(Command::Show) => {
            show(&config);
            Ok(())
        }
        Some(Command::Unpair) => unpair(&config),
        None => serve(config).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        config = %config.path.display(),
        site = %config.device.site_name,
        paired = config.identity().is_some(),
        "starting beacon satellite"
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    Satellite::new(config).run(shutdown).await?;
    tracing::info!("satellite stopped");
    Ok(())
}

fn show(config: &Config) {
    println!("config file:    {}", config.path.display());
    match config.identity() {
        Some(identity) => println!("identity:       {identity}"),
        None => println!("identity:       not paired"),
    }
    println!("type tag:       {}", config.device.type_tag);
    println!("discovery port: {}", config.pairing.broadcast_port);
    println!("remote bus:     {}:{}", config.bus.host, config.bus.port);
    println!(
        "local bus:      {}:{}",
        config.local_bus.host, config.local_bus.port
    );
}

fn unpair(config: &Config) -> anyhow::Result<()> {
    let mut file = load_config_file(&config.path);
    if file.device.uid.take().is_none() {
        tracing::info!("satellite is not paired, nothing to forget");
        return Ok(());
    }

    save_config_file(&config.path, &file)?;
    tracing::info!(path = %config.path.display(), "pairing forgotten");
    Ok(())
}
