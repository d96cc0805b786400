mod config;
mod dbus;
mod diagnostics;

use anyhow::{Context, Result};
use chrono::DateTime;
use clap::Parser;
use cosmic_ext_connect_protocol::{
    get_or_create_identity, DeviceManager, Exporter, FileStorage, LanServiceFactory,
    ManagerHandle, Storage,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use config::Config;
use dbus::{DbusServer, ManagerInterface};
use diagnostics::{init_logging, Cli, Command};

/// Channel services compiled into the daemon
const KNOWN_SERVICES: &[&str] = &["lan"];

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path).context("Failed to load configuration")?;

    match cli.command.clone().unwrap_or(Command::Run) {
        Command::Run => run(config, config_path).await,
        Command::Identity => show_identity(&config).await,
        Command::ListDevices { json } => list_devices(&config, json).await,
        Command::DumpConfig => {
            let contents =
                toml::to_string_pretty(&config).context("Failed to serialize config")?;
            println!("# {}", config_path.display());
            print!("{}", contents);
            Ok(())
        }
    }
}

async fn run(config: Config, config_path: PathBuf) -> Result<()> {
    config
        .ensure_directories()
        .context("Failed to create directories")?;

    let storage = Arc::new(open_storage(&config));
    let mut manager = DeviceManager::new(storage, config.manager_config(KNOWN_SERVICES))
        .await
        .context("Failed to create device manager")?;
    manager.register_service(Arc::new(LanServiceFactory::new(config.lan_config())));

    for name in config.unknown_services(&manager.service_names()) {
        warn!("Ignoring unknown channel service '{}' in configuration", name);
    }

    info!("Configuration loaded from {}", config_path.display());
    info!(
        "Device: {} ({})",
        manager.local_info().device_name,
        manager.id()
    );
    info!("Type: {}", manager.local_info().device_type);

    manager.start().await;
    manager
        .identify(None)
        .await
        .context("Failed to announce the local device")?;

    let handle = manager.handle();
    let dbus_enabled = config.dbus.enabled;
    let base = config.dbus.object_path.clone();
    let shared = Arc::new(RwLock::new(config));

    let export = if dbus_enabled {
        let interface =
            ManagerInterface::new(manager.id(), handle.clone(), shared.clone(), config_path.clone());
        match DbusServer::start(&base, interface).await {
            Ok(server) => {
                let backend = Arc::new(server.backend(handle.clone()));
                let exporter = Exporter::export(&mut manager, server.base(), backend).await;
                Some((server, exporter))
            }
            Err(e) => {
                error!("DBus unavailable, running without IPC: {:#}", e);
                None
            }
        }
    } else {
        info!("DBus export disabled");
        None
    };

    let reload = tokio::spawn(reload_on_hangup(
        config_path,
        shared,
        handle,
        manager.service_names(),
    ));

    info!("Daemon initialized successfully");
    manager.run(shutdown_signal()).await;
    reload.abort();

    if let Some((server, exporter)) = export {
        exporter.unexport().await;
        drop(server);
    }

    info!("Daemon shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
}

/// Re-read the configuration on SIGHUP and apply the service flags
async fn reload_on_hangup(
    path: PathBuf,
    config: Arc<RwLock<Config>>,
    handle: ManagerHandle,
    services: Vec<String>,
) {
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("Cannot listen for SIGHUP, configuration reload disabled: {}", e);
            return;
        }
    };

    while hangup.recv().await.is_some() {
        info!("SIGHUP received, reloading {}", path.display());
        let fresh = match Config::load(&path) {
            Ok(fresh) => fresh,
            Err(e) => {
                error!("Keeping current configuration: {:#}", e);
                continue;
            }
        };

        for name in fresh.unknown_services(&services) {
            warn!("Ignoring unknown channel service '{}' in configuration", name);
        }
        for name in &services {
            let enabled = fresh.is_service_enabled(name);
            if let Err(e) = handle.set_service_enabled(name, enabled).await {
                warn!("Failed to apply '{}' = {}: {}", name, enabled, e);
            }
        }

        *config.write().await = fresh;
    }
}

fn open_storage(config: &Config) -> FileStorage {
    FileStorage::new(config.paths.data_dir.clone())
}

async fn show_identity(config: &Config) -> Result<()> {
    let storage = open_storage(config);
    let identity = get_or_create_identity(&storage)
        .await
        .context("Failed to load identity")?;

    println!("Device ID:   {}", identity.device_id());
    println!("Fingerprint: {}", identity.fingerprint());
    println!("Storage:     {}", storage.root().display());
    Ok(())
}

async fn list_devices(config: &Config, json: bool) -> Result<()> {
    let storage = open_storage(config);
    let records = storage
        .load_all_devices()
        .await
        .context("Failed to load device records")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&records).context("Failed to serialize records")?
        );
        return Ok(());
    }

    if records.is_empty() {
        println!("No devices");
        return Ok(());
    }

    for record in records {
        let last_seen = DateTime::from_timestamp(record.last_seen, 0)
            .filter(|_| record.last_seen > 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{}  {:<24} {:<8} {:<8} last seen {}",
            record.id,
            record.name,
            record.device_type.as_str(),
            if record.paired { "paired" } else { "unpaired" },
            last_seen
        );
    }
    Ok(())
}
