mod server;
mod shared;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use signal_hook::consts::SIGHUP;
use signal_hook_tokio::Signals;
use tokio::sync::Mutex;
use tokio_stream::StreamExt;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dhcp6_core::dispatch::unix_now;
use dhcp6_core::hooks::TracingHooks;
use dhcp6_core::leasefile::JsonLeaseFile;
use dhcp6_core::{Config, Dhcp6Server};

use crate::shared::{ServerState, SharedState};

fn config_path() -> PathBuf {
    PathBuf::from(std::env::var("DHCP6D_CONFIG_PATH").unwrap_or_else(|_| "/etc/dhcp6d/dhcp6d.json".to_string()))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dhcp6d=info,dhcp6_core=info"));
    let json = std::env::var("DHCP6D_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Config::load_from_file(path).with_context(|| format!("Failed to load config from {}", path.display()))
    } else {
        info!("No config file found at {}, using defaults", path.display());
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    info!("dhcp6d starting...");

    let path = config_path();
    let config = load_config(&path)?;
    info!(
        "Config loaded: {} interfaces, {} shared networks, {} hosts",
        config.server.interfaces.len(),
        config.shared_networks.len(),
        config.hosts.len()
    );

    let (lease_file, loaded) = JsonLeaseFile::open(Path::new(&config.server.lease_file), config.server.commit_interval_secs)?;
    let server = Dhcp6Server::new(&config, loaded, Box::new(lease_file), Box::new(TracingHooks))?;

    let state: SharedState = Arc::new(Mutex::new(ServerState {
        config: config.clone(),
        server,
    }));

    // SIGHUP reload
    let state_clone = state.clone();
    tokio::spawn(async move {
        if let Err(e) = handle_sighup(state_clone).await {
            error!("SIGHUP handler error: {}", e);
        }
    });

    if config.server.interfaces.is_empty() && config.server.unicast_address.is_none() {
        warn!("No interfaces configured, nothing to listen on");
    }
    for interface in &config.server.interfaces {
        let socket = server::bind_interface(interface)?;
        let state_clone = state.clone();
        let interface = interface.clone();
        tokio::spawn(async move {
            if let Err(e) = server::run_listener(socket, interface.clone(), false, state_clone).await {
                error!("DHCPv6 listener on {} failed: {}", interface, e);
            }
        });
    }
    if let Some(address) = config.server.unicast_address {
        let socket = server::bind_unicast(address)?;
        let state_clone = state.clone();
        tokio::spawn(async move {
            if let Err(e) = server::run_listener(socket, String::new(), true, state_clone).await {
                error!("DHCPv6 unicast listener failed: {}", e);
            }
        });
    }

    // Expiry sweep
    {
        let state_clone = state.clone();
        let period = Duration::from_secs(config.server.expiry_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let mut s = state_clone.lock().await;
                let expired = s.server.expire_leases(unix_now());
                if expired > 0 {
                    info!("Expired {} bindings", expired);
                }
            }
        });
    }

    // Timed lease file commit
    {
        let state_clone = state.clone();
        let period = Duration::from_secs(config.server.commit_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let mut s = state_clone.lock().await;
                if let Err(e) = s.server.commit(false) {
                    warn!("Failed to commit lease file: {:#}", e);
                }
            }
        });
    }

    info!("dhcp6d started successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    {
        let mut s = state.lock().await;
        if let Err(e) = s.server.commit(true) {
            error!("Failed to save leases on shutdown: {:#}", e);
        } else {
            info!("Leases saved successfully");
        }
    }

    Ok(())
}

async fn handle_sighup(state: SharedState) -> Result<()> {
    let mut signals = Signals::new([SIGHUP])?;

    while let Some(signal) = signals.next().await {
        if signal == SIGHUP {
            info!("Received SIGHUP, reloading config...");

            let path = config_path();
            match Config::load_from_file(&path) {
                Ok(new_config) => {
                    let mut s = state.lock().await;
                    if new_config.server.interfaces != s.config.server.interfaces
                        || new_config.server.unicast_address != s.config.server.unicast_address
                    {
                        warn!("Listening sockets changed in {}, restart to apply", path.display());
                    }
                    match s.server.reload(&new_config) {
                        Ok(()) => s.config = new_config,
                        Err(e) => error!("Failed to apply config: {:#}", e),
                    }
                }
                Err(e) => {
                    error!("Failed to reload config: {:#}", e);
                }
            }
        }
    }

    Ok(())
}
