//! Service wiring: spawns every long-running task of the node.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use eyre::WrapErr;
use tokio::select;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::advertiser::Advertiser;
use crate::i2p::controller::I2pController;
use crate::i2p::listener::I2pListener;
use crate::listener::Listener;
use crate::manager::Manager;
use crate::state::{I2pSession, State};
use crate::unix_now;

/// The limit of time to wait for tasks to finish on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Node {
    state: Arc<State>,
    tracker: TaskTracker,
}

impl Node {
    pub fn new(state: Arc<State>) -> Self {
        Self {
            state,
            tracker: TaskTracker::new(),
        }
    }

    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    /// Spawn listeners, manager, advertiser and the I2P stack.
    pub async fn run(&self) -> eyre::Result<()> {
        let state = &self.state;

        // The snapshot may have been written long ago.
        state.objects.remove_expired(unix_now());

        if state.config.i2p_enabled {
            self.start_i2p().await?;
        }

        if state.config.listen_for_connections && state.config.ip_enabled {
            self.start_listeners()?;
        }

        self.tracker.spawn(Manager::new(state.clone()).run());
        self.tracker.spawn(Advertiser::new(state.clone()).run());
        self.tracker.close();
        Ok(())
    }

    fn start_listeners(&self) -> eyre::Result<()> {
        let state = &self.state;
        let port = state.config.listen_port;

        if let Some(host) = state.config.listen_host {
            let listener = Listener::bind(state.clone(), host, port)
                .wrap_err_with(|| format!("failed to listen on {}:{}", host, port))?;
            self.tracker.spawn(listener.run());
            return Ok(());
        }

        let v6 = Listener::bind(state.clone(), IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
        let v6_up = v6.is_ok();
        match v6 {
            Ok(listener) => {
                self.tracker.spawn(listener.run());
            }
            Err(err) => {
                warn!("Error while starting IPv6 listener on port {}: {}", port, err);
            }
        }
        match Listener::bind(state.clone(), IpAddr::V4(Ipv4Addr::UNSPECIFIED), port) {
            Ok(listener) => {
                self.tracker.spawn(listener.run());
            }
            Err(err) if v6_up => {
                warn!(
                    "Error while starting IPv4 listener on port {}. \
                     However the IPv6 one seems to be working and will \
                     probably accept IPv4 connections: {}",
                    port, err
                );
            }
            Err(err) => {
                error!(
                    "Error while starting IPv4 listener on port {}. You will \
                     not receive incoming connections. Please check your port \
                     configuration: {}",
                    port, err
                );
            }
        }
        Ok(())
    }

    async fn start_i2p(&self) -> eyre::Result<()> {
        let state = &self.state;
        let key_path = state.config.data_dir.join("i2p_dest_priv.key");

        let dest_priv = if state.config.i2p_transient {
            None
        } else {
            std::fs::read_to_string(&key_path)
                .ok()
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty())
        };

        info!("Starting I2P Controller and creating tunnels. This may take a while.");
        let controller = I2pController::start(state.clone(), dest_priv).await?;

        state.set_i2p_session(I2pSession {
            nick: controller.nick.clone(),
            dest_pub: controller.dest_pub.clone(),
        });
        info!("Local I2P destination: {}", controller.dest_pub);
        info!("I2P session nick: {}", controller.nick);

        if !state.config.i2p_transient {
            if let Err(err) = std::fs::write(&key_path, &controller.dest_priv) {
                warn!("Error while saving I2P destination private key: {}", err);
            }
            let pub_path = state.config.data_dir.join("i2p_dest.pub");
            if let Err(err) = std::fs::write(&pub_path, &controller.dest_pub) {
                warn!("Error while saving I2P destination public key: {}", err);
            } else {
                debug!("Saved I2P destination keys");
            }
        }

        self.tracker
            .spawn(I2pListener::new(state.clone(), controller.nick.clone()).run());
        self.tracker.spawn(controller.run());
        Ok(())
    }

    /// Flag shutdown and wait for tasks, with a bounded timeout.
    pub async fn shutdown(&self) {
        info!("Shutting down node, finishing open connections...");
        self.state.shutdown.cancel();

        select! {
            _ = self.tracker.wait() => {}
            _ = tokio::time::sleep(SHUTDOWN_TIMEOUT) => {
                info!("Shutdown timeout reached, exiting...");
            }
        }
    }
}
