use std::sync::Arc;

use log::info;
use thiserror::Error;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, watch},
    task::JoinHandle,
};

mod proto;
mod virtual_player;

pub mod devices;
pub mod remotedb;
pub mod status;

pub use devices::{Device, DeviceListener, DeviceManager, DeviceType};
pub use remotedb::{RemoteDb, Track, TrackQuery, TrackSlot};
pub use status::StatusPacket;

/// UDP port on which devices announce their presence.
pub const ANNOUNCE_PORT: u16 = 50000;

/// UDP port on which players report their playback status.
pub const STATUS_PORT: u16 = 50002;

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("no broadcast-capable network interface available")]
    NoInterface,

    #[error("no usable IPv4 address on interface {0}")]
    NoIpv4(String),

    #[error("device {0} is not linked on the network")]
    NotLinked(u8),

    #[error("reading metadata from optical discs is unsupported")]
    CdUnsupported,

    #[error("{error_kind} error at 0x{pos:x} parsing packet:\n{dump}")]
    Parse {
        error_kind: String,
        pos: usize,
        dump: String,
    },

    #[error("malformed remote database response: {0}")]
    MalformedResponse(String),

    #[error("terminating")]
    Terminating,

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LinkError {
    /// Errors that leave a remote-db session in an unusable state. The
    /// coordinator reacts to these by closing and reopening the session.
    pub(crate) fn is_session_fatal(&self) -> bool {
        matches!(self, LinkError::Io(_) | LinkError::MalformedResponse(_))
    }
}

pub type Result<T> = std::result::Result<T, LinkError>;

#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the interface used to talk to the network. The first
    /// broadcast-capable interface is picked when unset.
    pub interface_name: Option<String>,

    /// Device id claimed by the virtual player. Real players only honour
    /// metadata queries for ids in 1..=4; other ids still join the network
    /// but cannot read from player USB or SD slots.
    pub virtual_player_id: u8,

    /// When another process owns the status port, an external capture-based
    /// monitor takes over status ingress and the library leaves UDP/50002
    /// unbound.
    pub enable_sniff_mode: bool,
}

/// Handle to an active connection to the network.
///
/// Owns the announce socket and every background task. A second concurrent
/// `connect` in the same process is undefined; in practice it fails binding
/// the announce port.
pub struct Network {
    virtual_player: Device,
    device_manager: DeviceManager,
    remote_db: RemoteDb,
    status_rx: Option<mpsc::Receiver<StatusPacket>>,
    shutdown_tx: watch::Sender<bool>,
    child_tasks: Vec<JoinHandle<()>>,
}

impl Network {
    pub async fn connect(config: Config) -> Result<Network> {
        let socket = UdpSocket::bind(("0.0.0.0", ANNOUNCE_PORT)).await?;
        socket.set_broadcast(true)?;
        let socket = Arc::new(socket);

        let virtual_player = virtual_player::new_virtual_player(
            config.interface_name.as_deref(),
            config.virtual_player_id,
        )?;
        info!(target: "djlink", "announcing as {}", &virtual_player);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let device_manager = DeviceManager::new();
        let remote_db = RemoteDb::new(config.virtual_player_id);
        remote_db.activate(&device_manager);

        let mut child_tasks = vec![
            tokio::spawn(virtual_player::announcer_task(
                socket.clone(),
                virtual_player.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(devices::recv_task(
                socket,
                device_manager.registry(),
                virtual_player.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(devices::reaper_task(
                device_manager.registry(),
                shutdown_rx.clone(),
            )),
        ];

        let status_rx = if config.enable_sniff_mode {
            None
        } else {
            let status_socket = UdpSocket::bind(("0.0.0.0", STATUS_PORT)).await?;
            let (status_tx, status_rx) = mpsc::channel(64);
            child_tasks.push(tokio::spawn(status::listener_task(
                status_socket,
                status_tx,
                shutdown_rx,
            )));
            Some(status_rx)
        };

        Ok(Network {
            virtual_player,
            device_manager,
            remote_db,
            status_rx,
            shutdown_tx,
            child_tasks,
        })
    }

    /// The synthetic device being announced on behalf of this client.
    pub fn virtual_player(&self) -> &Device {
        &self.virtual_player
    }

    pub fn device_manager(&self) -> &DeviceManager {
        &self.device_manager
    }

    pub fn remote_db(&self) -> &RemoteDb {
        &self.remote_db
    }

    /// Next raw status datagram from UDP/50002. Returns `None` when status
    /// ingress is disabled by sniff mode or the network has shut down.
    pub async fn next_status(&mut self) -> Option<StatusPacket> {
        match &mut self.status_rx {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Stops all background tasks and closes all sockets.
    pub async fn close(self) {
        let _ = self.shutdown_tx.send(true);
        self.device_manager.registry().clear();
        self.remote_db.close_all();
        for t in self.child_tasks {
            let _ = tokio::join!(t);
        }
    }
}
