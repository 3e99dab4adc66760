use std::{
    collections::HashMap,
    fmt,
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    time::Duration,
};

use log::{debug, info, warn};
use tokio::{
    net::UdpSocket,
    sync::watch,
    time::{self, Instant},
};

use crate::proto::AnnouncePacket;

/// How long a silent device stays in the set before it is reaped.
const DEVICE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the reaper scans for silent devices.
const REAPER_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceType {
    Player,
    Mixer,
    Rekordbox,
    Other(u8),
}

impl DeviceType {
    pub(crate) fn from_byte(b: u8) -> DeviceType {
        match b {
            0x01 => DeviceType::Player,
            0x03 => DeviceType::Mixer,
            0x04 => DeviceType::Rekordbox,
            other => DeviceType::Other(other),
        }
    }

    pub(crate) fn as_byte(self) -> u8 {
        match self {
            DeviceType::Player => 0x01,
            DeviceType::Mixer => 0x03,
            DeviceType::Rekordbox => 0x04,
            DeviceType::Other(b) => b,
        }
    }
}

/// A peer discovered on the network, or the synthetic device we announce
/// ourselves as.
///
/// `mac_addr` and `ip_addr` never change for the lifetime of a `Device`; an
/// announce reusing an id with a different hardware identity produces a new
/// instance.
#[derive(Clone, Debug)]
pub struct Device {
    pub name: String,
    pub id: u8,
    pub device_type: DeviceType,
    pub mac_addr: [u8; 6],
    pub ip_addr: Ipv4Addr,
    pub last_seen: Instant,
}

impl Device {
    fn is_same(&self, other: &Device) -> bool {
        self.mac_addr == other.mac_addr && self.ip_addr == other.ip_addr
    }

    pub(crate) fn from_announce(pkt: AnnouncePacket, now: Instant) -> Device {
        Device {
            name: pkt.name,
            id: pkt.device_id,
            device_type: pkt.device_type,
            mac_addr: pkt.mac_addr,
            ip_addr: Ipv4Addr::from(pkt.ip_addr),
            last_seen: now,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:02} @ {}", self.name, self.id, self.ip_addr)
    }
}

/// Capability interface for device lifecycle notifications.
///
/// Callbacks run synchronously on the manager's event task, in listener
/// registration order. They must not block and must not call back into the
/// manager. A listener sees exactly one `on_removed` per device instance it
/// was previously handed in `on_added`.
pub trait DeviceListener: Send + Sync {
    fn on_added(&self, device: &Device) {
        let _ = device;
    }

    fn on_removed(&self, device: &Device) {
        let _ = device;
    }
}

/// Tracks the set of live devices observed on the announce port.
pub struct DeviceManager {
    registry: Arc<DeviceRegistry>,
}

impl DeviceManager {
    pub(crate) fn new() -> DeviceManager {
        DeviceManager {
            registry: Arc::new(DeviceRegistry {
                devices: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Snapshot of the current device set.
    pub fn devices(&self) -> Vec<Device> {
        self.registry.devices.lock().unwrap().values().cloned().collect()
    }

    pub fn device(&self, id: u8) -> Option<Device> {
        self.registry.devices.lock().unwrap().get(&id).cloned()
    }

    pub fn add_listener(&self, listener: Arc<dyn DeviceListener>) {
        self.registry.listeners.lock().unwrap().push(listener);
    }

    pub(crate) fn registry(&self) -> Arc<DeviceRegistry> {
        self.registry.clone()
    }
}

pub(crate) struct DeviceRegistry {
    devices: Mutex<HashMap<u8, Device>>,
    listeners: Mutex<Vec<Arc<dyn DeviceListener>>>,
}

impl DeviceRegistry {
    /// Feeds one valid announce through the device state machine.
    ///
    /// The device lock is held across notification so listeners observe
    /// add/remove events in the order they occurred.
    pub(crate) fn observe(&self, device: Device) {
        let mut devices = self.devices.lock().unwrap();

        if let Some(known) = devices.get_mut(&device.id) {
            if known.is_same(&device) {
                known.last_seen = device.last_seen;
                return;
            }
        }

        // Same id, different hardware: the old device is gone.
        if let Some(old) = devices.remove(&device.id) {
            info!(target: "djlink", "device left: {}", &old);
            self.notify_removed(&old);
        }

        info!(target: "djlink", "device joined: {}", &device);
        devices.insert(device.id, device.clone());
        self.notify_added(&device);
    }

    /// Removes every device whose last announce is older than the timeout.
    pub(crate) fn expire(&self, now: Instant) {
        let mut devices = self.devices.lock().unwrap();

        let timed_out: Vec<u8> = devices
            .iter()
            .filter(|(_, dev)| (now - dev.last_seen) > DEVICE_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();
        for id in timed_out {
            if let Some(dev) = devices.remove(&id) {
                info!(target: "djlink", "device left: {}", &dev);
                self.notify_removed(&dev);
            }
        }
    }

    /// Drops the whole set, notifying removal for each device.
    pub(crate) fn clear(&self) {
        let mut devices = self.devices.lock().unwrap();
        for (_, dev) in devices.drain() {
            self.notify_removed(&dev);
        }
    }

    fn notify_added(&self, device: &Device) {
        for listener in self.listeners.lock().unwrap().iter() {
            listener.on_added(device);
        }
    }

    fn notify_removed(&self, device: &Device) {
        for listener in self.listeners.lock().unwrap().iter() {
            listener.on_removed(device);
        }
    }
}

/// Receives announce datagrams and feeds them to the registry. Our own
/// announces are skipped; a foreign device claiming our id is logged since
/// the library does not arbitrate id collisions.
pub(crate) async fn recv_task(
    socket: Arc<UdpSocket>,
    registry: Arc<DeviceRegistry>,
    virtual_player: Device,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buf = [0; 256];
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                return;
            }
            res = socket.recv_from(&mut buf) => {
                let len = match res {
                    Ok((len, _src)) => len,
                    Err(e) => {
                        warn!(target: "djlink", "announce recv error: {}", e);
                        continue;
                    }
                };
                match AnnouncePacket::parse(&buf[0..len]) {
                    Ok(pkt) if pkt.mac_addr == virtual_player.mac_addr => (),
                    Ok(pkt) => {
                        if pkt.device_id == virtual_player.id {
                            warn!(
                                target: "djlink",
                                "device {} claims our id {}", &pkt.name, pkt.device_id
                            );
                        }
                        registry.observe(Device::from_announce(pkt, Instant::now()));
                    }
                    Err(e) => debug!(target: "djlink", "dropping packet: {}", e),
                }
            }
        }
    }
}

/// Expires silent devices once a second.
pub(crate) async fn reaper_task(registry: Arc<DeviceRegistry>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = time::interval(REAPER_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                return;
            }
            _ = ticker.tick() => {
                registry.expire(Instant::now());
            }
        }
    }
}
