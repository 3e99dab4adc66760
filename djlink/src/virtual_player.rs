use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::anyhow;
use log::warn;
use mac_address::mac_address_by_name;
use network_interface::{Addr, NetworkInterface, NetworkInterfaceConfig, V4IfAddr};
use tokio::{
    net::UdpSocket,
    sync::watch,
    time::{self, Instant},
};

use crate::{proto::AnnouncePacket, Device, DeviceType, LinkError, Result, ANNOUNCE_PORT};

/// Name the virtual player announces itself under.
const VIRTUAL_PLAYER_NAME: &str = "djlink";

/// Real devices expect a keep-alive at least this often.
const ANNOUNCE_INTERVAL: Duration = Duration::from_millis(1500);

/// Builds the synthetic device announced on behalf of this client, bound to
/// the first suitable interface (or the named one).
pub(crate) fn new_virtual_player(interface_name: Option<&str>, id: u8) -> Result<Device> {
    let interfaces =
        NetworkInterface::show().map_err(|e| anyhow!("can't get network interfaces: {}", e))?;

    let mut candidates = interfaces
        .iter()
        .filter(|iface| match interface_name {
            Some(name) => iface.name == name,
            None => true,
        })
        .filter(|iface| iface.addr.iter().any(broadcast_capable))
        .peekable();

    if candidates.peek().is_none() {
        return Err(LinkError::NoInterface);
    }

    for iface in candidates {
        if let Some(ip) = usable_ipv4(iface) {
            let mac = mac_address_by_name(&iface.name)
                .map_err(|e| anyhow!("failed to look up mac address: {}", e))?
                .ok_or(anyhow!("no mac address on interface {}", &iface.name))?;

            return Ok(Device {
                name: VIRTUAL_PLAYER_NAME.to_string(),
                id,
                device_type: DeviceType::Player,
                mac_addr: mac.bytes(),
                ip_addr: ip,
                last_seen: Instant::now(),
            });
        }
    }

    Err(LinkError::NoIpv4(
        interface_name.unwrap_or("any").to_string(),
    ))
}

fn broadcast_capable(addr: &Addr) -> bool {
    match addr {
        Addr::V4(V4IfAddr { broadcast, .. }) => broadcast.is_some(),
        _ => false,
    }
}

fn usable_ipv4(iface: &NetworkInterface) -> Option<Ipv4Addr> {
    iface.addr.iter().find_map(|addr| match addr {
        Addr::V4(a) if !a.ip.is_loopback() && default_mask(a.ip).is_some() => Some(a.ip),
        _ => None,
    })
}

/// Classful default netmask of an IPv4 address. Class D and E addresses are
/// not valid host addresses and yield `None`.
fn default_mask(ip: Ipv4Addr) -> Option<Ipv4Addr> {
    match ip.octets()[0] {
        0..=127 => Some(Ipv4Addr::new(255, 0, 0, 0)),
        128..=191 => Some(Ipv4Addr::new(255, 255, 0, 0)),
        192..=223 => Some(Ipv4Addr::new(255, 255, 255, 0)),
        _ => None,
    }
}

/// Classful broadcast address announces are sent to: the device's address
/// with all host bits set.
pub(crate) fn broadcast_address(ip: Ipv4Addr) -> Option<SocketAddr> {
    let mask = u32::from(default_mask(ip)?);
    let bcast = Ipv4Addr::from(u32::from(ip) | !mask);
    Some(SocketAddr::from((bcast, ANNOUNCE_PORT)))
}

/// Broadcasts the virtual player's announce packet every 1.5 s until
/// shutdown. Individual send failures do not stop the ticker.
pub(crate) async fn announcer_task(
    socket: Arc<UdpSocket>,
    virtual_player: Device,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let broadcast_addr = match broadcast_address(virtual_player.ip_addr) {
        Some(addr) => addr,
        None => {
            warn!(target: "djlink", "no broadcast address for {}", virtual_player.ip_addr);
            return;
        }
    };

    let mut announce_data = Vec::new();
    if let Err(e) = AnnouncePacket::for_device(&virtual_player).write(&mut announce_data) {
        warn!(target: "djlink", "can't serialize announce packet: {}", e);
        return;
    }

    let mut ticker = time::interval(ANNOUNCE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&announce_data, broadcast_addr).await {
                    warn!(target: "djlink", "announce send failed: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classful_broadcast() {
        let test_cases = [
            ([10, 1, 2, 3], [10, 255, 255, 255]),
            ([172, 16, 4, 5], [172, 16, 255, 255]),
            ([192, 168, 1, 247], [192, 168, 1, 255]),
        ];

        for (ip, bcast) in test_cases {
            let addr = broadcast_address(Ipv4Addr::from(ip)).unwrap();
            assert_eq!(addr, SocketAddr::from((Ipv4Addr::from(bcast), 50000)));
        }
    }

    #[test]
    fn test_multicast_address_has_no_broadcast() {
        assert!(broadcast_address(Ipv4Addr::new(224, 0, 0, 1)).is_none());
    }
}
