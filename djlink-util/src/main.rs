use std::sync::Arc;

use anyhow::Result;
use log::debug;

use djlink::{Config, Device, DeviceListener, Network, RemoteDb};

/// Prints device arrivals and departures, along with whether the device's
/// database became queryable.
struct Watcher {
    remote_db: RemoteDb,
}

impl DeviceListener for Watcher {
    fn on_added(&self, device: &Device) {
        println!(
            "joined: {} (linked: {})",
            device,
            self.remote_db.is_linked(device.id)
        );
    }

    fn on_removed(&self, device: &Device) {
        println!("left:   {}", device);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut network = Network::connect(Config {
        interface_name: None,
        virtual_player_id: 4,
        enable_sniff_mode: false,
    })
    .await?;
    println!("connected as {}", network.virtual_player());

    network.device_manager().add_listener(Arc::new(Watcher {
        remote_db: network.remote_db().clone(),
    }));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                break;
            }
            pkt = network.next_status() => {
                match pkt {
                    Some(pkt) => {
                        debug!("status: {} bytes from {}", pkt.data.len(), pkt.source)
                    }
                    None => break,
                }
            }
        }
    }

    println!("terminating");
    network.close().await;

    Ok(())
}
