use bytes::Bytes;
use log::debug;
use std::net::SocketAddr;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, watch},
};

/// One raw datagram from the player status port. Status packets are handed
/// to the embedder undecoded.
#[derive(Clone, Debug)]
pub struct StatusPacket {
    pub source: SocketAddr,
    pub data: Bytes,
}

/// Forwards status datagrams to the embedder. Status packets repeat every
/// few hundred milliseconds; a full channel drops the datagram.
pub(crate) async fn listener_task(
    socket: UdpSocket,
    status_tx: mpsc::Sender<StatusPacket>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut buf = [0; 4096];
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                return;
            }
            res = socket.recv_from(&mut buf) => {
                if let Ok((len, src)) = res {
                    let pkt = StatusPacket {
                        source: src,
                        data: Bytes::copy_from_slice(&buf[0..len]),
                    };
                    match status_tx.try_send(pkt) {
                        Ok(()) => (),
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!(target: "djlink", "status channel full, dropping packet");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            return;
                        }
                    }
                }
            }
        }
    }
}
