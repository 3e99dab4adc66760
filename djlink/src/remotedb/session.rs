use std::{
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::BytesMut;
use log::{debug, info};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::{watch, Mutex},
    time::{self, MissedTickBehavior},
};

use crate::{Device, LinkError, Result, Track, TrackQuery};

use super::wire;

/// Fixed port answering "where is the database service?" on every device.
const PORT_QUERY_PORT: u16 = 12523;

/// How often a session retries connecting after a failed attempt.
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// A long-lived connection to one device's remote database service.
///
/// Starting a session spawns its reconnect loop; the loop keeps attempting
/// to connect until it succeeds or the session is closed. All queries on the
/// session serialize on the connection mutex.
pub(super) struct Session {
    device: Device,
    virtual_id: u8,
    conn: Mutex<Option<DbConnection>>,
    linked: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Session {
    pub(super) fn start(device: Device, virtual_id: u8) -> Arc<Session> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session = Arc::new(Session {
            device,
            virtual_id,
            conn: Mutex::new(None),
            linked: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
        });

        tokio::spawn(reconnect_loop(session.clone()));

        session
    }

    pub(super) fn device(&self) -> &Device {
        &self.device
    }

    pub(super) fn is_linked(&self) -> bool {
        self.linked.load(Ordering::SeqCst)
    }

    /// Signals the reconnect loop and any in-flight query to stop. The
    /// connection is dropped as soon as no query holds it.
    pub(super) fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        self.linked.store(false, Ordering::SeqCst);
        if let Ok(mut conn) = self.conn.try_lock() {
            conn.take();
        }
    }

    /// Runs the metadata, path, and conditional artwork queries for one
    /// track. A transport or protocol failure poisons the connection; the
    /// coordinator is expected to refresh the session afterwards.
    pub(super) async fn get_track(&self, query: &TrackQuery) -> Result<Track> {
        let mut guard = self.conn.lock().await;
        let conn = match guard.as_mut() {
            Some(conn) => conn,
            None => return Err(LinkError::NotLinked(self.device.id)),
        };

        let result = Self::run_query(conn, self.virtual_id, query).await;
        if let Err(e) = &result {
            if e.is_session_fatal() {
                debug!(target: "djlink", "query on {} failed: {}", &self.device, e);
                guard.take();
                self.linked.store(false, Ordering::SeqCst);
            }
        }
        result
    }

    async fn run_query(
        conn: &mut DbConnection,
        virtual_id: u8,
        query: &TrackQuery,
    ) -> Result<Track> {
        let slot = query.slot.as_byte();

        let (part1, part2) = wire::metadata_query_parts(virtual_id, slot, query.track_id);
        let sections = conn.query_sections(&part1, &part2).await?;
        let (mut track, artwork_id) = wire::track_from_sections(query.track_id, &sections)?;

        let (part1, part2) = wire::path_query_parts(virtual_id, slot, query.track_id);
        let sections = conn.query_sections(&part1, &part2).await?;
        track.path = wire::path_from_sections(&sections)?;

        if artwork_id != 0 {
            let payload = wire::artwork_query(virtual_id, slot, artwork_id);
            track.artwork = Some(conn.query_artwork(&payload).await?);
        }

        Ok(track)
    }
}

/// Connects once immediately, then retries on a 5 s ticker until the
/// session links or is closed. At most one attempt is in flight at a time.
async fn reconnect_loop(session: Arc<Session>) {
    let mut shutdown_rx = session.shutdown_rx.clone();

    let mut ticker = time::interval(RETRY_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let attempt = tokio::select! {
            _ = shutdown_rx.changed() => return,
            res = DbConnection::open(
                &session.device,
                session.virtual_id,
                session.shutdown_rx.clone(),
            ) => res,
        };

        match attempt {
            Ok(conn) => {
                *session.conn.lock().await = Some(conn);
                session.linked.store(true, Ordering::SeqCst);
                info!(target: "djlink", "linked to {}", &session.device);
                return;
            }
            Err(e) => {
                debug!(target: "djlink", "connect to {} failed: {}", &session.device, e);
            }
        }

        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = ticker.tick() => (),
        }
    }
}

/// An open, handshaken connection to the database service.
pub(super) struct DbConnection {
    stream: TcpStream,
    msg_counter: u32,
    shutdown_rx: watch::Receiver<bool>,
}

impl DbConnection {
    /// Discovers the service port, connects, and performs the two-step
    /// handshake that claims our virtual player id.
    async fn open(
        device: &Device,
        virtual_id: u8,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<DbConnection> {
        let port = Self::lookup_db_port(device).await?;
        let addr = SocketAddr::new(IpAddr::V4(device.ip_addr), port);
        let mut stream = TcpStream::connect(addr).await?;

        stream.write_all(wire::CONNECT_MSG).await?;
        let mut reply = [0u8; 5];
        stream.read_exact(&mut reply).await?;

        stream.write_all(&wire::identify_packet(virtual_id)).await?;
        let mut reply = [0u8; 42];
        stream.read_exact(&mut reply).await?;

        Ok(DbConnection {
            stream,
            msg_counter: 1,
            shutdown_rx,
        })
    }

    async fn lookup_db_port(device: &Device) -> Result<u16> {
        let addr = SocketAddr::new(IpAddr::V4(device.ip_addr), PORT_QUERY_PORT);
        let mut stream = TcpStream::connect(addr).await?;

        stream.write_all(wire::PORT_QUERY).await?;
        let port = stream.read_u16().await?;

        Ok(port)
    }

    /// Frames and sends one request, returning the message id it carried.
    /// The counter increments after every write, so ids on a session are
    /// strictly increasing.
    async fn send(&mut self, payload: &[u8]) -> Result<u32> {
        let id = self.msg_counter;
        let pkt = wire::frame_packet(id, payload);
        self.write_all(&pkt).await?;
        self.msg_counter += 1;
        Ok(id)
    }

    /// Runs a two-part query under one logical operation: the initial part
    /// elicits a fixed-size acknowledgement, the bulk part a stream of
    /// sections drained until the final-section marker.
    pub(super) async fn query_sections(
        &mut self,
        part1: &[u8],
        part2: &[u8],
    ) -> Result<Vec<Vec<u8>>> {
        self.send(part1).await?;
        let mut ack = [0u8; 42];
        self.read_exact(&mut ack).await?;

        let msg_id = self.send(part2).await?;
        let marker = wire::frame_packet(msg_id, wire::FINAL_SECTION);

        // Multi-section responses carry no length header; the only way to
        // know we have everything is the marker arriving at the end of the
        // accumulated buffer.
        let mut full = BytesMut::with_capacity(4096);
        while !full[..].ends_with(&marker) {
            if self.read_chunk(&mut full).await? == 0 {
                return Err(LinkError::MalformedResponse(
                    "connection closed before the final section".to_string(),
                ));
            }
        }

        wire::split_sections(&full)
    }

    /// Sends an artwork request and reads the exact-length image that
    /// follows the 52-byte response header.
    pub(super) async fn query_artwork(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.send(payload).await?;

        let mut header = [0u8; 52];
        self.read_exact(&mut header).await?;
        let len = u32::from_be_bytes([header[48], header[49], header[50], header[51]]);

        let mut image = vec![0u8; len as usize];
        self.read_exact(&mut image).await?;

        Ok(image)
    }

    // Socket helpers racing the session shutdown signal, so closing the
    // session unblocks in-flight queries.

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        tokio::select! {
            res = self.stream.write_all(data) => {
                res?;
                Ok(())
            }
            _ = wait_shutdown(&mut self.shutdown_rx) => Err(LinkError::Terminating),
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        tokio::select! {
            res = self.stream.read_exact(buf) => {
                res?;
                Ok(())
            }
            _ = wait_shutdown(&mut self.shutdown_rx) => Err(LinkError::Terminating),
        }
    }

    async fn read_chunk(&mut self, buf: &mut BytesMut) -> Result<usize> {
        tokio::select! {
            res = self.stream.read_buf(buf) => Ok(res?),
            _ = wait_shutdown(&mut self.shutdown_rx) => Err(LinkError::Terminating),
        }
    }
}

async fn wait_shutdown(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}
