//! Client for the remote database service devices expose over TCP. The
//! coordinator opens one session per eligible device as the device manager
//! reports arrivals, and routes track queries to the right session.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use log::debug;

use crate::{Device, DeviceListener, DeviceManager, DeviceType, LinkError, Result};

mod session;
mod wire;

use session::Session;

/// Source a track is loaded from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackSlot {
    Cd,
    Sd,
    Usb,
    Rekordbox,
}

impl TrackSlot {
    pub(crate) fn as_byte(self) -> u8 {
        match self {
            TrackSlot::Cd => 0x01,
            TrackSlot::Sd => 0x02,
            TrackSlot::Usb => 0x03,
            TrackSlot::Rekordbox => 0x04,
        }
    }
}

/// Track information retrieved from a device's database.
#[derive(Clone, Debug, PartialEq)]
pub struct Track {
    pub id: u32,
    pub path: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub label: String,
    pub genre: String,
    pub comment: String,
    pub key: String,
    pub length: Duration,
    pub artwork: Option<Vec<u8>>,
}

/// Identifies a track to look up: its rekordbox id, the slot it is loaded
/// from, and the device whose database owns it.
#[derive(Clone, Debug)]
pub struct TrackQuery {
    pub track_id: u32,
    pub slot: TrackSlot,
    pub device_id: u8,
}

/// Maintains remote database sessions for every linkable device on the
/// network and answers track queries against them.
#[derive(Clone)]
pub struct RemoteDb {
    inner: Arc<RemoteDbInner>,
}

struct RemoteDbInner {
    virtual_id: u8,
    sessions: Mutex<HashMap<u8, Arc<Session>>>,
}

impl RemoteDb {
    pub(crate) fn new(virtual_id: u8) -> RemoteDb {
        RemoteDb {
            inner: Arc::new(RemoteDbInner {
                virtual_id,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Starts following the device manager: sessions open for players and
    /// rekordbox instances as they arrive and close as they leave. Other
    /// device types do not serve the database protocol.
    pub(crate) fn activate(&self, manager: &DeviceManager) {
        manager.add_listener(Arc::new(SessionKeeper { db: self.clone() }));
    }

    /// Whether the database service of the given device is currently
    /// reachable through an open session.
    pub fn is_linked(&self, device_id: u8) -> bool {
        self.inner
            .sessions
            .lock()
            .unwrap()
            .get(&device_id)
            .map(|s| s.is_linked())
            .unwrap_or(false)
    }

    /// Fetches a track's metadata, path, and artwork.
    ///
    /// Fails with `NotLinked` when the device has no open session and
    /// `CdUnsupported` for optical-disc queries, both before any socket
    /// traffic. A transport or protocol failure refreshes the device's
    /// session before the error is returned.
    pub async fn get_track(&self, query: &TrackQuery) -> Result<Track> {
        let session = self.inner.sessions.lock().unwrap().get(&query.device_id).cloned();
        let session = match session {
            Some(session) if session.is_linked() => session,
            _ => return Err(LinkError::NotLinked(query.device_id)),
        };

        if query.slot == TrackSlot::Cd {
            return Err(LinkError::CdUnsupported);
        }

        let result = session.get_track(query).await;
        if let Err(e) = &result {
            if e.is_session_fatal() {
                self.refresh(session.device().clone());
            }
        }
        result
    }

    fn open_session(&self, device: Device) {
        debug!(target: "djlink", "opening database session for {}", &device);
        let session = Session::start(device.clone(), self.inner.virtual_id);
        self.inner.sessions.lock().unwrap().insert(device.id, session);
    }

    fn close_session(&self, device_id: u8) {
        if let Some(session) = self.inner.sessions.lock().unwrap().remove(&device_id) {
            debug!(target: "djlink", "closing database session for {}", session.device());
            session.close();
        }
    }

    /// Tears the device's session down and starts a fresh one.
    fn refresh(&self, device: Device) {
        self.close_session(device.id);
        self.open_session(device);
    }

    pub(crate) fn close_all(&self) {
        let mut sessions = self.inner.sessions.lock().unwrap();
        for (_, session) in sessions.drain() {
            session.close();
        }
    }
}

/// Device listener that mirrors manager events into session lifecycle.
struct SessionKeeper {
    db: RemoteDb,
}

impl DeviceListener for SessionKeeper {
    fn on_added(&self, device: &Device) {
        match device.device_type {
            DeviceType::Player | DeviceType::Rekordbox => {
                self.db.open_session(device.clone());
            }
            _ => (),
        }
    }

    fn on_removed(&self, device: &Device) {
        self.db.close_session(device.id);
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        time,
    };

    use super::*;

    fn test_device(id: u8, device_type: DeviceType) -> Device {
        Device {
            name: format!("CDJ-{}", id),
            id,
            device_type,
            mac_addr: [0x00, 0xe0, 0x36, 0x00, 0x00, id],
            ip_addr: Ipv4Addr::LOCALHOST,
            last_seen: time::Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_unknown_device_is_not_linked() {
        let db = RemoteDb::new(2);
        assert!(!db.is_linked(3));

        let query = TrackQuery {
            track_id: 1,
            slot: TrackSlot::Usb,
            device_id: 3,
        };
        assert!(matches!(
            db.get_track(&query).await,
            Err(LinkError::NotLinked(3))
        ));
    }

    const ARTWORK_TRACK_ID: u32 = 7;
    const JPEG: &[u8] = b"\xff\xd8\xffjpeg-bytes";

    /// State shared with the fake device so the test can assert on
    /// protocol-level properties afterwards.
    #[derive(Default)]
    struct ServerLog {
        message_ids: Mutex<Vec<u32>>,
        drop_next_query: AtomicBool,
    }

    fn string_section(text: &str, trailer: &[u8]) -> Vec<u8> {
        let mut section = vec![0u8; 38];
        section.extend_from_slice(&wire::encode_utf16(text));
        section.extend_from_slice(trailer);
        section
    }

    fn metadata_sections(track_id: u32) -> Vec<Vec<u8>> {
        let artwork_id = if track_id == ARTWORK_TRACK_ID { 0x55 } else { 0 };
        let mut trailer = vec![0u8; 19];
        trailer[0..4].copy_from_slice(&(artwork_id as u32).to_be_bytes());

        let mut length_section = vec![0u8; 32];
        length_section[28..32].copy_from_slice(&372u32.to_be_bytes());

        vec![
            string_section(&format!("Track {}", track_id), &trailer),
            string_section("Artist", &[]),
            string_section("Album", &[]),
            length_section,
            vec![0u8; 4],
            string_section("Comment", &[]),
            string_section("8A", &[]),
            vec![0u8; 4],
            vec![0u8; 4],
            string_section("Techno", &[]),
            string_section("Label", &[]),
        ]
    }

    fn path_sections() -> Vec<Vec<u8>> {
        let mut sections = vec![vec![0u8; 4]; 11];
        sections[4] = string_section("/MUSIC/track.mp3", &[]);
        sections
    }

    fn multi_section_response(msg_id: u32, sections: &[Vec<u8>]) -> Vec<u8> {
        let mut buf = wire::frame_packet(msg_id, &[0x40, 0x00]);
        for section in sections {
            buf.extend_from_slice(&wire::frame_packet(msg_id, section));
        }
        buf.extend_from_slice(&wire::frame_packet(msg_id, wire::FINAL_SECTION));
        buf
    }

    /// Serves the port-discovery endpoint on TCP/12523 and a database
    /// endpoint on an ephemeral port, for a device living at 127.0.0.1.
    async fn start_fake_device(log: Arc<ServerLog>) {
        let discovery = TcpListener::bind((Ipv4Addr::LOCALHOST, 12523))
            .await
            .expect("bind port discovery");
        let db_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind db service");
        let db_port = db_listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let mut stream = match discovery.accept().await {
                    Ok((stream, _)) => stream,
                    Err(_) => return,
                };
                let mut query = vec![0u8; wire::PORT_QUERY.len()];
                if stream.read_exact(&mut query).await.is_ok() {
                    assert_eq!(query, wire::PORT_QUERY);
                    let _ = stream.write_all(&db_port.to_be_bytes()).await;
                }
            }
        });

        tokio::spawn(async move {
            loop {
                let stream = match db_listener.accept().await {
                    Ok((stream, _)) => stream,
                    Err(_) => return,
                };
                let log = log.clone();
                tokio::spawn(async move {
                    let _ = serve_db_connection(stream, log).await;
                });
            }
        });
    }

    /// Reads one framed request, returning its message id and payload.
    async fn read_request(
        stream: &mut TcpStream,
        log: &ServerLog,
    ) -> std::io::Result<(u32, Vec<u8>)> {
        let mut header = [0u8; 10];
        stream.read_exact(&mut header).await?;
        assert_eq!(&header[0..6], wire::SEPARATOR);
        let msg_id = u32::from_be_bytes([header[6], header[7], header[8], header[9]]);
        log.message_ids.lock().unwrap().push(msg_id);

        let mut opcode = [0u8; 3];
        stream.read_exact(&mut opcode).await?;

        // All request payloads are fixed-size per opcode.
        let rest_len = match opcode {
            [0x10, 0x30, 0x00] => 49,
            _ => 29,
        };
        let mut rest = vec![0u8; rest_len];
        stream.read_exact(&mut rest).await?;

        let mut payload = opcode.to_vec();
        payload.extend_from_slice(&rest);
        Ok((msg_id, payload))
    }

    async fn serve_db_connection(
        mut stream: TcpStream,
        log: Arc<ServerLog>,
    ) -> std::io::Result<()> {
        // Handshake: connect message, then identification.
        let mut connect_msg = [0u8; 5];
        stream.read_exact(&mut connect_msg).await?;
        assert_eq!(connect_msg, [0x11, 0x00, 0x00, 0x00, 0x01]);
        stream.write_all(&[0u8; 5]).await?;

        let mut identify = [0u8; 37];
        stream.read_exact(&mut identify).await?;
        stream.write_all(&[0u8; 42]).await?;

        // Sections promised by the last initial part, served when the bulk
        // part arrives.
        let mut pending: Option<Vec<Vec<u8>>> = None;

        loop {
            let (msg_id, payload) = read_request(&mut stream, &log).await?;

            match &payload[0..3] {
                // Metadata query, initial part.
                [0x10, 0x20, 0x02] => {
                    if log.drop_next_query.swap(false, Ordering::SeqCst) {
                        return Ok(());
                    }
                    let track_id =
                        u32::from_be_bytes([payload[28], payload[29], payload[30], payload[31]]);
                    pending = Some(metadata_sections(track_id));
                    stream.write_all(&[0u8; 42]).await?;
                }
                // Path query, initial part.
                [0x10, 0x21, 0x02] => {
                    pending = Some(path_sections());
                    stream.write_all(&[0u8; 42]).await?;
                }
                // Bulk part: stream the pending sections under its id.
                [0x10, 0x30, 0x00] => {
                    let sections = pending.take().expect("bulk part without initial part");
                    stream
                        .write_all(&multi_section_response(msg_id, &sections))
                        .await?;
                }
                // Artwork query.
                [0x10, 0x20, 0x03] => {
                    let mut art_header = [0u8; 52];
                    art_header[48..52].copy_from_slice(&(JPEG.len() as u32).to_be_bytes());
                    stream.write_all(&art_header).await?;
                    stream.write_all(JPEG).await?;
                }
                other => panic!("unexpected opcode {:02x?}", other),
            }
        }
    }

    async fn wait_linked(db: &RemoteDb, device_id: u8) {
        time::timeout(Duration::from_secs(30), async {
            while !db.is_linked(device_id) {
                time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("device never linked");
    }

    fn query(track_id: u32, slot: TrackSlot, device_id: u8) -> TrackQuery {
        TrackQuery {
            track_id,
            slot,
            device_id,
        }
    }

    #[tokio::test]
    async fn test_get_track_against_fake_device() {
        let log = Arc::new(ServerLog::default());
        start_fake_device(log.clone()).await;

        let manager = DeviceManager::new();
        let db = RemoteDb::new(2);
        db.activate(&manager);

        // A mixer does not serve the database protocol and never links.
        manager.registry().observe(test_device(9, DeviceType::Mixer));
        assert!(!db.is_linked(9));

        manager.registry().observe(test_device(2, DeviceType::Player));
        wait_linked(&db, 2).await;

        // Optical discs are rejected up front.
        assert!(matches!(
            db.get_track(&query(1, TrackSlot::Cd, 2)).await,
            Err(LinkError::CdUnsupported)
        ));

        // Plain track: no artwork query is issued for a zero artwork id.
        let track = db.get_track(&query(1, TrackSlot::Usb, 2)).await.unwrap();
        assert_eq!(track.title, "Track 1");
        assert_eq!(track.artist, "Artist");
        assert_eq!(track.path, "/MUSIC/track.mp3");
        assert_eq!(track.length, Duration::from_secs(372));
        assert_eq!(track.artwork, None);

        // A nonzero artwork id triggers the follow-up query.
        let track = db
            .get_track(&query(ARTWORK_TRACK_ID, TrackSlot::Usb, 2))
            .await
            .unwrap();
        assert_eq!(track.artwork.as_deref(), Some(JPEG));

        // Concurrent queries serialize on the session and both succeed.
        let (a, b) = tokio::join!(
            {
                let db = db.clone();
                async move { db.get_track(&query(5, TrackSlot::Usb, 2)).await }
            },
            {
                let db = db.clone();
                async move { db.get_track(&query(6, TrackSlot::Usb, 2)).await }
            },
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.title, "Track 5");
        assert_eq!(b.title, "Track 6");

        // Peer closing mid-query surfaces a transport error, then the
        // refreshed session links again and queries succeed.
        log.drop_next_query.store(true, Ordering::SeqCst);
        assert!(matches!(
            db.get_track(&query(5, TrackSlot::Usb, 2)).await,
            Err(LinkError::Io(_))
        ));
        wait_linked(&db, 2).await;
        let track = db.get_track(&query(5, TrackSlot::Usb, 2)).await.unwrap();
        assert_eq!(track.title, "Track 5");

        // Message ids on each connection start at 1 and increase by 1 per
        // request write.
        let ids = log.message_ids.lock().unwrap();
        assert_eq!(ids[0], 1);
        for pair in ids.windows(2) {
            assert!(pair[1] == pair[0] + 1 || pair[1] == 1);
        }
    }
}
