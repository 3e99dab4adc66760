//! Byte-level framing for the remote database protocol. Every opaque blob
//! the protocol requires lives here so it can be audited in one place.

use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};

use crate::{LinkError, Result};

use super::Track;

/// Marker that prefixes every framed packet and separates response sections.
pub(crate) const SEPARATOR: &[u8] = &[0x11, 0x87, 0x23, 0x49, 0xae, 0x11];

/// First bytes written on a fresh connection to the database service.
pub(crate) const CONNECT_MSG: &[u8] = &[0x11, 0x00, 0x00, 0x00, 0x01];

/// Query written to the port-discovery service on TCP/12523: a 4-byte
/// big-endian name length, the service name, and a terminating NUL.
pub(crate) const PORT_QUERY: &[u8] = b"\x00\x00\x00\x0fRemoteDBServer\x00";

// Written after the separator in the identification blob; it looks like a
// mask that resets the peer's message counter.
const COUNTER_RESET: &[u8] = &[0xff, 0xff, 0xff, 0xfe];

// Opaque, but required to get the connection into a queryable state.
const IDENTIFY_BLOB: &[u8] = &[
    0x10, 0x00, 0x00, 0x0f, 0x01, 0x14, 0x00, 0x00, //
    0x00, 0x0c, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x11, 0x00, //
    0x00, 0x00,
];

/// Payload of the empty section that terminates every multi-section
/// response.
pub(crate) const FINAL_SECTION: &[u8] = &[
    0x10, 0x42, 0x01, 0x0f, 0x00, 0x14, 0x00, 0x00, 0x00, //
    0x0c, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, //
    0x00, 0x00, 0x00, 0x00,
];

/// Frames a payload for the wire: separator, big-endian message id, payload.
pub(crate) fn frame_packet(message_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(SEPARATOR.len() + 4 + payload.len());
    pkt.extend_from_slice(SEPARATOR);
    pkt.extend_from_slice(&message_id.to_be_bytes());
    pkt.extend_from_slice(payload);
    pkt
}

/// The identification blob claiming `virtual_id` as our requester identity.
/// Peers reject queries when the claimed id is outside 1..=4.
pub(crate) fn identify_packet(virtual_id: u8) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(SEPARATOR.len() + COUNTER_RESET.len() + IDENTIFY_BLOB.len() + 1);
    pkt.extend_from_slice(SEPARATOR);
    pkt.extend_from_slice(COUNTER_RESET);
    pkt.extend_from_slice(IDENTIFY_BLOB);
    pkt.push(virtual_id);
    pkt
}

/// The two request payloads of a track metadata query.
pub(crate) fn metadata_query_parts(virtual_id: u8, slot: u8, track_id: u32) -> (Vec<u8>, Vec<u8>) {
    let mut part1 = vec![
        0x10, 0x20, 0x02, 0x0f, 0x02, 0x14, 0x00, 0x00, //
        0x00, 0x0c, 0x06, 0x06, 0x00, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x11, virtual_id, //
        0x01, slot, 0x01, 0x11,
    ];
    part1.extend_from_slice(&track_id.to_be_bytes());

    let part2 = vec![
        0x10, 0x30, 0x00, 0x0f, 0x06, 0x14, 0x00, 0x00, //
        0x00, 0x0c, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, //
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x11, virtual_id, //
        0x01, slot, 0x01, 0x11, 0x00, 0x00, 0x00, 0x00, //
        0x11, 0x00, 0x00, 0x00, 0x0b, 0x11, 0x00, 0x00, //
        0x00, 0x00, 0x11, 0x00, 0x00, 0x00, 0x0b, 0x11, //
        0x00, 0x00, 0x00, 0x00,
    ];

    (part1, part2)
}

/// The two request payloads of a track path query. Same shape as the
/// metadata query with a differing opcode and the 0x08 selector.
pub(crate) fn path_query_parts(virtual_id: u8, slot: u8, track_id: u32) -> (Vec<u8>, Vec<u8>) {
    let mut part1 = vec![
        0x10, 0x21, 0x02, 0x0f, 0x02, 0x14, 0x00, 0x00, //
        0x00, 0x0c, 0x06, 0x06, 0x00, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x11, virtual_id, //
        0x08, slot, 0x01, 0x11,
    ];
    part1.extend_from_slice(&track_id.to_be_bytes());

    let part2 = vec![
        0x10, 0x30, 0x00, 0x0f, 0x06, 0x14, 0x00, 0x00, //
        0x00, 0x0c, 0x06, 0x06, 0x06, 0x06, 0x06, 0x06, //
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x11, virtual_id, //
        0x08, slot, 0x01, 0x11, 0x00, 0x00, 0x00, 0x00, //
        0x11, 0x00, 0x00, 0x00, 0x06, 0x11, 0x00, 0x00, //
        0x00, 0x00, 0x11, 0x00, 0x00, 0x00, 0x06, 0x11, //
        0x00, 0x00, 0x00, 0x00,
    ];

    (part1, part2)
}

/// The single request payload of an artwork query.
pub(crate) fn artwork_query(virtual_id: u8, slot: u8, artwork_id: u32) -> Vec<u8> {
    let mut part = vec![
        0x10, 0x20, 0x03, 0x0f, 0x02, 0x14, 0x00, 0x00, //
        0x00, 0x0c, 0x06, 0x06, 0x00, 0x00, 0x00, 0x00, //
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x11, virtual_id, //
        0x08, slot, 0x01, 0x11,
    ];
    part.extend_from_slice(&artwork_id.to_be_bytes());
    part
}

fn malformed(what: &str) -> LinkError {
    LinkError::MalformedResponse(what.to_string())
}

/// Splits a fully drained multi-section response into its sections.
///
/// The buffer starts with the separator, so the first fragment is empty;
/// the fragment after it is the response preamble and the last fragment is
/// the final-section marker. All three are discarded, and the 4-byte
/// message id is stripped from each remaining section.
pub(crate) fn split_sections(buf: &[u8]) -> Result<Vec<Vec<u8>>> {
    let fragments = split_on(buf, SEPARATOR);
    if fragments.len() < 3 {
        return Err(malformed("too few response sections"));
    }

    let mut sections = Vec::with_capacity(fragments.len() - 3);
    for fragment in &fragments[2..fragments.len() - 1] {
        if fragment.len() < 4 {
            return Err(malformed("section shorter than its message id"));
        }
        sections.push(fragment[4..].to_vec());
    }

    Ok(sections)
}

fn split_on<'a>(buf: &'a [u8], sep: &[u8]) -> Vec<&'a [u8]> {
    let mut fragments = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + sep.len() <= buf.len() {
        if &buf[i..i + sep.len()] == sep {
            fragments.push(&buf[start..i]);
            i += sep.len();
            start = i;
        } else {
            i += 1;
        }
    }
    fragments.push(&buf[start..]);
    fragments
}

/// Encodes a string as a 4-byte big-endian code unit count followed by
/// big-endian UTF-16. The terminating NUL is included in the count, the way
/// the protocol sends strings.
pub(crate) fn encode_utf16(s: &str) -> Vec<u8> {
    let units: Vec<u16> = s.encode_utf16().chain(std::iter::once(0)).collect();
    let mut out = Vec::with_capacity(4 + units.len() * 2);
    out.extend_from_slice(&(units.len() as u32).to_be_bytes());
    for unit in units {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    out
}

/// Decodes a length-prefixed big-endian UTF-16 string, dropping the
/// terminating NUL the protocol counts. The count is clamped to the bytes
/// actually present; invalid surrogates decode to the replacement
/// character.
pub(crate) fn decode_utf16(buf: &[u8]) -> Result<String> {
    if buf.len() < 4 {
        return Err(malformed("utf-16 string missing length prefix"));
    }

    let count = BigEndian::read_u32(&buf[0..4]) as usize;
    let avail = (buf.len() - 4) / 2;
    let take = count.min(avail);

    let mut units = Vec::with_capacity(take);
    for k in 0..take {
        units.push(BigEndian::read_u16(&buf[4 + 2 * k..]));
    }
    if take == count && take > 0 {
        units.pop();
    }

    Ok(String::from_utf16_lossy(&units))
}

// Positional layout of the metadata response sections.
const METADATA_SECTIONS: usize = 11;
const STRING_OFFSET: usize = 38;
const TRAILER_LEN: usize = 19;

fn string_at(section: &[u8], what: &str) -> Result<String> {
    if section.len() < STRING_OFFSET {
        return Err(malformed(what));
    }
    decode_utf16(&section[STRING_OFFSET..])
}

/// Extracts a `Track` (sans path and artwork) from the metadata response
/// sections, along with the artwork id found in section 0's trailer. An
/// artwork id of 0 means the track has no artwork.
pub(crate) fn track_from_sections(track_id: u32, sections: &[Vec<u8>]) -> Result<(Track, u32)> {
    if sections.len() < METADATA_SECTIONS {
        return Err(malformed("metadata response with too few sections"));
    }

    let title_section = &sections[0];
    if title_section.len() < TRAILER_LEN {
        return Err(malformed("title section too short for artwork id"));
    }
    let trailer = &title_section[title_section.len() - TRAILER_LEN..];
    let artwork_id = BigEndian::read_u32(&trailer[0..4]);

    let length_section = &sections[3];
    if length_section.len() < 32 {
        return Err(malformed("length section too short"));
    }
    let length = BigEndian::read_u32(&length_section[28..32]);

    let track = Track {
        id: track_id,
        path: String::new(),
        title: string_at(title_section, "title section too short")?,
        artist: string_at(&sections[1], "artist section too short")?,
        album: string_at(&sections[2], "album section too short")?,
        comment: string_at(&sections[5], "comment section too short")?,
        key: string_at(&sections[6], "key section too short")?,
        genre: string_at(&sections[9], "genre section too short")?,
        label: string_at(&sections[10], "label section too short")?,
        length: Duration::from_secs(length as u64),
        artwork: None,
    };

    Ok((track, artwork_id))
}

/// Extracts the rekordbox file path from the path response sections.
pub(crate) fn path_from_sections(sections: &[Vec<u8>]) -> Result<String> {
    if sections.len() < 5 {
        return Err(malformed("path response with too few sections"));
    }
    string_at(&sections[4], "path section too short")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf16_round_trip() {
        for s in ["", "Blue Monday", "ноль три", "情熱大陸", "a\u{1F3B7}b"] {
            assert_eq!(decode_utf16(&encode_utf16(s)).unwrap(), s);
        }
    }

    #[test]
    fn test_utf16_decode_clamps_to_buffer() {
        // Count claims ten units but only three are present.
        let mut buf = vec![0x00, 0x00, 0x00, 0x0a];
        for unit in [0x0061u16, 0x0062, 0x0063] {
            buf.extend_from_slice(&unit.to_be_bytes());
        }
        assert_eq!(decode_utf16(&buf).unwrap(), "abc");
    }

    #[test]
    fn test_utf16_decode_replaces_lone_surrogate() {
        // Two counted units: an unpaired high surrogate and the NUL.
        let buf = [0x00, 0x00, 0x00, 0x02, 0xd8, 0x00, 0x00, 0x00];
        assert_eq!(decode_utf16(&buf).unwrap(), "\u{fffd}");
    }

    #[test]
    fn test_utf16_decode_rejects_missing_prefix() {
        assert!(decode_utf16(&[0x00, 0x01]).is_err());
    }

    #[test]
    fn test_frame_packet() {
        let pkt = frame_packet(0x0102_0304, &[0xaa, 0xbb]);
        assert_eq!(
            pkt,
            [0x11, 0x87, 0x23, 0x49, 0xae, 0x11, 0x01, 0x02, 0x03, 0x04, 0xaa, 0xbb]
        );
    }

    #[test]
    fn test_identify_packet_carries_virtual_id() {
        let pkt = identify_packet(3);
        assert_eq!(pkt.len(), 37);
        assert_eq!(&pkt[0..6], SEPARATOR);
        assert_eq!(&pkt[6..10], [0xff, 0xff, 0xff, 0xfe]);
        assert_eq!(pkt[36], 3);
    }

    #[test]
    fn test_query_parts_embed_identity() {
        let (p1, p2) = metadata_query_parts(2, 0x03, 0xdead_beef);
        assert_eq!(p1.len(), 32);
        assert_eq!(&p1[22..28], [0x11, 2, 0x01, 0x03, 0x01, 0x11]);
        assert_eq!(&p1[28..32], [0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&p2[22..26], [0x11, 2, 0x01, 0x03]);

        let (p1, _) = path_query_parts(2, 0x03, 0xdead_beef);
        assert_eq!(p1[1], 0x21);
        assert_eq!(p1[24], 0x08);

        let art = artwork_query(2, 0x03, 7);
        assert_eq!(art[2], 0x03);
        assert_eq!(&art[28..32], [0, 0, 0, 7]);
    }

    fn string_section(text: &str, trailer: &[u8]) -> Vec<u8> {
        let mut section = vec![0u8; STRING_OFFSET];
        section.extend_from_slice(&encode_utf16(text));
        section.extend_from_slice(trailer);
        section
    }

    fn metadata_sections(title: &str, artwork_id: u32, length_secs: u32) -> Vec<Vec<u8>> {
        let mut trailer = vec![0u8; TRAILER_LEN];
        trailer[0..4].copy_from_slice(&artwork_id.to_be_bytes());

        let mut length_section = vec![0u8; 32];
        length_section[28..32].copy_from_slice(&length_secs.to_be_bytes());

        vec![
            string_section(title, &trailer),
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

    #[test]
    fn test_track_extraction() {
        let sections = metadata_sections("Spastik", 0, 372);
        let (track, artwork_id) = track_from_sections(17, &sections).unwrap();

        assert_eq!(artwork_id, 0);
        assert_eq!(track.id, 17);
        assert_eq!(track.title, "Spastik");
        assert_eq!(track.artist, "Artist");
        assert_eq!(track.album, "Album");
        assert_eq!(track.comment, "Comment");
        assert_eq!(track.key, "8A");
        assert_eq!(track.genre, "Techno");
        assert_eq!(track.label, "Label");
        assert_eq!(track.length, Duration::from_secs(372));
        assert_eq!(track.artwork, None);
    }

    #[test]
    fn test_track_extraction_finds_artwork_id() {
        let sections = metadata_sections("Spastik", 0x0000_1234, 372);
        let (_, artwork_id) = track_from_sections(17, &sections).unwrap();
        assert_eq!(artwork_id, 0x1234);
    }

    #[test]
    fn test_track_extraction_rejects_short_response() {
        let mut sections = metadata_sections("Spastik", 0, 372);
        sections.truncate(7);
        assert!(track_from_sections(17, &sections).is_err());
    }

    #[test]
    fn test_split_sections() {
        let msg_id = 9u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&frame_packet(msg_id, &[0x40, 0x00, 0x01])); // preamble
        buf.extend_from_slice(&frame_packet(msg_id, &[0xaa, 0xaa]));
        buf.extend_from_slice(&frame_packet(msg_id, &[0xbb]));
        buf.extend_from_slice(&frame_packet(msg_id, FINAL_SECTION));

        let sections = split_sections(&buf).unwrap();
        assert_eq!(sections, vec![vec![0xaa, 0xaa], vec![0xbb]]);
    }

    #[test]
    fn test_split_sections_rejects_garbage() {
        assert!(split_sections(&[0x00, 0x01, 0x02]).is_err());
    }
}
