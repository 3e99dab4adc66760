use std::io::Write;

use byteorder::WriteBytesExt;
use nom::{
    bytes::complete::{tag, take},
    error::context,
    number::complete::be_u8,
    IResult,
};
use nom_locate::LocatedSpan;
use pretty_hex::pretty_hex;

use crate::{devices::DeviceType, Device, LinkError, Result};

type Span<'a> = LocatedSpan<&'a [u8]>;

/// All UDP packets on the network start with this header.
const MAGIC: &[u8] = &[0x51, 0x73, 0x70, 0x74, 0x31, 0x57, 0x6d, 0x4a, 0x4f, 0x4c];

/// Packet kind bytes at 0x0A. Only the announce kind matters to us; the
/// kind's second byte is not checked by real devices and neither do we.
const KIND_ANNOUNCE: u8 = 0x06;

// Opaque constants carried by every announce packet.
const UNKNOWN_20: &[u8] = &[0x01, 0x02, 0x00, 0x36];
const UNKNOWN_30: &[u8] = &[0x01, 0x00, 0x00, 0x00];

pub(crate) const ANNOUNCE_PACKET_LEN: usize = 54;

fn magic(i: Span) -> IResult<Span, ()> {
    let (i, _) = context("magic", tag(MAGIC))(i)?;
    Ok((i, ()))
}

fn device_name(i: Span) -> IResult<Span, String> {
    let (i, raw_name) = take(20usize)(i)?;
    let name = String::from_utf8_lossy(&raw_name);
    let name = name.trim_end_matches('\0');

    Ok((i, name.into()))
}

fn mac_addr(i: Span) -> IResult<Span, [u8; 6]> {
    let (i, mac_addr) = take(6usize)(i)?;
    Ok((i, (*mac_addr.fragment()).try_into().unwrap()))
}

fn ip_addr(i: Span) -> IResult<Span, [u8; 4]> {
    let (i, ip_addr) = take(4usize)(i)?;
    Ok((i, (*ip_addr.fragment()).try_into().unwrap()))
}

fn write_device_name(w: &mut dyn Write, name: &str) -> std::io::Result<()> {
    let mut name_buf = [0u8; 20];
    (&mut name_buf as &mut [u8]).write(name.as_bytes())?;
    w.write_all(&name_buf)?;

    Ok(())
}

/// A device announce / keep-alive, broadcast on UDP/50000 every 1.5 s by
/// every device on the network.
#[derive(Debug, PartialEq)]
pub(crate) struct AnnouncePacket {
    pub name: String,
    pub device_id: u8,
    pub device_type: DeviceType,
    pub mac_addr: [u8; 6],
    pub ip_addr: [u8; 4],
}

impl AnnouncePacket {
    pub fn for_device(dev: &Device) -> AnnouncePacket {
        AnnouncePacket {
            name: dev.name.clone(),
            device_id: dev.id,
            device_type: dev.device_type,
            mac_addr: dev.mac_addr,
            ip_addr: dev.ip_addr.octets(),
        }
    }

    pub fn write(&self, w: &mut dyn Write) -> std::io::Result<()> {
        w.write_all(MAGIC)?;
        w.write_u8(KIND_ANNOUNCE)?;
        w.write_u8(0x00)?;

        write_device_name(w, &self.name)?;

        w.write_all(UNKNOWN_20)?;
        w.write_u8(self.device_id)?;
        w.write_u8(0x00)?;
        w.write_all(&self.mac_addr)?;
        w.write_all(&self.ip_addr)?;
        w.write_all(UNKNOWN_30)?;
        w.write_u8(self.device_type.as_byte())?;
        w.write_u8(0x00)?;

        Ok(())
    }

    fn parse_impl(i: Span) -> IResult<Span, AnnouncePacket> {
        let (i, _) = magic(i)?;
        let (i, _) = context("packet kind", tag(&[KIND_ANNOUNCE]))(i)?;
        let (i, _) = take(1usize)(i)?;
        let (i, name) = device_name(i)?;
        let (i, _) = take(4usize)(i)?;
        let (i, device_id) = be_u8(i)?;
        let (i, _) = take(1usize)(i)?;
        let (i, mac_addr) = mac_addr(i)?;
        let (i, ip_addr) = ip_addr(i)?;
        let (i, _) = take(4usize)(i)?;
        let (i, device_type) = be_u8(i)?;
        let (i, _) = take(1usize)(i)?;

        Ok((
            i,
            AnnouncePacket {
                name,
                device_id,
                device_type: DeviceType::from_byte(device_type),
                mac_addr,
                ip_addr,
            },
        ))
    }

    pub fn parse(data: &[u8]) -> Result<AnnouncePacket> {
        if data.len() != ANNOUNCE_PACKET_LEN {
            return Err(LinkError::Parse {
                error_kind: "Length".to_string(),
                pos: data.len(),
                dump: pretty_hex(&data),
            });
        }

        match Self::parse_impl(Span::new(data)) {
            Ok((_, pkt)) => Ok(pkt),
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(LinkError::Parse {
                error_kind: format!("{:?}", e.code),
                pos: e.input.location_offset(),
                dump: pretty_hex(&data),
            }),
            Err(e) => Err(LinkError::Parse {
                error_kind: format!("{}", e),
                pos: 0,
                dump: pretty_hex(&data),
            }),
        }
    }
}
