//! Reads session statistics out of a classic libpcap capture file.
//!
//! A capture is scanned once. Every record counts towards the packet and byte totals, but only
//! IPv4 frames carrying TCP or UDP contribute a session. A session is identified by the unordered
//! pair of `(address, port)` endpoints plus the transport protocol, so both directions of a flow
//! count as one session.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use serde::Serialize;

use crate::error::CaptureError;

const PCAP_MAGIC_MICROS: u32 = 0xa1b2_c3d4;
const PCAP_MAGIC_NANOS: u32 = 0xa1b2_3c4d;
const GLOBAL_HEADER_LEN: usize = 24;
const RECORD_HEADER_LEN: usize = 16;
/// Larger than any snap length libpcap writes.
const MAX_RECORD_LEN: usize = 0x0400_0000;

const LINKTYPE_ETHERNET: u32 = 1;
const LINKTYPE_RAW: u32 = 101;
const LINKTYPE_IPV4: u32 = 228;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// Statistics for a single pass ("loop") through a capture file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStatistics {
    pub packets_per_loop: u64,
    pub bytes_per_loop: u64,
    pub sessions_per_loop: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum Transport {
    Tcp,
    Udp,
}

type Endpoint = (Ipv4Addr, u16);

#[derive(Debug, PartialEq, Eq, Hash)]
struct SessionKey {
    low: Endpoint,
    high: Endpoint,
    transport: Transport,
}

impl SessionKey {
    fn new(a: Endpoint, b: Endpoint, transport: Transport) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            low,
            high,
            transport,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Endian {
    Little,
    Big,
}

impl Endian {
    fn u32(self, buf: &[u8]) -> u32 {
        match self {
            Endian::Little => LittleEndian::read_u32(buf),
            Endian::Big => BigEndian::read_u32(buf),
        }
    }
}

impl SessionStatistics {
    /// Scan the capture file at `path`.
    pub fn scan(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref();
        log::debug!("Scanning capture file {}", path.display());

        let file = File::open(path).map_err(|source| CaptureError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let stats = Self::from_reader(BufReader::new(file), path)?;

        log::info!(
            "Capture {} has {} packets, {} bytes and {} sessions per loop",
            path.display(),
            stats.packets_per_loop,
            stats.bytes_per_loop,
            stats.sessions_per_loop
        );
        Ok(stats)
    }

    /// Scan a capture from any reader. `path` is only used to label errors.
    pub fn from_reader<R: Read>(mut reader: R, path: &Path) -> Result<Self, CaptureError> {
        let io_err = |source| CaptureError::Io {
            path: path.to_path_buf(),
            source,
        };
        let format_err = |reason: String| CaptureError::Format {
            path: path.to_path_buf(),
            reason,
        };

        let mut header = [0u8; GLOBAL_HEADER_LEN];
        reader.read_exact(&mut header).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                format_err("file is shorter than the pcap global header".to_string())
            } else {
                io_err(e)
            }
        })?;

        let endian = match LittleEndian::read_u32(&header[0..4]) {
            PCAP_MAGIC_MICROS | PCAP_MAGIC_NANOS => Endian::Little,
            m if m.swap_bytes() == PCAP_MAGIC_MICROS || m.swap_bytes() == PCAP_MAGIC_NANOS => {
                Endian::Big
            }
            m => return Err(format_err(format!("bad magic number {m:#010x}"))),
        };
        let link_type = endian.u32(&header[20..24]);

        let mut packets = 0u64;
        let mut bytes = 0u64;
        let mut sessions = HashSet::new();

        let mut record = [0u8; RECORD_HEADER_LEN];
        let mut frame = Vec::new();
        loop {
            match read_full(&mut reader, &mut record).map_err(io_err)? {
                0 => break,
                n if n < RECORD_HEADER_LEN => {
                    log::warn!(
                        "Capture {} ends with a truncated record header, ignoring it",
                        path.display()
                    );
                    break;
                }
                _ => {}
            }

            let captured_len = endian.u32(&record[8..12]) as usize;
            if captured_len > MAX_RECORD_LEN {
                return Err(format_err(format!(
                    "record {} claims {captured_len} captured bytes",
                    packets + 1
                )));
            }
            frame.resize(captured_len, 0);
            if read_full(&mut reader, &mut frame).map_err(io_err)? < captured_len {
                log::warn!(
                    "Capture {} ends with a truncated record, ignoring it",
                    path.display()
                );
                break;
            }

            packets += 1;
            bytes += captured_len as u64;

            if let Some(key) = session_key(link_type, &frame) {
                sessions.insert(key);
            }
        }

        Ok(Self {
            packets_per_loop: packets,
            bytes_per_loop: bytes,
            sessions_per_loop: sessions.len() as u64,
        })
    }
}

/// Fill `buf` as far as the reader allows, returning how many bytes were read. Fewer than
/// `buf.len()` means the input ended.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn session_key(link_type: u32, frame: &[u8]) -> Option<SessionKey> {
    match link_type {
        LINKTYPE_ETHERNET => ipv4_payload_of_ethernet(frame).and_then(ipv4_session),
        LINKTYPE_RAW | LINKTYPE_IPV4 => ipv4_session(frame),
        _ => None,
    }
}

fn ipv4_payload_of_ethernet(frame: &[u8]) -> Option<&[u8]> {
    let mut offset = 12;
    loop {
        let ether_type = BigEndian::read_u16(frame.get(offset..offset + 2)?);
        offset += 2;
        match ether_type {
            ETHERTYPE_VLAN | ETHERTYPE_QINQ => offset += 2,
            ETHERTYPE_IPV4 => return frame.get(offset..),
            _ => return None,
        }
    }
}

fn ipv4_session(packet: &[u8]) -> Option<SessionKey> {
    let version_ihl = *packet.first()?;
    if version_ihl >> 4 != 4 {
        return None;
    }
    let header_len = usize::from(version_ihl & 0x0f) * 4;
    if header_len < 20 || packet.len() < header_len {
        return None;
    }

    // Only the first fragment carries the transport header.
    let fragment_offset = BigEndian::read_u16(&packet[6..8]) & 0x1fff;
    if fragment_offset != 0 {
        return None;
    }

    let (transport, min_len) = match packet[9] {
        IPPROTO_TCP => (Transport::Tcp, 20),
        IPPROTO_UDP => (Transport::Udp, 8),
        _ => return None,
    };

    let src = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);

    let segment = &packet[header_len..];
    if segment.len() < min_len {
        return None;
    }
    let src_port = BigEndian::read_u16(&segment[0..2]);
    let dst_port = BigEndian::read_u16(&segment[2..4]);

    Some(SessionKey::new((src, src_port), (dst, dst_port), transport))
}

#[cfg(test)]
pub(crate) mod test_capture {
    //! Helpers for writing small synthetic captures in tests.

    use std::net::Ipv4Addr;

    pub(crate) enum Frame {
        Tcp(Ipv4Addr, u16, Ipv4Addr, u16),
        Udp(Ipv4Addr, u16, Ipv4Addr, u16),
        Arp,
    }

    fn ipv4_frame(proto: u8, src: Ipv4Addr, sport: u16, dst: Ipv4Addr, dport: u16) -> Vec<u8> {
        let transport_len = if proto == 6 { 20 } else { 8 };
        let mut buf = vec![0u8; 12];
        buf.extend_from_slice(&0x0800u16.to_be_bytes());
        let total_len = (20 + transport_len) as u16;
        buf.extend_from_slice(&[0x45, 0]);
        buf.extend_from_slice(&total_len.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0, 64, proto, 0, 0]);
        buf.extend_from_slice(&src.octets());
        buf.extend_from_slice(&dst.octets());
        buf.extend_from_slice(&sport.to_be_bytes());
        buf.extend_from_slice(&dport.to_be_bytes());
        buf.extend(std::iter::repeat(0).take(transport_len - 4));
        buf
    }

    /// Build a little-endian, microsecond pcap with an Ethernet link type.
    pub(crate) fn build(frames: &[Frame]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&65535u32.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());

        for (i, frame) in frames.iter().enumerate() {
            let data = match frame {
                Frame::Tcp(s, sp, d, dp) => ipv4_frame(6, *s, *sp, *d, *dp),
                Frame::Udp(s, sp, d, dp) => ipv4_frame(17, *s, *sp, *d, *dp),
                Frame::Arp => {
                    let mut buf = vec![0u8; 12];
                    buf.extend_from_slice(&0x0806u16.to_be_bytes());
                    buf.extend(std::iter::repeat(0).take(28));
                    buf
                }
            };
            out.extend_from_slice(&(i as u32).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&data);
        }
        out
    }
}
