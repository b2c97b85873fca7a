use anyhow::{Result, anyhow};

/// TFTP opcodes per RFC 1350.
pub const OPCODE_RRQ: u16 = 1;
pub const OPCODE_WRQ: u16 = 2;
pub const OPCODE_DATA: u16 = 3;
pub const OPCODE_ACK: u16 = 4;
pub const OPCODE_ERROR: u16 = 5;

/// Data payload per DATA packet (RFC 1350).
pub const BLOCK_SIZE: usize = 512;

/// Largest datagram a listener will look at. Requests beyond one MTU are
/// not valid RRQs anyway.
pub const MAX_REQUEST: usize = 1500;

/// TFTP error code 0: see the message for details.
pub const ERR_NOT_DEFINED: u16 = 0;
/// TFTP error code 1: file not found.
pub const ERR_FILE_NOT_FOUND: u16 = 1;

/// A parsed TFTP packet, restricted to the subset this server speaks:
/// RRQ and ACK inbound, DATA and ERROR outbound. WRQ and the RFC 2347
/// option extensions are recognized by opcode only and never parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum Packet {
    RRQ { filename: String, mode: String },
    DATA { block_num: u16, data: Vec<u8> },
    ACK { block_num: u16 },
    ERROR { code: u16, msg: String },
}

impl Packet {
    /// Parse raw bytes into a `Packet`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(anyhow!("packet too short"));
        }
        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        match opcode {
            OPCODE_RRQ => parse_request(buf),
            OPCODE_DATA => parse_data(buf),
            OPCODE_ACK => parse_ack(buf),
            OPCODE_ERROR => parse_error(buf),
            _ => Err(anyhow!("unsupported opcode {opcode}")),
        }
    }

    /// Serialize the packet to bytes for transmission.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Packet::RRQ { filename, mode } => {
                let mut buf = Vec::with_capacity(4 + filename.len() + mode.len());
                buf.extend_from_slice(&OPCODE_RRQ.to_be_bytes());
                buf.extend_from_slice(filename.as_bytes());
                buf.push(0);
                buf.extend_from_slice(mode.as_bytes());
                buf.push(0);
                buf
            }
            Packet::DATA { block_num, data } => {
                let mut buf = Vec::with_capacity(4 + data.len());
                buf.extend_from_slice(&OPCODE_DATA.to_be_bytes());
                buf.extend_from_slice(&block_num.to_be_bytes());
                buf.extend_from_slice(data);
                buf
            }
            Packet::ACK { block_num } => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&OPCODE_ACK.to_be_bytes());
                buf.extend_from_slice(&block_num.to_be_bytes());
                buf
            }
            Packet::ERROR { code, msg } => {
                let mut buf = Vec::with_capacity(5 + msg.len());
                buf.extend_from_slice(&OPCODE_ERROR.to_be_bytes());
                buf.extend_from_slice(&code.to_be_bytes());
                buf.extend_from_slice(msg.as_bytes());
                buf.push(0);
                buf
            }
        }
    }
}

/// Parse RRQ: 2-byte opcode | filename\0 | mode\0
///
/// The filename must be NUL-terminated inside the packet; the mode may run
/// to the end of the datagram without one. Any RFC 2347 option fields after
/// the mode are ignored.
fn parse_request(buf: &[u8]) -> Result<Packet> {
    let payload = &buf[2..];
    let mut fields = payload.split(|&b| b == 0);

    let filename = fields.next().ok_or_else(|| anyhow!("missing filename"))?;
    // The filename field consumed the whole payload, so it had no
    // terminating NUL and there is no mode.
    if filename.len() == payload.len() {
        return Err(anyhow!("missing mode"));
    }
    let mode = fields.next().ok_or_else(|| anyhow!("missing mode"))?;

    let filename = String::from_utf8(filename.to_vec())?;
    let mode = String::from_utf8(mode.to_vec())?.to_ascii_lowercase();

    if filename.is_empty() {
        return Err(anyhow!("empty filename"));
    }

    Ok(Packet::RRQ { filename, mode })
}

/// Parse DATA: 2-byte opcode | 2-byte block# | 0..512 bytes
fn parse_data(buf: &[u8]) -> Result<Packet> {
    if buf.len() < 4 {
        return Err(anyhow!("DATA packet too short"));
    }
    let block_num = u16::from_be_bytes([buf[2], buf[3]]);
    let data = buf[4..].to_vec();
    Ok(Packet::DATA { block_num, data })
}

/// Parse ACK: 2-byte opcode | 2-byte block#
fn parse_ack(buf: &[u8]) -> Result<Packet> {
    if buf.len() < 4 {
        return Err(anyhow!("ACK packet too short"));
    }
    let block_num = u16::from_be_bytes([buf[2], buf[3]]);
    Ok(Packet::ACK { block_num })
}

/// Parse ERROR: 2-byte opcode | 2-byte code | msg\0
fn parse_error(buf: &[u8]) -> Result<Packet> {
    if buf.len() < 5 {
        return Err(anyhow!("ERROR packet too short"));
    }
    let code = u16::from_be_bytes([buf[2], buf[3]]);
    let msg_bytes = &buf[4..];
    // Strip trailing NUL if present.
    let end = msg_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(msg_bytes.len());
    let msg = String::from_utf8_lossy(&msg_bytes[..end]).to_string();
    Ok(Packet::ERROR { code, msg })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_rrq() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(b"hello.txt\0octet\0");
        match Packet::from_bytes(&buf).unwrap() {
            Packet::RRQ { filename, mode } => {
                assert_eq!(filename, "hello.txt");
                assert_eq!(mode, "octet");
            }
            other => panic!("expected RRQ, got {other:?}"),
        }
    }

    #[test]
    fn parse_rrq_lowercases_mode() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(b"a.bin\0NetAscii\0");
        match Packet::from_bytes(&buf).unwrap() {
            Packet::RRQ { mode, .. } => assert_eq!(mode, "netascii"),
            other => panic!("expected RRQ, got {other:?}"),
        }
    }

    #[test]
    fn parse_rrq_ignores_trailing_options() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(b"fw.bin\0octet\0blksize\08192\0");
        match Packet::from_bytes(&buf).unwrap() {
            Packet::RRQ { filename, mode } => {
                assert_eq!(filename, "fw.bin");
                assert_eq!(mode, "octet");
            }
            other => panic!("expected RRQ, got {other:?}"),
        }
    }

    #[test]
    fn parse_rrq_rejects_unterminated_filename() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(b"no-nul-anywhere");
        assert!(Packet::from_bytes(&buf).is_err());
    }

    #[test]
    fn parse_rrq_rejects_empty_filename() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(b"\0octet\0");
        assert!(Packet::from_bytes(&buf).is_err());
    }

    #[test]
    fn rejects_wrq_and_unknown_opcodes() {
        let mut wrq = Vec::new();
        wrq.extend_from_slice(&OPCODE_WRQ.to_be_bytes());
        wrq.extend_from_slice(b"f\0octet\0");
        assert!(Packet::from_bytes(&wrq).is_err());
        assert!(Packet::from_bytes(&9u16.to_be_bytes()).is_err());
        assert!(Packet::from_bytes(&[1]).is_err());
    }

    #[test]
    fn ack_round_trip() {
        let bytes = Packet::ACK { block_num: 7 }.to_bytes();
        assert_eq!(bytes, vec![0, 4, 0, 7]);
        match Packet::from_bytes(&bytes).unwrap() {
            Packet::ACK { block_num } => assert_eq!(block_num, 7),
            other => panic!("expected ACK, got {other:?}"),
        }
    }

    #[test]
    fn truncated_ack_is_rejected() {
        assert!(Packet::from_bytes(&[0, 4, 0]).is_err());
    }

    #[test]
    fn error_packet_layout() {
        let bytes = Packet::ERROR {
            code: ERR_FILE_NOT_FOUND,
            msg: "File not found".into(),
        }
        .to_bytes();
        assert_eq!(&bytes[..4], &[0, 5, 0, 1]);
        assert_eq!(&bytes[4..], b"File not found\0");
    }

    #[test]
    fn data_packet_layout() {
        let bytes = Packet::DATA {
            block_num: 258,
            data: vec![0xaa, 0xbb],
        }
        .to_bytes();
        assert_eq!(bytes, vec![0, 3, 1, 2, 0xaa, 0xbb]);
    }
}
