use shardnet_core::error::{codes, CoreError, ErrorCategory};
use shardnet_core::Result;

/// `b"SHRD"`, chosen so a bad peer or a misrouted byte stream fails fast on the very
/// first four bytes.
pub const MAGIC: u32 = 0x5348_5244;
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header size in bytes: magic(4) + version(1) + type(1) +
/// flags(2) + session id(8) + payload length(4) + checksum(4).
pub const HEADER_LEN: usize = 24;

/// Maximum envelope payload. Large messages fragment into `ceil(len / MAX_PAYLOAD)`
/// envelopes, each carrying its own header and checksum.
pub const MAX_PAYLOAD: usize = 256 * 1024;

pub const FLAG_FRAGMENT: u16 = 0b01;
pub const FLAG_END: u16 = 0b10;

const CHECKSUM_OFFSET: usize = 20;

/// A decoded envelope header. The checksum is validated separately, once
/// the payload bytes are available, since it covers header-without-checksum + payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub message_type: u8,
    pub flags: u16,
    pub session_id: u64,
    pub payload_len: u32,
    pub checksum: u32,
}

impl Header {
    pub fn is_fragment(&self) -> bool {
        self.flags & FLAG_FRAGMENT != 0
    }

    pub fn is_end(&self) -> bool {
        self.flags & FLAG_END != 0
    }

    /// Encodes the header (with checksum) for a payload already in hand, so the
    /// checksum can be computed over header-without-checksum + payload in one pass.
    pub fn encode(
        message_type: u8,
        flags: u16,
        session_id: u64,
        payload: &[u8],
    ) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4] = PROTOCOL_VERSION;
        buf[5] = message_type;
        buf[6..8].copy_from_slice(&flags.to_be_bytes());
        buf[8..16].copy_from_slice(&session_id.to_be_bytes());
        buf[16..20].copy_from_slice(&(payload.len() as u32).to_be_bytes());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[..CHECKSUM_OFFSET]);
        hasher.update(payload);
        let checksum = hasher.finalize();
        buf[20..24].copy_from_slice(&checksum.to_be_bytes());
        buf
    }

    /// Validates magic and version and parses the remaining fields. Does not check the
    /// checksum — that requires the payload, validated by [`Header::verify_checksum`].
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(CoreError::new(
                codes::WIRE_BAD_MAGIC,
                ErrorCategory::Protocol,
                format!("bad envelope magic {magic:#x}"),
            ));
        }
        let version = buf[4];
        if version != PROTOCOL_VERSION {
            return Err(CoreError::new(
                codes::WIRE_BAD_VERSION,
                ErrorCategory::Protocol,
                format!("unsupported protocol version {version}"),
            ));
        }
        let message_type = buf[5];
        let flags = u16::from_be_bytes(buf[6..8].try_into().unwrap());
        let session_id = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        let payload_len = u32::from_be_bytes(buf[16..20].try_into().unwrap());
        let checksum = u32::from_be_bytes(buf[20..24].try_into().unwrap());

        if payload_len as usize > MAX_PAYLOAD {
            return Err(CoreError::new(
                codes::WIRE_OVERSIZE_PAYLOAD,
                ErrorCategory::Protocol,
                format!("payload length {payload_len} exceeds MAX_PAYLOAD ({MAX_PAYLOAD})"),
            ));
        }

        Ok(Self {
            version,
            message_type,
            flags,
            session_id,
            payload_len,
            checksum,
        })
    }

    /// Recomputes the checksum over `header_bytes[..20] ++ payload` and compares it
    /// against the value this header carried.
    pub fn verify_checksum(&self, header_bytes: &[u8; HEADER_LEN], payload: &[u8]) -> Result<()> {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header_bytes[..CHECKSUM_OFFSET]);
        hasher.update(payload);
        let actual = hasher.finalize();
        if actual != self.checksum {
            return Err(CoreError::new(
                codes::WIRE_CHECKSUM_MISMATCH,
                ErrorCategory::Protocol,
                format!("checksum mismatch: header says {:#x}, computed {actual:#x}", self.checksum),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let payload = b"hello wire";
        let header_bytes = Header::encode(7, FLAG_END, 42, payload);
        let header = Header::decode(&header_bytes).expect("decode");
        assert_eq!(header.message_type, 7);
        assert_eq!(header.flags, FLAG_END);
        assert_eq!(header.session_id, 42);
        assert_eq!(header.payload_len, payload.len() as u32);
        header.verify_checksum(&header_bytes, payload).expect("checksum ok");
    }

    #[test]
    fn bad_magic_is_protocol_fault() {
        let mut header_bytes = Header::encode(1, 0, 1, b"x");
        header_bytes[0] ^= 0xFF;
        let err = Header::decode(&header_bytes).unwrap_err();
        assert_eq!(err.code(), codes::WIRE_BAD_MAGIC);
        assert_eq!(err.category(), ErrorCategory::Protocol);
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let payload = b"payload";
        let header_bytes = Header::encode(1, 0, 1, payload);
        let header = Header::decode(&header_bytes).expect("decode");
        let err = header.verify_checksum(&header_bytes, b"tampered").unwrap_err();
        assert_eq!(err.code(), codes::WIRE_CHECKSUM_MISMATCH);
    }

    #[test]
    fn oversize_payload_length_is_rejected_at_decode() {
        let mut header_bytes = Header::encode(1, 0, 1, b"");
        header_bytes[16..20].copy_from_slice(&((MAX_PAYLOAD as u32) + 1).to_be_bytes());
        let err = Header::decode(&header_bytes).unwrap_err();
        assert_eq!(err.code(), codes::WIRE_OVERSIZE_PAYLOAD);
    }
}
