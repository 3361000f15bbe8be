use bytes::{BufMut, Bytes, BytesMut};

pub const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_LEN: usize = 12;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Rtp,
    Rtcp,
}

/// Demultiplexes RTP and RTCP sharing one port (RFC 5761 §4): the second
/// byte of RTCP carries packet types 192..=223, which read as an RTP
/// marker + payload type land in 64..=95.
pub fn classify(data: &[u8]) -> Option<PacketKind> {
    if data.len() < 2 || data[0] >> 6 != RTP_VERSION {
        return None;
    }
    let payload_type = data[1] & 0x7f;
    if (64..=95).contains(&payload_type) {
        Some(PacketKind::Rtcp)
    } else {
        Some(PacketKind::Rtp)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    /// Offset of the payload, after CSRCs and the extension block.
    pub payload_offset: usize,
    /// Padding bytes trailing the payload.
    pub padding: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RtpParseError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("unsupported rtp version {0}")]
    Version(u8),
    #[error("bad padding length")]
    Padding,
}

impl RtpHeader {
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            payload_offset: RTP_HEADER_LEN,
            padding: 0,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, RtpParseError> {
        if data.len() < RTP_HEADER_LEN {
            return Err(RtpParseError::TooShort(data.len()));
        }
        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(RtpParseError::Version(version));
        }
        let has_padding = data[0] & 0x20 != 0;
        let has_extension = data[0] & 0x10 != 0;
        let csrc_count = (data[0] & 0x0f) as usize;

        let mut offset = RTP_HEADER_LEN + csrc_count * 4;
        if has_extension {
            if data.len() < offset + 4 {
                return Err(RtpParseError::TooShort(data.len()));
            }
            let words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + words * 4;
        }
        if data.len() < offset {
            return Err(RtpParseError::TooShort(data.len()));
        }

        let padding = if has_padding {
            let n = data[data.len() - 1] as usize;
            if n == 0 || offset + n > data.len() {
                return Err(RtpParseError::Padding);
            }
            n
        } else {
            0
        };

        Ok(Self {
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7f,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            payload_offset: offset,
            padding,
        })
    }

    pub fn payload<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.payload_offset..data.len() - self.padding]
    }

    /// Serializes a plain header (no CSRC, no extension) followed by `payload`.
    pub fn to_bytes(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(RTP_HEADER_LEN + payload.len());
        buf.put_u8(RTP_VERSION << 6);
        buf.put_u8((self.marker as u8) << 7 | (self.payload_type & 0x7f));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        buf.put_slice(payload);
        buf.freeze()
    }
}

pub fn set_payload_type(data: &mut [u8], payload_type: u8) {
    if data.len() >= 2 {
        data[1] = (data[1] & 0x80) | (payload_type & 0x7f);
    }
}

pub fn set_sequence(data: &mut [u8], sequence: u16) {
    if data.len() >= 4 {
        data[2..4].copy_from_slice(&sequence.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_splits_rtp_and_rtcp() {
        let rtp = RtpHeader::new(96, 1, 0, 42).to_bytes(b"x");
        assert_eq!(classify(&rtp), Some(PacketKind::Rtp));

        // receiver report, PT 201
        let rr = [0x80u8, 201, 0, 1, 0, 0, 0, 42];
        assert_eq!(classify(&rr), Some(PacketKind::Rtcp));
        // sender report with marker-like bit pattern, PT 200
        let sr = [0x81u8, 200, 0, 6];
        assert_eq!(classify(&sr), Some(PacketKind::Rtcp));

        assert_eq!(classify(&[0x00, 96]), None);
        assert_eq!(classify(&[0x80]), None);
    }

    #[test]
    fn parse_reads_fixed_fields() {
        let mut header = RtpHeader::new(111, 0xbeef, 0x01020304, 0xdeadbeef);
        header.marker = true;
        let data = header.to_bytes(&[1, 2, 3]);

        let parsed = RtpHeader::parse(&data).unwrap();
        assert!(parsed.marker);
        assert_eq!(parsed.payload_type, 111);
        assert_eq!(parsed.sequence, 0xbeef);
        assert_eq!(parsed.timestamp, 0x01020304);
        assert_eq!(parsed.ssrc, 0xdeadbeef);
        assert_eq!(parsed.payload(&data), &[1, 2, 3]);
    }

    #[test]
    fn parse_skips_csrcs_extension_and_padding() {
        let mut data = vec![0x80 | 0x20 | 0x10 | 0x01, 96, 0, 1, 0, 0, 0, 0, 0, 0, 0, 7];
        data.extend_from_slice(&[0, 0, 0, 9]); // csrc
        data.extend_from_slice(&[0xbe, 0xde, 0, 1, 0xaa, 0xbb, 0xcc, 0xdd]); // one-word extension
        data.extend_from_slice(&[5, 6]); // payload
        data.extend_from_slice(&[0, 2]); // padding, last byte is the count

        let parsed = RtpHeader::parse(&data).unwrap();
        assert_eq!(parsed.ssrc, 7);
        assert_eq!(parsed.payload(&data), &[5, 6]);
    }

    #[test]
    fn parse_rejects_truncated_packets() {
        assert_eq!(RtpHeader::parse(&[0x80, 96]), Err(RtpParseError::TooShort(2)));
        let mut data = RtpHeader::new(96, 1, 0, 1).to_bytes(&[]).to_vec();
        data[0] |= 0x02; // two csrcs that are not there
        assert!(RtpHeader::parse(&data).is_err());
        data[0] = 0x40;
        assert_eq!(RtpHeader::parse(&data), Err(RtpParseError::Version(1)));
    }

    #[test]
    fn rewrite_helpers_keep_marker() {
        let mut header = RtpHeader::new(97, 10, 0, 1);
        header.marker = true;
        let mut data = header.to_bytes(&[]).to_vec();
        set_payload_type(&mut data, 96);
        set_sequence(&mut data, 500);
        let parsed = RtpHeader::parse(&data).unwrap();
        assert!(parsed.marker);
        assert_eq!(parsed.payload_type, 96);
        assert_eq!(parsed.sequence, 500);
    }
}
