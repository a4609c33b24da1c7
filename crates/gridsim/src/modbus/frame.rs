//! MBAP framing
//!
//! ```text
//! ┌────────────────┬─────────────┬────────────┬─────────┬───────────┐
//! │ transaction id │ protocol id │ length     │ unit id │ PDU ...   │
//! │ 2 bytes BE     │ 2 bytes = 0 │ 2 bytes BE │ 1 byte  │ length-1  │
//! └────────────────┴─────────────┴────────────┴─────────┴───────────┘
//! ```
//!
//! `length` counts the unit id plus the PDU.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the MBAP header in bytes
pub const MBAP_HEADER_LEN: usize = 7;

/// Largest PDU permitted by the Modbus specification
pub const MAX_PDU_LEN: usize = 253;

/// Decoded MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count of unit id + PDU
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    /// Parse the first seven bytes of `bytes`
    pub fn parse(mut bytes: &[u8]) -> Option<Self> {
        if bytes.len() < MBAP_HEADER_LEN {
            return None;
        }
        Some(Self {
            transaction_id: bytes.get_u16(),
            protocol_id: bytes.get_u16(),
            length: bytes.get_u16(),
            unit_id: bytes.get_u8(),
        })
    }

    /// Append the header to `dst`
    pub fn write(&self, dst: &mut BytesMut) {
        dst.put_u16(self.transaction_id);
        dst.put_u16(self.protocol_id);
        dst.put_u16(self.length);
        dst.put_u8(self.unit_id);
    }
}

/// One complete application data unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adu {
    pub header: MbapHeader,
    pub pdu: Bytes,
}

/// Framing failure; the stream cannot be resynchronised
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("Unsupported protocol id {0}")]
    ProtocolId(u16),

    #[error("Invalid MBAP length {0}")]
    Length(u16),
}

/// Split the next complete ADU off the front of `buf`
///
/// Returns `Ok(None)` while more bytes are needed. Only a foreign protocol
/// id or an oversize length is a framing error.
pub fn next_frame(buf: &mut BytesMut) -> Result<Option<Adu>, FrameError> {
    let Some(header) = MbapHeader::parse(&buf[..]) else {
        return Ok(None);
    };
    if header.protocol_id != 0 {
        return Err(FrameError::ProtocolId(header.protocol_id));
    }
    // A length below 2 carries no function code; the frame still ends at
    // the unit id and is answered as an empty PDU
    let pdu_len = (header.length as usize).saturating_sub(1);
    if pdu_len > MAX_PDU_LEN {
        return Err(FrameError::Length(header.length));
    }
    if buf.len() < MBAP_HEADER_LEN + pdu_len {
        return Ok(None);
    }

    buf.advance(MBAP_HEADER_LEN);
    let pdu = buf.split_to(pdu_len).freeze();
    Ok(Some(Adu { header, pdu }))
}

/// Wrap a PDU in an MBAP header
pub fn encode_adu(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Bytes {
    let mut dst = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    MbapHeader {
        transaction_id,
        protocol_id: 0,
        length: (pdu.len() + 1) as u16,
        unit_id,
    }
    .write(&mut dst);
    dst.put_slice(pdu);
    dst.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waits_for_complete_frame() {
        let adu = encode_adu(0x0102, 7, &[0x03, 0x00, 0x00, 0x00, 0x02]);
        let mut buf = BytesMut::from(&adu[..9]);
        assert_eq!(next_frame(&mut buf).unwrap(), None);

        buf.extend_from_slice(&adu[9..]);
        let frame = next_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.transaction_id, 0x0102);
        assert_eq!(frame.header.unit_id, 7);
        assert_eq!(frame.header.length, 6);
        assert_eq!(&frame.pdu[..], &[0x03, 0x00, 0x00, 0x00, 0x02]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_splits_back_to_back_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_adu(1, 1, &[0x01, 0x00, 0x00, 0x00, 0x08]));
        buf.extend_from_slice(&encode_adu(2, 1, &[0x04, 0x00, 0x10, 0x00, 0x01]));
        assert_eq!(next_frame(&mut buf).unwrap().unwrap().header.transaction_id, 1);
        assert_eq!(next_frame(&mut buf).unwrap().unwrap().header.transaction_id, 2);
        assert_eq!(next_frame(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_unit_id_only_frame_has_empty_pdu() {
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01, 0x00][..]);
        let frame = next_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.transaction_id, 1);
        assert_eq!(frame.header.unit_id, 1);
        assert!(frame.pdu.is_empty());
        assert_eq!(&buf[..], &[0x00]);
    }

    #[test]
    fn test_rejects_oversize_length() {
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01][..]);
        assert_eq!(next_frame(&mut buf), Err(FrameError::Length(256)));
    }

    #[test]
    fn test_rejects_foreign_protocol_id() {
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00, 0x05, 0x00, 0x02, 0x01, 0x03][..]);
        assert_eq!(next_frame(&mut buf), Err(FrameError::ProtocolId(5)));
    }
}
