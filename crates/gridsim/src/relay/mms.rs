//! Simulated MMS association
//!
//! Just enough TPKT/COTP/Session/ACSE/MMS to let an IEC 61850 client open
//! an association and list logical devices. Messages are recognized by
//! their leading tag bytes; nothing here is a general BER codec.
//!
//! ```text
//! TPKT  03 00 LL LL
//!  └─ COTP CR  LI E0 ..                  → fixed CC
//!  └─ COTP DT  02 F0 80
//!       ├─ A8 ..                         → fixed Initiate-Response
//!       ├─ 0D .. 60 .. BE .. A8 ..       → mirrored, 0E / 61 / A9
//!       ├─ 01 00 01 00 61 .. A0 <mms>    → <mms> answered, re-wrapped
//!       └─ <mms>                         → answered directly
//! ```

use bytes::{BufMut, Bytes, BytesMut};

pub const TPKT_HEADER_LEN: usize = 4;
const TPKT_VERSION: u8 = 0x03;

const COTP_CR: u8 = 0xE0;
const COTP_CC: u8 = 0xD0;
const COTP_DT: u8 = 0xF0;
const COTP_DT_HEADER: [u8; 3] = [0x02, COTP_DT, 0x80];

const SPDU_CONNECT: u8 = 0x0D;
const SPDU_ACCEPT: u8 = 0x0E;
const SPDU_DATA: [u8; 4] = [0x01, 0x00, 0x01, 0x00];

const AARQ: u8 = 0x60;
const AARE: u8 = 0x61;
const USER_INFORMATION: u8 = 0xBE;

const CONFIRMED_REQUEST: u8 = 0xA0;
const CONFIRMED_RESPONSE: u8 = 0xA1;
const REJECT: u8 = 0xA4;
const INITIATE_REQUEST: u8 = 0xA8;
const INITIATE_RESPONSE: u8 = 0xA9;
const CONCLUDE_REQUEST: u8 = 0x8B;
const CONCLUDE_RESPONSE: u8 = 0x8C;
const GET_NAME_LIST: u8 = 0xA1;

/// Presentation context id carrying MMS
const MMS_CONTEXT_ID: u8 = 0x03;

/// Name reported when no IED model is registered
pub const PLACEHOLDER_DOMAIN: &str = "SIMULATED";

/// Initiate-Response: 65000-byte PDUs, 5 outstanding each way, nesting 10,
/// version 1 with the parameter CBB and service bitmaps clients expect
const INITIATE_RESPONSE_PDU: [u8; 40] = [
    0xA9, 0x26, 0x80, 0x03, 0x00, 0xFD, 0xE8, 0x81, 0x01, 0x05, 0x82, 0x01, 0x05, 0x83, 0x01,
    0x0A, 0xA4, 0x16, 0x80, 0x01, 0x01, 0x81, 0x03, 0x05, 0xF1, 0x00, 0x82, 0x0C, 0x03, 0xEE,
    0x1C, 0x00, 0x00, 0x04, 0x08, 0x00, 0x00, 0x79, 0xEF, 0x18,
];

// ─────────────────────────────────────────────────────────────────────────────
// TPKT framing
// ─────────────────────────────────────────────────────────────────────────────

/// A TPKT header that cannot be resynchronized
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TpktError {
    #[error("bad TPKT version {0:#04x}")]
    Version(u8),

    #[error("bad TPKT length {0}")]
    Length(u16),
}

/// Split the next complete TPKT packet off `buf`, header included
pub fn next_tpkt(buf: &mut BytesMut) -> Result<Option<Bytes>, TpktError> {
    if buf.len() < TPKT_HEADER_LEN {
        return Ok(None);
    }
    if buf[0] != TPKT_VERSION {
        return Err(TpktError::Version(buf[0]));
    }
    let length = u16::from_be_bytes([buf[2], buf[3]]);
    if (length as usize) < TPKT_HEADER_LEN + 2 {
        return Err(TpktError::Length(length));
    }
    if buf.len() < length as usize {
        return Ok(None);
    }
    Ok(Some(buf.split_to(length as usize).freeze()))
}

/// Wrap a COTP TPDU in a TPKT header
pub fn tpkt(tpdu: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(TPKT_HEADER_LEN + tpdu.len());
    out.put_u8(TPKT_VERSION);
    out.put_u8(0);
    out.put_u16((TPKT_HEADER_LEN + tpdu.len()) as u16);
    out.put_slice(tpdu);
    out.freeze()
}

/// A COTP DT TPDU (last data unit) in a TPKT
pub fn data_tpkt(payload: &[u8]) -> Bytes {
    let mut tpdu = Vec::with_capacity(COTP_DT_HEADER.len() + payload.len());
    tpdu.extend_from_slice(&COTP_DT_HEADER);
    tpdu.extend_from_slice(payload);
    tpkt(&tpdu)
}

// ─────────────────────────────────────────────────────────────────────────────
// BER helpers
// ─────────────────────────────────────────────────────────────────────────────

fn push_len(out: &mut Vec<u8>, len: usize) {
    match len {
        0..=0x7F => out.push(len as u8),
        0x80..=0xFF => out.extend_from_slice(&[0x81, len as u8]),
        _ => out.extend_from_slice(&[0x82, (len >> 8) as u8, len as u8]),
    }
}

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len() + 4);
    out.push(tag);
    push_len(&mut out, content.len());
    out.extend_from_slice(content);
    out
}

/// Parse one single-byte-tag TLV; returns (tag, content, rest)
fn read_tlv(input: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, rest) = input.split_first()?;
    let (&first, rest) = rest.split_first()?;
    let (len, rest) = match first {
        0x00..=0x7F => (first as usize, rest),
        0x81 => (*rest.first()? as usize, &rest[1..]),
        0x82 if rest.len() >= 2 => (u16::from_be_bytes([rest[0], rest[1]]) as usize, &rest[2..]),
        _ => return None,
    };
    if rest.len() < len {
        return None;
    }
    Some((tag, &rest[..len], &rest[len..]))
}

/// Index of the first `tag` at or after `from` whose TLV fits in `bytes`
fn find_tag(bytes: &[u8], tag: u8, from: usize) -> Option<usize> {
    (from..bytes.len()).find(|&i| bytes[i] == tag && read_tlv(&bytes[i..]).is_some())
}

// ─────────────────────────────────────────────────────────────────────────────
// Packet classification
// ─────────────────────────────────────────────────────────────────────────────

/// How the MMS PDU was carried, so the reply can be carried the same way
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Carrier {
    /// Directly after the COTP DT header
    Bare,
    /// Session DATA SPDU with fully-encoded presentation user data
    Session,
}

/// Answer produced for one inbound TPKT packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    /// Short name used in `IEC_TRACE`
    pub kind: &'static str,
    /// Complete TPKT packet to send back, if any
    pub reply: Option<Bytes>,
}

impl Exchange {
    fn new(kind: &'static str, reply: Option<Bytes>) -> Self {
        Self { kind, reply }
    }
}

/// Logical-device names the simulator can report
#[derive(Debug, Clone, Copy)]
pub struct Domains<'a> {
    pub first: Option<&'a str>,
    pub count: usize,
}

/// Answer one complete TPKT packet
pub fn respond(packet: &[u8], domains: Domains<'_>) -> Exchange {
    let Some(cotp) = packet.get(TPKT_HEADER_LEN..) else {
        return Exchange::new("unknown", None);
    };
    let (Some(&li), Some(&code)) = (cotp.first(), cotp.get(1)) else {
        return Exchange::new("unknown", None);
    };

    match code & 0xF0 {
        COTP_CR => Exchange::new("cotp-cr", connection_confirm(cotp).map(|cc| tpkt(&cc))),
        COTP_DT => {
            let payload = cotp.get(1 + li as usize..).unwrap_or_default();
            respond_data(payload, domains)
        }
        _ => Exchange::new("unknown", None),
    }
}

/// COTP CC for a CR: echo the caller's reference, class 0, TPDU size 1024
fn connection_confirm(cr: &[u8]) -> Option<Vec<u8>> {
    let src_ref = cr.get(4..6)?;
    Some(vec![
        0x09, COTP_CC, src_ref[0], src_ref[1], 0x00, 0x01, 0x00, 0xC0, 0x01, 0x0A,
    ])
}

fn respond_data(payload: &[u8], domains: Domains<'_>) -> Exchange {
    match payload.first() {
        Some(&INITIATE_REQUEST) => Exchange::new(
            "initiate",
            Some(data_tpkt(&INITIATE_RESPONSE_PDU)),
        ),
        Some(&SPDU_CONNECT) => Exchange::new(
            "session-connect",
            mirror_connect(payload).map(|accept| data_tpkt(&accept)),
        ),
        Some(_) if payload.starts_with(&SPDU_DATA) => {
            match unwrap_presentation(&payload[SPDU_DATA.len()..]) {
                Some(mms) => respond_mms(mms, domains, Carrier::Session),
                None => Exchange::new("unknown", None),
            }
        }
        Some(_) => respond_mms(payload, domains, Carrier::Bare),
        None => Exchange::new("unknown", None),
    }
}

/// Turn a session CONNECT carrying an AARQ into an ACCEPT carrying an AARE
///
/// The request bytes are echoed with only the tags rewritten.
pub fn mirror_connect(connect: &[u8]) -> Option<Vec<u8>> {
    let mut accept = connect.to_vec();
    *accept.first_mut()? = SPDU_ACCEPT;
    let aarq = find_tag(&accept, AARQ, 1)?;
    accept[aarq] = AARE;
    let initiate = find_tag(&accept, USER_INFORMATION, aarq + 1)
        .and_then(|ui| find_tag(&accept, INITIATE_REQUEST, ui + 1))
        .or_else(|| find_tag(&accept, INITIATE_REQUEST, aarq + 1))?;
    accept[initiate] = INITIATE_RESPONSE;
    Some(accept)
}

/// `61 L 30 L 02 01 03 A0 L <mms>` → `<mms>`
fn unwrap_presentation(user_data: &[u8]) -> Option<&[u8]> {
    let (tag, fully_encoded, _) = read_tlv(user_data)?;
    if tag != 0x61 {
        return None;
    }
    let (tag, pdv_list, _) = read_tlv(fully_encoded)?;
    if tag != 0x30 {
        return None;
    }
    let (tag, context_id, rest) = read_tlv(pdv_list)?;
    if tag != 0x02 || context_id != [MMS_CONTEXT_ID] {
        return None;
    }
    let (tag, mms, _) = read_tlv(rest)?;
    (tag == 0xA0).then_some(mms)
}

fn wrap_presentation(mms: &[u8]) -> Vec<u8> {
    let mut pdv = vec![0x02, 0x01, MMS_CONTEXT_ID];
    pdv.extend(tlv(0xA0, mms));
    let mut out = SPDU_DATA.to_vec();
    out.extend(tlv(0x61, &tlv(0x30, &pdv)));
    out
}

fn respond_mms(mms: &[u8], domains: Domains<'_>, carrier: Carrier) -> Exchange {
    let (kind, reply) = match mms.first() {
        Some(&INITIATE_REQUEST) => ("initiate", Some(INITIATE_RESPONSE_PDU.to_vec())),
        Some(&CONCLUDE_REQUEST) => ("conclude", Some(vec![CONCLUDE_RESPONSE, 0x00])),
        Some(&CONFIRMED_REQUEST) => match confirmed_request(mms) {
            Some((invoke_id, GET_NAME_LIST)) => {
                ("get-name-list", Some(get_name_list_response(invoke_id, domains)))
            }
            Some((invoke_id, _)) => ("reject", Some(reject(invoke_id))),
            None => ("unknown", None),
        },
        _ => ("unknown", None),
    };
    let reply = reply.map(|pdu| match carrier {
        Carrier::Bare => data_tpkt(&pdu),
        Carrier::Session => data_tpkt(&wrap_presentation(&pdu)),
    });
    Exchange::new(kind, reply)
}

/// `A0 L 02 n <invokeId> <service> ..` → (invokeId bytes, service tag)
fn confirmed_request(mms: &[u8]) -> Option<(&[u8], u8)> {
    let (tag, content, _) = read_tlv(mms)?;
    if tag != CONFIRMED_REQUEST {
        return None;
    }
    let (tag, invoke_id, rest) = read_tlv(content)?;
    if tag != 0x02 {
        return None;
    }
    Some((invoke_id, *rest.first()?))
}

/// GetNameList response listing the first logical device
pub fn get_name_list_response(invoke_id: &[u8], domains: Domains<'_>) -> Vec<u8> {
    let name = domains.first.unwrap_or(PLACEHOLDER_DOMAIN);
    let more_follows = if domains.count > 1 { 0xFF } else { 0x00 };

    let mut list = tlv(0xA0, &tlv(0x1A, name.as_bytes()));
    list.extend_from_slice(&[0x81, 0x01, more_follows]);

    let mut body = tlv(0x02, invoke_id);
    body.extend(tlv(GET_NAME_LIST, &list));
    tlv(CONFIRMED_RESPONSE, &body)
}

/// Reject: confirmed-requestPDU, unrecognized-service
pub fn reject(invoke_id: &[u8]) -> Vec<u8> {
    let mut body = tlv(0x80, invoke_id);
    body.extend_from_slice(&[0x81, 0x01, 0x01]);
    tlv(REJECT, &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_MODEL: Domains<'static> = Domains {
        first: None,
        count: 0,
    };

    fn dt(payload: &[u8]) -> Vec<u8> {
        data_tpkt(payload).to_vec()
    }

    #[test]
    fn test_tpkt_framing_waits_for_full_packet() {
        let packet = dt(&[0xA8, 0x00]);
        let mut buf = BytesMut::from(&packet[..5]);
        assert_eq!(next_tpkt(&mut buf).unwrap(), None);
        buf.extend_from_slice(&packet[5..]);
        buf.extend_from_slice(&[0x03, 0x00]);
        assert_eq!(next_tpkt(&mut buf).unwrap().unwrap().as_ref(), &packet[..]);
        assert_eq!(buf.len(), 2);

        let mut bad = BytesMut::from(&[0x45u8, 0x00, 0x00, 0x10][..]);
        assert_eq!(next_tpkt(&mut bad), Err(TpktError::Version(0x45)));
    }

    #[test]
    fn test_connection_request_gets_confirm() {
        let cr = [
            0x03, 0x00, 0x00, 0x16, 0x11, 0xE0, 0x00, 0x00, 0x00, 0x07, 0x00, 0xC1, 0x02, 0x00,
            0x01, 0xC2, 0x02, 0x00, 0x01, 0xC0, 0x01, 0x0A,
        ];
        let exchange = respond(&cr, NO_MODEL);
        assert_eq!(exchange.kind, "cotp-cr");
        assert_eq!(
            exchange.reply.unwrap().as_ref(),
            &[0x03, 0x00, 0x00, 0x0E, 0x09, 0xD0, 0x00, 0x07, 0x00, 0x01, 0x00, 0xC0, 0x01, 0x0A]
        );
    }

    #[test]
    fn test_bare_initiate_gets_fixed_response() {
        let exchange = respond(&dt(&[0xA8, 0x03, 0x80, 0x01, 0x01]), NO_MODEL);
        assert_eq!(exchange.kind, "initiate");
        let reply = exchange.reply.unwrap();
        assert_eq!(&reply[4..7], &COTP_DT_HEADER);
        assert_eq!(&reply[7..], &INITIATE_RESPONSE_PDU);
    }

    #[test]
    fn test_session_connect_is_mirrored() {
        // CONNECT, CP-type, AARQ with a calling-AP-invocation-id [8] ahead of
        // user-information carrying the Initiate-Request
        let connect = [
            0x0D, 0x14, 0x31, 0x12, 0x60, 0x10, 0xA8, 0x03, 0x02, 0x01, 0x01, 0xBE, 0x09, 0x28,
            0x07, 0xA0, 0x05, 0xA8, 0x03, 0x80, 0x01, 0x01,
        ];
        let exchange = respond(&dt(&connect), NO_MODEL);
        assert_eq!(exchange.kind, "session-connect");
        let reply = exchange.reply.unwrap();
        let accept = &reply[7..];

        let mut expected = connect.to_vec();
        expected[0] = 0x0E;
        expected[4] = 0x61;
        expected[17] = 0xA9;
        assert_eq!(accept, &expected[..]);
    }

    #[test]
    fn test_get_name_list_inside_session_data() {
        let request = [0xA0, 0x0A, 0x02, 0x01, 0x05, 0xA1, 0x05, 0xA0, 0x03, 0x80, 0x01, 0x09];
        let mut payload = SPDU_DATA.to_vec();
        payload.extend(tlv(
            0x61,
            &tlv(0x30, &[&[0x02, 0x01, 0x03][..], &tlv(0xA0, &request)].concat()),
        ));

        let domains = Domains {
            first: Some("IED1LD0"),
            count: 2,
        };
        let exchange = respond(&dt(&payload), domains);
        assert_eq!(exchange.kind, "get-name-list");

        let reply = exchange.reply.unwrap();
        let session = &reply[7..];
        assert!(session.starts_with(&SPDU_DATA));
        let mms = unwrap_presentation(&session[4..]).unwrap();
        let mut expected_list = tlv(0xA0, &tlv(0x1A, b"IED1LD0"));
        expected_list.extend_from_slice(&[0x81, 0x01, 0xFF]);
        let mut expected = vec![0x02, 0x01, 0x05];
        expected.extend(tlv(0xA1, &expected_list));
        assert_eq!(mms, &tlv(0xA1, &expected)[..]);
    }

    #[test]
    fn test_get_name_list_without_model_uses_placeholder() {
        let response = get_name_list_response(&[0x01], NO_MODEL);
        let name = PLACEHOLDER_DOMAIN.as_bytes();
        assert!(response.windows(name.len()).any(|w| w == name));
        assert_eq!(&response[response.len() - 3..], &[0x81, 0x01, 0x00]);
    }

    #[test]
    fn test_unsupported_service_is_rejected() {
        // Read request (tag A4) with invoke id 0x0102
        let request = [0xA0, 0x06, 0x02, 0x02, 0x01, 0x02, 0xA4, 0x00];
        let exchange = respond(&dt(&request), NO_MODEL);
        assert_eq!(exchange.kind, "reject");
        let reply = exchange.reply.unwrap();
        assert_eq!(
            &reply[7..],
            &[0xA4, 0x07, 0x80, 0x02, 0x01, 0x02, 0x81, 0x01, 0x01]
        );
    }

    #[test]
    fn test_garbage_is_ignored() {
        let exchange = respond(&dt(&[0x42, 0x00]), NO_MODEL);
        assert_eq!(exchange, Exchange::new("unknown", None));
    }
}
