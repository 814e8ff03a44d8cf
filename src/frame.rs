use crc::{Crc, CRC_16_MODBUS};
use std::fmt;

pub const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Smallest meaningful RTU frame: unit id, function, CRC16.
pub const MIN_FRAME_LEN: usize = 4;

/// MBAP header is always 7 bytes on the wire.
pub const MBAP_HEADER_LEN: usize = 7;

/// Receive buffers that grow past this without a valid frame are dropped.
const SCAN_BUF_CAP: usize = 8192;

/// Append the CRC16 trailer (low byte first) to an RTU frame body.
#[must_use]
pub fn append_crc(body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(body.len() + 2);
    frame.extend_from_slice(body);
    let crc = MODBUS_CRC.checksum(body);
    frame.extend(crc.to_le_bytes());
    frame
}

/// True iff `frame` is at least [`MIN_FRAME_LEN`] bytes and its trailer
/// matches the CRC16 of the preceding bytes.
#[must_use]
pub fn crc_ok(frame: &[u8]) -> bool {
    if frame.len() < MIN_FRAME_LEN {
        return false;
    }
    let (data, trailer) = frame.split_at(frame.len() - 2);
    MODBUS_CRC.checksum(data) == u16::from_le_bytes([trailer[0], trailer[1]])
}

/// Scan a receive buffer for the first CRC-terminated frame.
///
/// Handles coalesced frames (frame1+frame2 in one burst) and garbage before
/// a frame start: the consumed prefix and the frame itself are removed from
/// the buffer, any remainder stays for the next call. A buffer that exceeds
/// the scan cap without containing a valid frame is discarded.
pub fn extract_frame(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    if buf.len() >= MIN_FRAME_LEN {
        for start in 0..=(buf.len() - MIN_FRAME_LEN) {
            for end in (start + MIN_FRAME_LEN)..=buf.len() {
                if crc_ok(&buf[start..end]) {
                    let frame = buf[start..end].to_vec();
                    buf.drain(..end);
                    return Some(frame);
                }
            }
        }
    }
    if buf.len() > SCAN_BUF_CAP {
        buf.clear();
    }
    None
}

#[derive(Debug, PartialEq, Eq)]
pub enum MbapError {
    /// Protocol identifier was not zero.
    BadProtocolId(u16),
    /// Length field outside 2..=253 (unit id + at least a function code,
    /// at most a full PDU).
    BadLength(u16),
}

impl fmt::Display for MbapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MbapError::BadProtocolId(pid) => write!(f, "invalid MBAP protocol id {}", pid),
            MbapError::BadLength(len) => write!(f, "invalid MBAP length {}", len),
        }
    }
}

impl std::error::Error for MbapError {}

/// Modbus/TCP application-protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    /// Parse and validate a 7-byte MBAP header.
    pub fn parse(hdr: &[u8; MBAP_HEADER_LEN]) -> std::result::Result<Self, MbapError> {
        let protocol_id = u16::from_be_bytes([hdr[2], hdr[3]]);
        if protocol_id != 0 {
            return Err(MbapError::BadProtocolId(protocol_id));
        }
        let length = u16::from_be_bytes([hdr[4], hdr[5]]);
        if !(2..=253).contains(&length) {
            return Err(MbapError::BadLength(length));
        }
        Ok(MbapHeader {
            transaction_id: u16::from_be_bytes([hdr[0], hdr[1]]),
            protocol_id,
            length,
            unit_id: hdr[6],
        })
    }

    /// Bytes of PDU that follow the header on the wire.
    #[must_use]
    pub const fn pdu_len(&self) -> usize {
        self.length as usize - 1
    }
}

/// Assemble an MBAP frame around a PDU (function code + data, no CRC).
#[must_use]
pub fn mbap_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let length = (pdu.len() + 1) as u16;
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.extend(transaction_id.to_be_bytes());
    frame.extend(0u16.to_be_bytes());
    frame.extend(length.to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    frame
}

/// Build the two-byte Modbus exception PDU for a function code.
#[must_use]
pub const fn exception_pdu(function: u8, code: u8) -> [u8; 2] {
    [function | 0x80, code]
}

/// Best-effort decode of the common function codes for sniff events.
///
/// Unknown codes leave every field `None`; the observer stream simply omits
/// them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PduFields {
    pub addr: Option<u16>,
    pub count: Option<u16>,
    pub value: Option<u16>,
}

#[must_use]
pub fn decode_fields(frame: &[u8]) -> PduFields {
    let mut fields = PduFields::default();
    if frame.len() < MIN_FRAME_LEN {
        return fields;
    }
    let func = frame[1];
    let body = &frame[2..frame.len() - 2];
    match func {
        // Read requests carry exactly addr + count; the body of a read
        // response starts with a byte count instead, so it is left undecoded.
        0x03 | 0x04 if body.len() == 4 => {
            fields.addr = Some(u16::from_be_bytes([body[0], body[1]]));
            fields.count = Some(u16::from_be_bytes([body[2], body[3]]));
        }
        // Write-multiple requests and responses both start addr + count.
        0x10 if body.len() >= 4 => {
            fields.addr = Some(u16::from_be_bytes([body[0], body[1]]));
            fields.count = Some(u16::from_be_bytes([body[2], body[3]]));
        }
        0x06 if body.len() >= 4 => {
            fields.addr = Some(u16::from_be_bytes([body[0], body[1]]));
            fields.value = Some(u16::from_be_bytes([body[2], body[3]]));
        }
        _ => {}
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_of_empty_input_is_initial_value() {
        assert_eq!(MODBUS_CRC.checksum(&[]), 0xFFFF);
    }

    #[test]
    fn crc_known_vector() {
        // Canonical read-holding request for unit 1, addr 0, count 1.
        let body = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(MODBUS_CRC.checksum(&body), 0x0A84);
        let frame = append_crc(&body);
        assert_eq!(&frame[6..], &[0x84, 0x0A]);
        assert!(crc_ok(&frame));
    }

    #[test]
    fn crc_single_byte_input() {
        let frame = append_crc(&[0x01]);
        assert_eq!(frame.len(), 3);
        // Below the minimum frame length, so verify must still reject it.
        assert!(!crc_ok(&frame));
    }

    #[test]
    fn crc_rejects_corrupted_trailer() {
        let mut frame = append_crc(&[0x01, 0x03, 0x02, 0x00, 0x64]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(!crc_ok(&frame));
    }

    #[test]
    fn extract_finds_frame_after_garbage_prefix() {
        let frame = append_crc(&[0x01, 0x03, 0x04, 0x00, 0x64, 0x00, 0x00]);
        let mut buf = vec![0xDE, 0xAD];
        buf.extend_from_slice(&frame);
        let got = extract_frame(&mut buf).expect("frame present");
        assert_eq!(got, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn extract_splits_coalesced_frames() {
        let first = append_crc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]);
        let second = append_crc(&[0x01, 0x06, 0x00, 0x10, 0x00, 0x01]);
        let mut buf = first.clone();
        buf.extend_from_slice(&second);
        assert_eq!(extract_frame(&mut buf).as_deref(), Some(&first[..]));
        assert_eq!(buf, second);
        assert_eq!(extract_frame(&mut buf).as_deref(), Some(&second[..]));
        assert!(buf.is_empty());
    }

    #[test]
    fn extract_keeps_partial_bytes() {
        let mut buf = vec![0x01, 0x03, 0x04];
        assert_eq!(extract_frame(&mut buf), None);
        assert_eq!(buf, vec![0x01, 0x03, 0x04]);
    }

    #[test]
    fn mbap_parse_roundtrip() {
        let frame = mbap_frame(0x0001, 0x01, &[0x03, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(
            frame,
            [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02]
        );
        let hdr = MbapHeader::parse(frame[..MBAP_HEADER_LEN].try_into().unwrap()).unwrap();
        assert_eq!(hdr.transaction_id, 1);
        assert_eq!(hdr.unit_id, 1);
        assert_eq!(hdr.pdu_len(), 5);
    }

    #[test]
    fn mbap_parse_rejects_nonzero_protocol_id() {
        let hdr = [0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x01];
        assert_eq!(
            MbapHeader::parse(&hdr),
            Err(MbapError::BadProtocolId(1))
        );
    }

    #[test]
    fn mbap_parse_rejects_bad_lengths() {
        let mut hdr = [0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01];
        assert_eq!(MbapHeader::parse(&hdr), Err(MbapError::BadLength(1)));
        hdr[4] = 0x01;
        hdr[5] = 0x00;
        assert_eq!(MbapHeader::parse(&hdr), Err(MbapError::BadLength(256)));
    }

    #[test]
    fn exception_pdu_sets_error_bit() {
        assert_eq!(exception_pdu(0x03, 0x0B), [0x83, 0x0B]);
    }

    #[test]
    fn decode_read_request_fields() {
        let frame = append_crc(&[0x01, 0x03, 0x00, 0x0A, 0x00, 0x02]);
        let fields = decode_fields(&frame);
        assert_eq!(fields.addr, Some(0x000A));
        assert_eq!(fields.count, Some(2));
        assert_eq!(fields.value, None);
    }

    #[test]
    fn decode_write_single_fields() {
        let frame = append_crc(&[0x01, 0x06, 0x00, 0x10, 0x12, 0x34]);
        let fields = decode_fields(&frame);
        assert_eq!(fields.addr, Some(0x0010));
        assert_eq!(fields.value, Some(0x1234));
        assert_eq!(fields.count, None);
    }

    #[test]
    fn decode_write_multiple_fields() {
        let frame = append_crc(&[0x01, 0x10, 0x00, 0x20, 0x00, 0x02, 0x04, 0x00, 0x01, 0x00, 0x02]);
        let fields = decode_fields(&frame);
        assert_eq!(fields.addr, Some(0x0020));
        assert_eq!(fields.count, Some(2));
    }

    #[test]
    fn decode_unknown_function_leaves_fields_absent() {
        let frame = append_crc(&[0x01, 0x2B, 0x0E, 0x01]);
        assert_eq!(decode_fields(&frame), PduFields::default());
    }

    #[test]
    fn decode_read_response_leaves_fields_absent() {
        // FC03 response body starts with a byte count, not an address.
        let frame = append_crc(&[0x01, 0x03, 0x04, 0x00, 0x64, 0x00, 0x00]);
        assert_eq!(decode_fields(&frame), PduFields::default());
    }
}
