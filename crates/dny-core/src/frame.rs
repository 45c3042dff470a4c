//! Byte-stream frame classification.
//!
//! At each pass the scanner tries three recognizers in priority order and
//! reports how many bytes the first success consumed. On no match the
//! caller discards exactly one byte and retries, so a malformed prefix can
//! never desynchronize the stream permanently.
//!
//! Priority places the most structurally unambiguous shape (DNY) first.
//! The ICCID recognizer additionally requires the standardized `"89"`
//! prefix so that arbitrary hex-looking payloads are not misclassified.

/// ASCII sync token of a framed message.
pub const DNY_HEADER: &[u8; 3] = b"DNY";

/// Application-level keep-alive literal.
pub const LINK: &[u8; 4] = b"link";

/// On-wire length of a bare SIM identifier.
pub const ICCID_FRAME_LEN: usize = 20;

/// Smallest legal value of the DNY length field:
/// physical-ID (4) + message-ID (2) + command (1) + checksum (2).
pub const MIN_LENGTH_FIELD: u16 = 9;

/// A classified chunk of the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete framed message, including header and checksum bytes.
    Dny(Vec<u8>),
    /// The 4-byte keep-alive literal.
    Link,
    /// A bare 20-character SIM identifier.
    Iccid(String),
}

/// Result of one scan pass over the front of the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scan {
    /// A recognizer matched; `consumed` bytes belong to `frame`.
    Match { frame: Frame, consumed: usize },
    /// No recognizer matched; the caller must discard one byte.
    Skip,
    /// The buffer is a plausible prefix of some shape; wait for more bytes.
    NeedMore,
}

/// Classify the front of `buf`.
///
/// Returns [`Scan::NeedMore`] on an empty buffer.
pub fn scan(buf: &[u8]) -> Scan {
    if buf.is_empty() {
        return Scan::NeedMore;
    }
    if let Some(scan) = scan_dny(buf) {
        return scan;
    }
    if let Some(scan) = scan_link(buf) {
        return scan;
    }
    if let Some(scan) = scan_iccid(buf) {
        return scan;
    }
    Scan::Skip
}

/// DNY frame: header + LE length at offset 3; total size is 5 + length.
fn scan_dny(buf: &[u8]) -> Option<Scan> {
    let probe = buf.len().min(DNY_HEADER.len());
    if buf[..probe] != DNY_HEADER[..probe] {
        return None;
    }
    if buf.len() < 5 {
        return Some(Scan::NeedMore);
    }
    let length = u16::from_le_bytes([buf[3], buf[4]]);
    if length < MIN_LENGTH_FIELD {
        // Header bytes followed by an impossible length; not a frame.
        return Some(Scan::Skip);
    }
    let total = 5 + length as usize;
    if buf.len() < total {
        return Some(Scan::NeedMore);
    }
    Some(Scan::Match {
        frame: Frame::Dny(buf[..total].to_vec()),
        consumed: total,
    })
}

fn scan_link(buf: &[u8]) -> Option<Scan> {
    let probe = buf.len().min(LINK.len());
    if buf[..probe] != LINK[..probe] {
        return None;
    }
    if buf.len() < LINK.len() {
        return Some(Scan::NeedMore);
    }
    Some(Scan::Match {
        frame: Frame::Link,
        consumed: LINK.len(),
    })
}

/// ICCID: 20 hex-alphabet bytes whose first two characters are `"89"`.
fn scan_iccid(buf: &[u8]) -> Option<Scan> {
    let probe = buf.len().min(ICCID_FRAME_LEN);
    let prefix = &buf[..probe];
    if !prefix[..probe.min(2)].iter().zip(b"89").all(|(b, e)| b == e) {
        return None;
    }
    if !prefix.iter().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    if buf.len() < ICCID_FRAME_LEN {
        return Some(Scan::NeedMore);
    }
    // All-hex guarantees valid UTF-8.
    let iccid = String::from_utf8(buf[..ICCID_FRAME_LEN].to_vec()).expect("hex is ASCII");
    Some(Scan::Match {
        frame: Frame::Iccid(iccid),
        consumed: ICCID_FRAME_LEN,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DnyMessage;

    fn sample_frame() -> Vec<u8> {
        DnyMessage {
            physical_id: 0x04A2_28CD,
            message_id: 0x0801,
            command: 0x20,
            payload: vec![0x80, 0x02, 0x02, 0x1E, 0x31, 0x06],
        }
        .encode()
    }

    #[test]
    fn empty_buffer_needs_more() {
        assert_eq!(scan(b""), Scan::NeedMore);
    }

    #[test]
    fn complete_dny_frame_matches() {
        let frame = sample_frame();
        match scan(&frame) {
            Scan::Match {
                frame: Frame::Dny(bytes),
                consumed,
            } => {
                assert_eq!(consumed, frame.len());
                assert_eq!(bytes, frame);
            }
            other => panic!("expected DNY match, got {other:?}"),
        }
    }

    #[test]
    fn partial_dny_frame_needs_more() {
        let frame = sample_frame();
        for cut in [1, 2, 4, frame.len() - 1] {
            assert_eq!(scan(&frame[..cut]), Scan::NeedMore, "cut at {cut}");
        }
    }

    #[test]
    fn dny_header_with_impossible_length_is_skipped() {
        // Length field 8 < minimum 9.
        assert_eq!(scan(b"DNY\x08\x00rest"), Scan::Skip);
        assert_eq!(scan(b"DNY\x00\x00"), Scan::Skip);
    }

    #[test]
    fn trailing_bytes_are_not_consumed() {
        let mut buf = sample_frame();
        let frame_len = buf.len();
        buf.extend_from_slice(b"link");
        match scan(&buf) {
            Scan::Match { consumed, .. } => assert_eq!(consumed, frame_len),
            other => panic!("expected match, got {other:?}"),
        }
    }

    #[test]
    fn link_literal_matches() {
        assert_eq!(
            scan(b"link"),
            Scan::Match {
                frame: Frame::Link,
                consumed: 4
            }
        );
    }

    #[test]
    fn link_prefix_needs_more() {
        assert_eq!(scan(b"l"), Scan::NeedMore);
        assert_eq!(scan(b"lin"), Scan::NeedMore);
    }

    #[test]
    fn link_with_trailing_data_consumes_four() {
        let scan_result = scan(b"linklink");
        assert_eq!(
            scan_result,
            Scan::Match {
                frame: Frame::Link,
                consumed: 4
            }
        );
    }

    #[test]
    fn iccid_matches() {
        let iccid = b"89860404D91623904882";
        match scan(iccid) {
            Scan::Match {
                frame: Frame::Iccid(s),
                consumed,
            } => {
                assert_eq!(consumed, 20);
                assert_eq!(s, "89860404D91623904882");
            }
            other => panic!("expected ICCID match, got {other:?}"),
        }
    }

    #[test]
    fn iccid_prefix_needs_more() {
        assert_eq!(scan(b"89"), Scan::NeedMore);
        assert_eq!(scan(b"89860404D916"), Scan::NeedMore);
    }

    #[test]
    fn hex_without_89_prefix_is_skipped() {
        // 20 hex chars that do not start with "89" must not classify.
        assert_eq!(scan(b"AA860404D91623904882"), Scan::Skip);
    }

    #[test]
    fn iccid_with_non_hex_byte_is_skipped() {
        assert_eq!(scan(b"89860404D916239048g2"), Scan::Skip);
    }

    #[test]
    fn garbage_is_skipped() {
        assert_eq!(scan(b"\x58\x58\x58\x58"), Scan::Skip);
        assert_eq!(scan(b"\x00"), Scan::Skip);
    }

    #[test]
    fn garbage_prefix_resynchronizes_to_frame() {
        // S5: junk prefix, then a valid frame; one-byte discards recover it.
        let mut stream = b"\x58\x58\x58\x58".to_vec();
        let frame = DnyMessage {
            physical_id: 0x04A2_6CF3,
            message_id: 0x0002,
            command: 0x02,
            payload: vec![],
        }
        .encode();
        stream.extend_from_slice(&frame);

        let mut offset = 0;
        let mut skips = 0;
        loop {
            match scan(&stream[offset..]) {
                Scan::Skip => {
                    offset += 1;
                    skips += 1;
                }
                Scan::Match {
                    frame: Frame::Dny(bytes),
                    ..
                } => {
                    assert_eq!(bytes, frame);
                    break;
                }
                other => panic!("unexpected scan result {other:?}"),
            }
        }
        assert_eq!(skips, 4);
    }

    #[test]
    fn dny_wins_over_iccid_priority() {
        // A DNY frame whose payload happens to be hex text must still be
        // classified as a frame, not an ICCID.
        let frame = DnyMessage {
            physical_id: 1,
            message_id: 1,
            command: 0x01,
            payload: b"8986040499999999".to_vec(),
        }
        .encode();
        assert!(matches!(
            scan(&frame),
            Scan::Match {
                frame: Frame::Dny(_),
                ..
            }
        ));
    }
}
