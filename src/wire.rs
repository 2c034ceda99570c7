//! Wire text grammar: building and parsing the packet forms that travel over
//! the radio link.
//!
//! Every packet is delimiter-based text. The forms are:
//!
//! - plain message: `MSG:<msgID>:<senderID>:<payload>`
//! - acknowledgement: `ACK:<msgID>:<senderAckingID>`
//! - bare beacon: `BEACON <name-suffix>` (prefix-detected, sender taken from a
//!   fixed byte offset)
//! - forwarded wrapper: `FORWARDED:<relayNodeID>:<original>`
//! - fragment: `[<msgID>|<index>|<total>]<fragmentPayload>`
//!
//! Parsing degrades instead of failing: text that does not match the fragment
//! grammar is handed back to the caller as a complete unit, and numeric header
//! fields tolerate junk by parsing leniently to 0.

use crate::{MessageText, MAX_FRAGMENT_PAYLOAD};
use core::fmt::Write;

pub(crate) const ACK_PREFIX: &str = "ACK:";
pub(crate) const MSG_PREFIX: &str = "MSG:";
pub(crate) const BEACON_PREFIX: &str = "BEACON";
pub(crate) const FORWARDED_PREFIX: &str = "FORWARDED:";

/// Byte offset at which the sender starts in a bare beacon. Locally originated
/// beacons carry the 11-byte announcement prefix, so the slice from this offset
/// keeps the space in front of the name; that is the wire-compatible behavior
/// and deliberately not corrected here.
const BEACON_SENDER_OFFSET: usize = 10;

/// Copies `text` into a bounded string, or `None` when it does not fit.
pub(crate) fn bounded<const N: usize>(text: &str) -> Option<heapless::String<N>> {
    let mut out = heapless::String::new();
    out.push_str(text).ok()?;
    Some(out)
}

/// Copies `text` into a bounded string, truncating at a character boundary when
/// it does not fit. Used when adopting foreign strings into owned state, where
/// dropping the tail beats dropping the record.
pub(crate) fn bounded_lossy<const N: usize>(text: &str) -> heapless::String<N> {
    let mut out = heapless::String::new();
    if out.push_str(text).is_ok() {
        return out;
    }
    let mut cut = N.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let _ = out.push_str(&text[..cut]);
    out
}

/// Lenient integer parse for fragment header fields: leading whitespace and an
/// optional sign are accepted, digits are consumed until the first non-digit,
/// anything else yields 0. Values clamp to the `u16` range; negative input
/// clamps to 0 (a fragment index that can never complete).
pub(crate) fn lenient_u16(text: &str) -> u16 {
    let text = text.trim_start();
    let text = text.strip_prefix('+').unwrap_or(text);
    if text.starts_with('-') {
        return 0;
    }
    let mut value: u32 = 0;
    for byte in text.bytes() {
        if !byte.is_ascii_digit() {
            break;
        }
        value = value * 10 + u32::from(byte - b'0');
        if value > u32::from(u16::MAX) {
            return u16::MAX;
        }
    }
    value as u16
}

pub(crate) fn is_ack(text: &str) -> bool {
    text.starts_with(ACK_PREFIX)
}

/// Extracts the message id from `ACK:<msgID>:<sender>`. Returns `None` when a
/// second colon is missing; the caller still consumes the packet either way.
pub(crate) fn ack_msg_id(text: &str) -> Option<&str> {
    let rest = text.strip_prefix(ACK_PREFIX)?;
    let end = rest.find(':')?;
    Some(&rest[..end])
}

/// Header fields of one fragment, borrowed from the packet text.
pub(crate) struct FragmentHeader<'a> {
    pub(crate) msg_id: &'a str,
    pub(crate) index: u16,
    pub(crate) total: u16,
    pub(crate) payload: &'a str,
}

/// Parses `[<msgID>|<index>|<total>]<payload>`. Returns `None` for anything
/// that is not a well-formed fragment (no leading `[`, no closing `]`, or a
/// missing `|` separator), in which case the caller uses the text as-is.
pub(crate) fn parse_fragment(text: &str) -> Option<FragmentHeader<'_>> {
    if !text.starts_with('[') {
        return None;
    }
    let end = text.find(']')?;
    let header = &text[1..end];
    let sep1 = header.find('|')?;
    let sep2 = header[sep1 + 1..].find('|').map(|i| i + sep1 + 1)?;
    Some(FragmentHeader {
        msg_id: &header[..sep1],
        index: lenient_u16(&header[sep1 + 1..sep2]),
        total: lenient_u16(&header[sep2 + 1..]),
        payload: &text[end + 1..],
    })
}

/// Extracts `(sender, msg_id)` from an assembled packet. Bare beacons yield the
/// fixed-offset sender suffix and no id; plain messages yield the id between
/// the first and second colon and the sender up to the next colon or the end.
/// Everything else yields `("unknown", "")`.
pub(crate) fn sender_and_msg_id(text: &str) -> (&str, &str) {
    if text.starts_with(BEACON_PREFIX) {
        return (text.get(BEACON_SENDER_OFFSET..).unwrap_or(""), "");
    }
    if let Some(rest) = text.strip_prefix(MSG_PREFIX) {
        if let Some(second) = rest.find(':') {
            let msg_id = &rest[..second];
            let after = &rest[second + 1..];
            let sender = match after.find(':') {
                Some(i) => &after[..i],
                None => after,
            };
            return (sender, msg_id);
        }
    }
    ("unknown", "")
}

/// Returns the application payload of a plain message, meaning the text after
/// the sender field's colon, or `""` when the packet has no payload section.
pub(crate) fn message_payload(text: &str) -> &str {
    let Some(rest) = text.strip_prefix(MSG_PREFIX) else {
        return "";
    };
    let Some(second) = rest.find(':') else {
        return "";
    };
    let after = &rest[second + 1..];
    match after.find(':') {
        Some(i) => &after[i + 1..],
        None => "",
    }
}

pub(crate) fn message_text(msg_id: &str, node: &str, payload: &str) -> Option<MessageText> {
    let mut out = MessageText::new();
    write!(out, "MSG:{}:{}:{}", msg_id, node, payload).ok()?;
    Some(out)
}

pub(crate) fn ack_text(msg_id: &str, node: &str) -> Option<MessageText> {
    let mut out = MessageText::new();
    write!(out, "ACK:{}:{}", msg_id, node).ok()?;
    Some(out)
}

pub(crate) fn forwarded_text(node: &str, original: &str) -> Option<MessageText> {
    let mut out = MessageText::new();
    write!(out, "FORWARDED:{}:{}", node, original).ok()?;
    Some(out)
}

pub(crate) fn fragment_text(msg_id: &str, index: usize, total: usize, chunk: &str) -> Option<MessageText> {
    let mut out = MessageText::new();
    write!(out, "[{}|{}|{}]{}", msg_id, index, total, chunk).ok()?;
    Some(out)
}

/// Beacon announcement content for this node. Travels MSG-wrapped through the
/// normal send path; the bare form only appears from other implementations.
pub(crate) fn beacon_content(node: &str) -> Option<MessageText> {
    let mut out = MessageText::new();
    write!(out, "BEACON van {}", node).ok()?;
    Some(out)
}

/// Splits a full wire string into fragment payload chunks of at most
/// `MAX_FRAGMENT_PAYLOAD` bytes, never dividing a UTF-8 code point. ASCII
/// input therefore yields `ceil(len/80)` chunks of exactly 80 bytes apart
/// from the last.
pub(crate) fn fragment_chunks(full: &str) -> FragmentChunks<'_> {
    FragmentChunks { rest: full }
}

pub(crate) struct FragmentChunks<'a> {
    rest: &'a str,
}

impl<'a> Iterator for FragmentChunks<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.rest.is_empty() {
            return None;
        }
        let mut cut = self.rest.len().min(MAX_FRAGMENT_PAYLOAD);
        while !self.rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (head, tail) = self.rest.split_at(cut);
        self.rest = tail;
        Some(head)
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn ack_id_extraction() {
        assert_eq!(ack_msg_id("ACK:1000:NODE_B"), Some("1000"));
        assert_eq!(ack_msg_id("ACK::NODE_B"), Some(""));
        // no second colon: consumed by the caller, no id recorded
        assert_eq!(ack_msg_id("ACK:1000"), None);
        assert_eq!(ack_msg_id("MSG:1:A:x"), None);
        assert!(is_ack("ACK:1:A"));
        assert!(!is_ack("ack:1:A"));
    }

    #[test]
    fn fragment_parse_happy_path() {
        let header = parse_fragment("[1000|2|3]payload bytes").unwrap();
        assert_eq!(header.msg_id, "1000");
        assert_eq!(header.index, 2);
        assert_eq!(header.total, 3);
        assert_eq!(header.payload, "payload bytes");
    }

    #[test]
    fn fragment_parse_degrades_to_whole_text() {
        // not starting with '[' or missing ']' or missing separators: use as-is
        assert!(parse_fragment("MSG:1:A:x").is_none());
        assert!(parse_fragment("x[1|2|3]y").is_none());
        assert!(parse_fragment("[1|2|3 no close").is_none());
        assert!(parse_fragment("[1-2-3]x").is_none());
        assert!(parse_fragment("[1|23]x").is_none());
    }

    #[test]
    fn fragment_parse_lenient_numbers() {
        let header = parse_fragment("[9| 2|junk]x").unwrap();
        assert_eq!(header.index, 2);
        assert_eq!(header.total, 0);
        let header = parse_fragment("[9|-1|3]x").unwrap();
        assert_eq!(header.index, 0);
        assert_eq!(header.total, 3);
        let header = parse_fragment("[9|12ab|99999999]x").unwrap();
        assert_eq!(header.index, 12);
        assert_eq!(header.total, u16::MAX);
    }

    #[test]
    fn sender_extraction_message_form() {
        assert_eq!(sender_and_msg_id("MSG:1000:NODE_A:hello"), ("NODE_A", "1000"));
        // sender runs to the end when the payload colon is missing
        assert_eq!(sender_and_msg_id("MSG:1000:NODE_A"), ("NODE_A", "1000"));
        assert_eq!(sender_and_msg_id("MSG:1000"), ("unknown", ""));
        assert_eq!(sender_and_msg_id("MSG:1::hi"), ("", "1"));
    }

    #[test]
    fn sender_extraction_beacon_form() {
        assert_eq!(sender_and_msg_id("BEACON van NODE_Q"), (" NODE_Q", ""));
        // shorter than the offset: empty sender, still a beacon
        assert_eq!(sender_and_msg_id("BEACON x"), ("", ""));
    }

    #[test]
    fn sender_extraction_other_forms() {
        assert_eq!(sender_and_msg_id("FORWARDED:NODE_B:MSG:1:A:x"), ("unknown", ""));
        assert_eq!(sender_and_msg_id("garbage"), ("unknown", ""));
    }

    #[test]
    fn payload_extraction() {
        assert_eq!(message_payload("MSG:1:A:hello"), "hello");
        assert_eq!(message_payload("MSG:1:A:he:llo"), "he:llo");
        assert_eq!(message_payload("MSG:1:A"), "");
        assert_eq!(message_payload("BEACON van A"), "");
    }

    #[test]
    fn builders_round_trip_through_parsers() {
        let msg = message_text("1000", "NODE_A", "hello").unwrap();
        assert_eq!(msg.as_str(), "MSG:1000:NODE_A:hello");
        assert_eq!(sender_and_msg_id(&msg), ("NODE_A", "1000"));

        let ack = ack_text("1000", "NODE_B").unwrap();
        assert_eq!(ack_msg_id(&ack), Some("1000"));

        let forwarded = forwarded_text("NODE_B", &msg).unwrap();
        assert_eq!(forwarded.as_str(), "FORWARDED:NODE_B:MSG:1000:NODE_A:hello");

        let fragment = fragment_text("1000", 1, 2, "abc").unwrap();
        let header = parse_fragment(&fragment).unwrap();
        assert_eq!(header.msg_id, "1000");
        assert_eq!(header.payload, "abc");

        assert_eq!(beacon_content("NODE_A").unwrap().as_str(), "BEACON van NODE_A");
    }

    #[test]
    fn chunking_ascii_exact_boundaries() {
        let text: heapless::String<256> = bounded_lossy(core::str::from_utf8(&[b'a'; 200]).unwrap());
        let chunks: heapless::Vec<&str, 8> = fragment_chunks(&text).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 80);
        assert_eq!(chunks[1].len(), 80);
        assert_eq!(chunks[2].len(), 40);

        let short = "short";
        let chunks: heapless::Vec<&str, 8> = fragment_chunks(short).collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], "short");
    }

    #[test]
    fn chunking_respects_char_boundaries() {
        let mut text = heapless::String::<256>::new();
        for _ in 0..50 {
            text.push_str("né").unwrap();
        }
        let mut reassembled = heapless::String::<256>::new();
        for chunk in fragment_chunks(&text) {
            assert!(chunk.len() <= MAX_FRAGMENT_PAYLOAD);
            reassembled.push_str(chunk).unwrap();
        }
        assert_eq!(reassembled, text);
    }

    #[test]
    fn bounded_lossy_truncates_cleanly() {
        let full: heapless::String<4> = bounded_lossy("abcdef");
        assert_eq!(full.as_str(), "abcd");
        let multi: heapless::String<4> = bounded_lossy("ééé");
        assert_eq!(multi.as_str(), "éé");
        assert!(bounded::<4>("abcdef").is_none());
        assert_eq!(bounded::<8>("abc").unwrap().as_str(), "abc");
    }
}
