//! Tagged-length-value packet layer.
//!
//! Every frame is a tree of packets. A packet starts with one lead byte: the
//! high bit marks a *node* (a packet whose value is a sequence of child
//! packets), the low seven bits carry the tag. A length prefix follows, then
//! the value.
//!
//! Lengths and integers use a signed big-endian varint: seven data bits per
//! byte, most significant group first, with `0x80` set on every byte except
//! the last. The encoder emits the shortest form whose top data bit equals the
//! sign, so `100` becomes `80 64` and `-1` becomes `7f`.

use bytes::Bytes;

use crate::errors::{ProtocolError, Result};

/// Maximum number of varint groups accepted for a length prefix.
pub const MAX_LENGTH_GROUPS: usize = 5;

const NODE_BIT: u8 = 0x80;
const CONTINUATION: u8 = 0x80;
const DATA_MASK: u8 = 0x7F;

/// Number of bytes `value` occupies as a varint.
pub fn varint_len(value: i64) -> usize {
    for groups in 1usize..10 {
        let bound = 1i64 << (7 * groups - 1);
        if value >= -bound && value < bound {
            return groups;
        }
    }
    10
}

/// Append `value` to `dst` as a signed varint.
pub fn encode_varint(value: i64, dst: &mut Vec<u8>) {
    let groups = varint_len(value);
    for i in (0..groups).rev() {
        let mut byte = ((value >> (7 * i)) as u8) & DATA_MASK;
        if i != 0 {
            byte |= CONTINUATION;
        }
        dst.push(byte);
    }
}

/// Decode a signed varint from the front of `buf`.
///
/// Returns the value and the number of bytes consumed. A buffer that ends on
/// a continuation byte is [`ProtocolError::Truncated`]; more than
/// `max_groups` bytes is [`ProtocolError::MalformedLength`].
pub fn decode_varint(buf: &[u8], max_groups: usize) -> Result<(i64, usize)> {
    let Some(&first) = buf.first() else {
        return Err(ProtocolError::Truncated { needed: 1, available: 0 });
    };

    let mut value: i64 = if first & 0x40 == 0 { 0 } else { -1 };
    for (i, &byte) in buf.iter().enumerate() {
        if i >= max_groups {
            return Err(ProtocolError::MalformedLength);
        }
        value = (value << 7) | i64::from(byte & DATA_MASK);
        if byte & CONTINUATION == 0 {
            return Ok((value, i + 1));
        }
    }

    if buf.len() >= max_groups {
        Err(ProtocolError::MalformedLength)
    } else {
        Err(ProtocolError::Truncated { needed: buf.len() + 1, available: buf.len() })
    }
}

/// Decode a length prefix, rejecting negative values.
pub fn decode_length(buf: &[u8]) -> Result<(usize, usize)> {
    let (len, consumed) = decode_varint(buf, MAX_LENGTH_GROUPS)?;
    let len = usize::try_from(len).map_err(|_| ProtocolError::MalformedLength)?;
    Ok((len, consumed))
}

#[allow(clippy::cast_possible_wrap)]
fn put_length(len: usize, dst: &mut Vec<u8>) {
    encode_varint(len as i64, dst);
}

/// One decoded packet borrowing from the input buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Packet<'a> {
    pub tag: u8,
    pub node: bool,
    pub value: &'a [u8],
}

/// Read one packet from the front of `buf`, returning it and its total size.
pub(crate) fn read_packet(buf: &[u8]) -> Result<(Packet<'_>, usize)> {
    let Some(&lead) = buf.first() else {
        return Err(ProtocolError::Truncated { needed: 1, available: 0 });
    };
    let (len, prefix) = decode_length(&buf[1..])?;
    let start = 1 + prefix;
    let end = start.checked_add(len).ok_or(ProtocolError::MalformedLength)?;
    if end > buf.len() {
        return Err(ProtocolError::Truncated { needed: end, available: buf.len() });
    }

    let packet = Packet { tag: lead & DATA_MASK, node: lead & NODE_BIT != 0, value: &buf[start..end] };
    Ok((packet, end))
}

impl<'a> Packet<'a> {
    fn primitive(&self, field: &'static str) -> Result<&'a [u8]> {
        if self.node {
            return Err(ProtocolError::UnexpectedPacket { expected: field, tag: self.tag });
        }
        Ok(self.value)
    }

    pub fn string(&self, field: &'static str) -> Result<String> {
        let raw = self.primitive(field)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8 { field })
    }

    pub fn bytes(&self, field: &'static str) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self.primitive(field)?))
    }

    pub fn raw(&self, field: &'static str) -> Result<&'a [u8]> {
        self.primitive(field)
    }

    pub fn boolean(&self, field: &'static str) -> Result<bool> {
        match self.primitive(field)? {
            [0] => Ok(false),
            [1] => Ok(true),
            _ => Err(ProtocolError::InvalidFieldValue { field }),
        }
    }

    pub fn byte(&self, field: &'static str) -> Result<u8> {
        match self.primitive(field)? {
            [b] => Ok(*b),
            _ => Err(ProtocolError::InvalidFieldValue { field }),
        }
    }

    pub fn uint32(&self, field: &'static str) -> Result<u32> {
        let raw = self.primitive(field)?;
        let (value, consumed) = decode_varint(raw, MAX_LENGTH_GROUPS)
            .map_err(|_| ProtocolError::InvalidFieldValue { field })?;
        if consumed != raw.len() {
            return Err(ProtocolError::InvalidFieldValue { field });
        }
        u32::try_from(value).map_err(|_| ProtocolError::InvalidFieldValue { field })
    }

    pub fn children(&self, expected: &'static str) -> Result<Children<'a>> {
        if !self.node {
            return Err(ProtocolError::UnexpectedPacket { expected, tag: self.tag });
        }
        Ok(Children { rest: self.value })
    }
}

/// Iterator over the child packets of a node.
pub(crate) struct Children<'a> {
    rest: &'a [u8],
}

impl<'a> Children<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self { rest: body }
    }
}

impl<'a> Iterator for Children<'a> {
    type Item = Result<Packet<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        match read_packet(self.rest) {
            Ok((packet, used)) => {
                self.rest = &self.rest[used..];
                Some(Ok(packet))
            },
            Err(e) => {
                self.rest = &[];
                Some(Err(e))
            },
        }
    }
}

/// Builder for a node packet.
///
/// Children are appended in call order; [`NodeBuilder::finish`] writes the
/// lead byte and length prefix in front of them.
#[derive(Debug)]
pub(crate) struct NodeBuilder {
    tag: u8,
    body: Vec<u8>,
}

impl NodeBuilder {
    pub fn new(tag: u8) -> Self {
        Self { tag: tag & DATA_MASK, body: Vec::new() }
    }

    pub fn bytes(&mut self, tag: u8, value: &[u8]) -> &mut Self {
        self.body.push(tag & DATA_MASK);
        put_length(value.len(), &mut self.body);
        self.body.extend_from_slice(value);
        self
    }

    pub fn string(&mut self, tag: u8, value: &str) -> &mut Self {
        self.bytes(tag, value.as_bytes())
    }

    pub fn boolean(&mut self, tag: u8, value: bool) -> &mut Self {
        self.bytes(tag, &[u8::from(value)])
    }

    pub fn byte(&mut self, tag: u8, value: u8) -> &mut Self {
        self.bytes(tag, &[value])
    }

    pub fn uint32(&mut self, tag: u8, value: u32) -> &mut Self {
        let mut scratch = Vec::with_capacity(5);
        encode_varint(i64::from(value), &mut scratch);
        self.bytes(tag, &scratch)
    }

    pub fn node(&mut self, child: Self) -> &mut Self {
        child.finish(&mut self.body);
        self
    }

    pub fn finish(self, dst: &mut Vec<u8>) {
        dst.push(NODE_BIT | self.tag);
        put_length(self.body.len(), dst);
        dst.extend_from_slice(&self.body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn varint(value: i64) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_varint(value, &mut buf);
        buf
    }

    #[test]
    fn varint_known_encodings() {
        assert_eq!(varint(0), [0x00]);
        assert_eq!(varint(19), [0x13]);
        assert_eq!(varint(63), [0x3F]);
        assert_eq!(varint(64), [0x80, 0x40]);
        assert_eq!(varint(100), [0x80, 0x64]);
        assert_eq!(varint(-1), [0x7F]);
        assert_eq!(varint(-64), [0x40]);
        assert_eq!(varint(-65), [0xFF, 0x3F]);
    }

    #[test]
    fn varint_decodes_what_it_encodes() {
        for value in [0, 1, 63, 64, 127, 128, 8191, 8192, 1 << 20, i64::from(u32::MAX), -1, -8192] {
            let buf = varint(value);
            assert_eq!(decode_varint(&buf, 10), Ok((value, buf.len())), "value {value}");
        }
    }

    #[test]
    fn varint_truncated_on_dangling_continuation() {
        assert_eq!(
            decode_varint(&[0x81], MAX_LENGTH_GROUPS),
            Err(ProtocolError::Truncated { needed: 2, available: 1 })
        );
        assert_eq!(
            decode_varint(&[], MAX_LENGTH_GROUPS),
            Err(ProtocolError::Truncated { needed: 1, available: 0 })
        );
    }

    #[test]
    fn varint_rejects_overlong() {
        let buf = [0x81, 0x81, 0x81, 0x81, 0x81, 0x01];
        assert_eq!(decode_varint(&buf, MAX_LENGTH_GROUPS), Err(ProtocolError::MalformedLength));
    }

    #[test]
    fn negative_length_is_malformed() {
        assert_eq!(decode_length(&[0x7F]), Err(ProtocolError::MalformedLength));
    }

    #[test]
    fn read_packet_reports_truncation() {
        // Declares 5 value bytes, only 2 present
        let buf = [0x01, 0x05, 0xAA, 0xBB];
        assert_eq!(
            read_packet(&buf).map(|(_, n)| n),
            Err(ProtocolError::Truncated { needed: 7, available: 4 })
        );
    }

    #[test]
    fn node_builder_nests_children() {
        let mut inner = NodeBuilder::new(0x2E);
        inner.uint32(0x01, 0x10);
        let mut outer = NodeBuilder::new(0x3F);
        outer.node(inner);
        let mut buf = Vec::new();
        outer.finish(&mut buf);

        assert_eq!(buf, [0xBF, 0x05, 0xAE, 0x03, 0x01, 0x01, 0x10]);

        let (packet, used) = read_packet(&buf).unwrap();
        assert_eq!(used, buf.len());
        let children: Vec<_> = packet.children("data").unwrap().collect();
        assert_eq!(children.len(), 1);
        let payload = children[0].as_ref().unwrap();
        assert!(payload.node);
        assert_eq!(payload.tag, 0x2E);
    }

    #[test]
    fn uint32_rejects_out_of_range() {
        let mut raw = Vec::new();
        encode_varint(1i64 << 33, &mut raw);
        let packet = Packet { tag: 1, node: false, value: &raw };
        assert_eq!(packet.uint32("tag"), Err(ProtocolError::InvalidFieldValue { field: "tag" }));
    }
}
