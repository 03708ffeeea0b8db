//! The length-prefixed binary wire protocol shared by every component (C4).
//!
//! Every message on the wire is `type:u8  length:i32 (network order)
//! payload:bytes[length]`. All integers inside a payload are signed,
//! big-endian, matching the framing. This module owns encoding/decoding for
//! both the outer frame and the node/ring descriptors nested inside several
//! payloads (spec §4.3).

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::WireError;
use crate::node::{Node, NodeStatus};

/// Hard cap on a frame's payload length, enforced on both read and write
/// (spec §4.3).
pub const MAX_FRAME_LEN: i32 = 1024 * 1024;

macro_rules! wire_enum {
    ($name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub enum $name {
            $($variant = $value),+
        }

        impl $name {
            pub fn to_u8(self) -> u8 {
                self as u8
            }

            pub fn from_u8(b: u8) -> Option<Self> {
                match b {
                    $($value => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

wire_enum!(RequestKind {
    GetConfig = 1,
    NodeUnreachable = 2,
    AddNode = 3,
    RemoveNode = 4,
    ChangeNode = 5,
    GetStats = 6,
    GetObject = 7,
    PutObject = 8,
    DeleteObject = 9,
    ChangeConfig = 10,
    Register = 11,
    Ping = 12,
    FireSale = 13,
    Clear = 14,
});

wire_enum!(ResponseKind {
    InvalidRequestType = 1,
    NotMasterNode = 2,
    NotDataNode = 3,
    ObjectOk = 4,
    ObjectMissing = 5,
    ReConfigure = 6,
    Configuration = 7,
    InternalServerError = 8,
    ReadKeyError = 9,
    ReadDataError = 10,
    UnknownNode = 11,
    EndPointMismatch = 12,
    NodeExists = 13,
    Accepted = 14,
    DataNodeNotReady = 15,
});

/// A single raw frame: a one-byte kind tag and its payload. Callers on top
/// of this (the listener's dispatch table, the client's request builders)
/// interpret the kind byte as either a [`RequestKind`] or [`ResponseKind`]
/// depending on which direction the frame travels.
#[derive(Clone, Debug)]
pub struct Frame {
    pub kind: u8,
    pub payload: Vec<u8>,
}

/// Reads one frame from an async stream, rejecting oversized or negative
/// lengths before allocating a buffer for them.
pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Frame, WireError> {
    let kind = stream.read_u8().await.map_err(|_| WireError::UnexpectedEof)?;

    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|_| WireError::UnexpectedEof)?;
    let len = BigEndian::read_i32(&len_buf);

    if len < 0 {
        return Err(WireError::NegativeLength(len));
    }
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|_| WireError::UnexpectedEof)?;

    Ok(Frame { kind, payload })
}

/// Writes one frame to an async stream.
pub async fn write_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    kind: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut header = [0u8; 5];
    header[0] = kind;
    BigEndian::write_i32(&mut header[1..5], payload.len() as i32);
    stream.write_all(&header).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

/// A small forward-only cursor over a byte payload, used to decode the
/// nested, length-prefixed fields within a frame's payload.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn require(&self, n: usize) -> Result<(), WireError> {
        if self.buf.len() < n {
            Err(WireError::UnexpectedEof)
        } else {
            Ok(())
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        self.require(1)?;
        let v = self.buf[0];
        self.buf.advance(1);
        Ok(v)
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        self.require(4)?;
        let v = BigEndian::read_i32(self.buf);
        self.buf.advance(4);
        Ok(v)
    }

    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        self.require(8)?;
        let v = BigEndian::read_i64(self.buf);
        self.buf.advance(8);
        Ok(v)
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(WireError::NegativeLength(len));
        }
        let len = len as usize;
        self.require(len)?;
        let v = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(v)
    }

    pub fn read_string(&mut self) -> Result<String, WireError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)
    }

    /// Consumes and returns whatever bytes remain -- used for request kinds
    /// whose payload is "the rest of the frame is the key" (`GetObject`,
    /// `DeleteObject`).
    pub fn read_rest(&mut self) -> Vec<u8> {
        let v = self.buf.to_vec();
        self.buf.advance(self.buf.len());
        v
    }
}

/// Appends a length-prefixed byte string: `len:i32  bytes`.
pub fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_i32(bytes.len() as i32);
    buf.put_slice(bytes);
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

/// Encodes a single node descriptor (spec §4.3). `include_locations`
/// controls whether the virtual-node position list is carried or must be
/// re-derived locally by the recipient.
pub fn encode_node(buf: &mut BytesMut, node: &Node, include_locations: bool) {
    put_string(buf, &node.host);
    buf.put_i32(node.port);
    buf.put_i64(node.max_bytes);
    buf.put_u8(node.status.to_wire());
    buf.put_u8(if include_locations { 1 } else { 0 });
    if include_locations {
        buf.put_i32(node.locations.len() as i32);
        for loc in &node.locations {
            buf.put_i32(*loc);
        }
    }
}

/// Decodes a single node descriptor.
pub fn decode_node(r: &mut Reader) -> Result<Node, WireError> {
    let host = r.read_string()?;
    let port = r.read_i32()?;
    let max_bytes = r.read_i64()?;
    let status_byte = r.read_u8()?;
    let status = NodeStatus::from_wire(status_byte).unwrap_or(NodeStatus::Down);
    let include_locations = r.read_u8()? == 1;

    let mut node = Node::new(host, port, max_bytes);
    node.status = status;

    if include_locations {
        let count = r.read_i32()?;
        if count < 0 {
            return Err(WireError::NegativeLength(count));
        }
        let mut locations = Vec::with_capacity(count as usize);
        for _ in 0..count {
            locations.push(r.read_i32()?);
        }
        node.locations = locations;
    }

    Ok(node)
}

/// Encodes a full ring descriptor: `numNodes:i32` followed by that many node
/// descriptors.
pub fn encode_ring(buf: &mut BytesMut, nodes: &[Node], include_locations: bool) {
    buf.put_i32(nodes.len() as i32);
    for node in nodes {
        encode_node(buf, node, include_locations);
    }
}

/// Decodes a full ring descriptor back into a plain node list. The caller
/// decides whether to trust the embedded locations or re-run placement,
/// based on whether any node's `locations` came back empty while
/// `include_locations` was expected to be set.
pub fn decode_ring(r: &mut Reader) -> Result<Vec<Node>, WireError> {
    let count = r.read_i32()?;
    if count < 0 {
        return Err(WireError::NegativeLength(count));
    }
    let mut nodes = Vec::with_capacity(count as usize);
    for _ in 0..count {
        nodes.push(decode_node(r)?);
    }
    Ok(nodes)
}

/// Formats a RAM multiplier as the fixed two-decimal ASCII string carried in
/// `GetStats` responses (e.g. `"1.30"`), per spec §6.
pub fn format_multiplier(multiplier: f64) -> String {
    format!("{:.2}", multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    #[test]
    fn node_descriptor_roundtrips_with_locations() {
        let mut node = Node::new("cache-1", 11211, 64 * 1024 * 1024);
        node.status = NodeStatus::Up;
        node.locations = vec![10, 20, -5, i32::MAX];

        let mut buf = BytesMut::new();
        encode_node(&mut buf, &node, true);

        let mut r = Reader::new(&buf);
        let decoded = decode_node(&mut r).unwrap();

        assert_eq!(decoded.host, node.host);
        assert_eq!(decoded.port, node.port);
        assert_eq!(decoded.max_bytes, node.max_bytes);
        assert_eq!(decoded.status, node.status);
        assert_eq!(decoded.locations, node.locations);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn node_descriptor_roundtrips_without_locations() {
        let node = Node::new("cache-2", 11212, 1024);

        let mut buf = BytesMut::new();
        encode_node(&mut buf, &node, false);

        let mut r = Reader::new(&buf);
        let decoded = decode_node(&mut r).unwrap();
        assert!(decoded.locations.is_empty());
    }

    #[test]
    fn ring_descriptor_roundtrips() {
        let nodes = vec![
            Node::new("a", 1, 10),
            Node::new("b", 2, 20),
            Node::new("c", 3, 30),
        ];

        let mut buf = BytesMut::new();
        encode_ring(&mut buf, &nodes, false);

        let mut r = Reader::new(&buf);
        let decoded = decode_ring(&mut r).unwrap();

        assert_eq!(decoded.len(), nodes.len());
        for (a, b) in nodes.iter().zip(decoded.iter()) {
            assert_eq!(a.canonical_name(), b.canonical_name());
            assert_eq!(a.max_bytes, b.max_bytes);
        }
    }

    #[test]
    fn request_kind_wire_values_are_fixed() {
        assert_eq!(RequestKind::GetConfig.to_u8(), 1);
        assert_eq!(RequestKind::PutObject.to_u8(), 8);
        assert_eq!(RequestKind::Clear.to_u8(), 14);
    }

    #[test]
    fn response_kind_wire_values_are_fixed() {
        assert_eq!(ResponseKind::InvalidRequestType.to_u8(), 1);
        assert_eq!(ResponseKind::ReConfigure.to_u8(), 6);
        assert_eq!(ResponseKind::DataNodeNotReady.to_u8(), 15);
    }

    #[test]
    fn multiplier_formatting_has_two_decimals() {
        assert_eq!(format_multiplier(1.3), "1.30");
        assert_eq!(format_multiplier(1.0), "1.00");
    }

    #[tokio::test]
    async fn frame_roundtrips_over_an_in_memory_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_frame(&mut client, RequestKind::GetObject.to_u8(), b"hello")
            .await
            .unwrap();

        let frame = read_frame(&mut server).await.unwrap();
        assert_eq!(frame.kind, RequestKind::GetObject.to_u8());
        assert_eq!(frame.payload, b"hello");
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(16);
        // Write a header claiming a payload larger than the 1 MiB cap, with
        // no actual payload bytes behind it -- the reader must reject based
        // on the length alone.
        client.write_all(&[RequestKind::PutObject.to_u8()]).await.unwrap();
        let mut len_buf = [0u8; 4];
        BigEndian::write_i32(&mut len_buf, MAX_FRAME_LEN + 1);
        client.write_all(&len_buf).await.unwrap();

        let result = read_frame(&mut server).await;
        assert!(matches!(result, Err(WireError::FrameTooLarge(_))));
    }
}
