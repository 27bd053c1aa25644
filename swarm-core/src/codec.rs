use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::endpoint::PeerEndpoint;
use crate::error::ConnError;

// Frames larger than this are treated as a protocol violation rather than an
// in-progress read; guards against a bogus length prefix stalling forever.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// The tracker's request/response vocabulary (spec §4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerMessage {
    // Requests.
    RegisterPeer { filename: Vec<u8>, data_port: u16 },
    PeerList { filename: Vec<u8> },

    // Responses.
    Success,
    PeerListResp { peers: Vec<PeerEndpoint> },
    TrackerError { reason: String },
}

/// The peer request/response vocabulary (spec §4.1), plus `BitmapRequest`/
/// `BitmapResp`, added per SPEC_FULL.md §11 so a worker can learn a peer's
/// bitfield independent of its one-shot metadata response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    // Requests.
    MetadataRequest { filename: Vec<u8> },
    BitmapRequest { filename: Vec<u8> },
    BlockRequest { filename: Vec<u8>, block_index: u32 },

    // Responses.
    MetadataResp { file_size: u64, block_size: u32 },
    BitmapResp { bits: Vec<u8> },
    BlockResp { block_index: u32, bytes: Vec<u8> },
    PeerError { reason: String },
}

fn put_bytes(dst: &mut BytesMut, bytes: &[u8]) {
    dst.put_u32(bytes.len() as u32);
    dst.extend_from_slice(bytes);
}

fn get_bytes(src: &mut BytesMut) -> Result<Vec<u8>, ConnError> {
    if src.remaining() < 4 {
        return Err(ConnError::Protocol("truncated length prefix".into()));
    }
    let len = src.get_u32() as usize;
    if src.remaining() < len {
        return Err(ConnError::Protocol("declared length exceeds frame".into()));
    }
    let mut buf = vec![0u8; len];
    src.copy_to_slice(&mut buf);
    Ok(buf)
}

fn get_string(src: &mut BytesMut) -> Result<String, ConnError> {
    let bytes = get_bytes(src)?;
    String::from_utf8(bytes).map_err(|e| ConnError::Protocol(e.to_string()))
}

pub struct TrackerCodec;

impl Encoder<TrackerMessage> for TrackerCodec {
    type Error = ConnError;

    fn encode(&mut self, msg: TrackerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        match msg {
            TrackerMessage::RegisterPeer { filename, data_port } => {
                body.put_u8(0);
                put_bytes(&mut body, &filename);
                body.put_u16(data_port);
            }
            TrackerMessage::PeerList { filename } => {
                body.put_u8(1);
                put_bytes(&mut body, &filename);
            }
            TrackerMessage::Success => {
                body.put_u8(2);
            }
            TrackerMessage::PeerListResp { peers } => {
                body.put_u8(3);
                body.put_u32(peers.len() as u32);
                for peer in peers {
                    put_bytes(&mut body, peer.host.as_bytes());
                    body.put_u16(peer.data_port);
                }
            }
            TrackerMessage::TrackerError { reason } => {
                body.put_u8(4);
                put_bytes(&mut body, reason.as_bytes());
            }
        }
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for TrackerCodec {
    type Item = TrackerMessage;
    type Error = ConnError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.remaining() < 4 {
            return Ok(None);
        }
        let mut peeker = std::io::Cursor::new(&src[..]);
        let len = peeker.get_u32();
        if len > MAX_FRAME_LEN {
            return Err(ConnError::Protocol(format!("frame of {len} bytes exceeds sanity limit")));
        }
        if src.remaining() < 4 + len as usize {
            return Ok(None);
        }
        src.advance(4);
        let mut frame = src.split_to(len as usize);

        if frame.remaining() < 1 {
            return Err(ConnError::Protocol("empty frame".into()));
        }
        let tag = frame.get_u8();
        let msg = match tag {
            0 => {
                let filename = get_bytes(&mut frame)?;
                if frame.remaining() < 2 {
                    return Err(ConnError::Protocol("truncated RegisterPeer".into()));
                }
                let data_port = frame.get_u16();
                TrackerMessage::RegisterPeer { filename, data_port }
            }
            1 => TrackerMessage::PeerList { filename: get_bytes(&mut frame)? },
            2 => TrackerMessage::Success,
            3 => {
                if frame.remaining() < 4 {
                    return Err(ConnError::Protocol("truncated PeerListResp".into()));
                }
                let count = frame.get_u32();
                let mut peers = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let host = get_string(&mut frame)?;
                    if frame.remaining() < 2 {
                        return Err(ConnError::Protocol("truncated peer entry".into()));
                    }
                    let data_port = frame.get_u16();
                    peers.push(PeerEndpoint::new(host, data_port));
                }
                TrackerMessage::PeerListResp { peers }
            }
            4 => TrackerMessage::TrackerError { reason: get_string(&mut frame)? },
            other => return Err(ConnError::Protocol(format!("unknown tracker message tag: {other}"))),
        };

        Ok(Some(msg))
    }
}

pub struct PeerCodec;

impl Encoder<PeerMessage> for PeerCodec {
    type Error = ConnError;

    fn encode(&mut self, msg: PeerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        match msg {
            PeerMessage::MetadataRequest { filename } => {
                body.put_u8(0);
                put_bytes(&mut body, &filename);
            }
            PeerMessage::BitmapRequest { filename } => {
                body.put_u8(1);
                put_bytes(&mut body, &filename);
            }
            PeerMessage::BlockRequest { filename, block_index } => {
                body.put_u8(2);
                put_bytes(&mut body, &filename);
                body.put_u32(block_index);
            }
            PeerMessage::MetadataResp { file_size, block_size } => {
                body.put_u8(3);
                body.put_u64(file_size);
                body.put_u32(block_size);
            }
            PeerMessage::BitmapResp { bits } => {
                body.put_u8(4);
                put_bytes(&mut body, &bits);
            }
            PeerMessage::BlockResp { block_index, bytes } => {
                body.put_u8(5);
                body.put_u32(block_index);
                put_bytes(&mut body, &bytes);
            }
            PeerMessage::PeerError { reason } => {
                body.put_u8(6);
                put_bytes(&mut body, reason.as_bytes());
            }
        }
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = PeerMessage;
    type Error = ConnError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.remaining() < 4 {
            return Ok(None);
        }
        let mut peeker = std::io::Cursor::new(&src[..]);
        let len = peeker.get_u32();
        if len > MAX_FRAME_LEN {
            return Err(ConnError::Protocol(format!("frame of {len} bytes exceeds sanity limit")));
        }
        if src.remaining() < 4 + len as usize {
            return Ok(None);
        }
        src.advance(4);
        let mut frame = src.split_to(len as usize);

        if frame.remaining() < 1 {
            return Err(ConnError::Protocol("empty frame".into()));
        }
        let tag = frame.get_u8();
        let msg = match tag {
            0 => PeerMessage::MetadataRequest { filename: get_bytes(&mut frame)? },
            1 => PeerMessage::BitmapRequest { filename: get_bytes(&mut frame)? },
            2 => {
                let filename = get_bytes(&mut frame)?;
                if frame.remaining() < 4 {
                    return Err(ConnError::Protocol("truncated BlockRequest".into()));
                }
                let block_index = frame.get_u32();
                PeerMessage::BlockRequest { filename, block_index }
            }
            3 => {
                if frame.remaining() < 12 {
                    return Err(ConnError::Protocol("truncated MetadataResp".into()));
                }
                let file_size = frame.get_u64();
                let block_size = frame.get_u32();
                PeerMessage::MetadataResp { file_size, block_size }
            }
            4 => PeerMessage::BitmapResp { bits: get_bytes(&mut frame)? },
            5 => {
                if frame.remaining() < 4 {
                    return Err(ConnError::Protocol("truncated BlockResp".into()));
                }
                let block_index = frame.get_u32();
                let bytes = get_bytes(&mut frame)?;
                PeerMessage::BlockResp { block_index, bytes }
            }
            6 => PeerMessage::PeerError { reason: get_string(&mut frame)? },
            other => return Err(ConnError::Protocol(format!("unknown peer message tag: {other}"))),
        };

        Ok(Some(msg))
    }
}
