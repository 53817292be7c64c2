//! Multipart wire framing for the bus.
//!
//! A message is a `u32` big-endian frame count followed by that many frames,
//! each a `u32` big-endian length and the frame bytes. Data messages are
//! `[topic, payload]`. Control messages start with an empty frame, which no
//! topic can be.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::BusError;
use super::topic::Topic;

const MAX_FRAMES: usize = 16;
/// Largest frame either side will put on or accept from the wire
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const SUBSCRIBE: &[u8] = b"SUB";
const ACK: &[u8] = b"ACK";

/// One decoded bus message
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Subscriber asks for every topic under this one
    Subscribe(Topic),
    /// Publisher confirms a subscription is registered
    Ack(Topic),
    Data { topic: Topic, frames: Vec<Bytes> },
}

impl Packet {
    fn into_frames(self) -> Vec<Bytes> {
        match self {
            Packet::Subscribe(topic) => vec![
                Bytes::new(),
                Bytes::from_static(SUBSCRIBE),
                Bytes::from(topic.to_wire()),
            ],
            Packet::Ack(topic) => vec![
                Bytes::new(),
                Bytes::from_static(ACK),
                Bytes::from(topic.to_wire()),
            ],
            Packet::Data { topic, mut frames } => {
                frames.insert(0, Bytes::from(topic.to_wire()));
                frames
            }
        }
    }

    fn from_frames(mut frames: Vec<Bytes>) -> Result<Self, BusError> {
        if frames.is_empty() {
            return Err(BusError::Protocol("empty message".to_string()));
        }

        if frames[0].is_empty() {
            let [_, kind, topic] = <[Bytes; 3]>::try_from(frames)
                .map_err(|f| BusError::Protocol(format!("control message with {} frames", f.len())))?;
            let topic = Topic::parse(&frame_text(&topic)?)?;
            return match kind.as_ref() {
                SUBSCRIBE => Ok(Packet::Subscribe(topic)),
                ACK => Ok(Packet::Ack(topic)),
                other => Err(BusError::Protocol(format!(
                    "unknown control {:?}",
                    String::from_utf8_lossy(other)
                ))),
            };
        }

        let topic = Topic::parse(&frame_text(&frames.remove(0))?)?;
        Ok(Packet::Data { topic, frames })
    }
}

fn frame_text(frame: &Bytes) -> Result<String, BusError> {
    String::from_utf8(frame.to_vec())
        .map_err(|_| BusError::Protocol("frame is not UTF-8".to_string()))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BusCodec;

impl Decoder for BusCodec {
    type Item = Packet;
    type Error = BusError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, BusError> {
        if src.len() < 4 {
            return Ok(None);
        }

        let count = (&src[..4]).get_u32() as usize;
        if count > MAX_FRAMES {
            return Err(BusError::Protocol(format!("{} frames in one message", count)));
        }

        // Walk the lengths first; consume nothing until the whole message is here
        let mut offset = 4;
        let mut lengths = Vec::with_capacity(count);
        for _ in 0..count {
            if src.len() < offset + 4 {
                return Ok(None);
            }
            let len = (&src[offset..offset + 4]).get_u32() as usize;
            if len > MAX_FRAME_LEN {
                return Err(BusError::Protocol(format!("frame of {} bytes", len)));
            }
            offset += 4;
            if src.len() < offset + len {
                src.reserve(offset + len - src.len());
                return Ok(None);
            }
            lengths.push(len);
            offset += len;
        }

        src.advance(4);
        let mut frames = Vec::with_capacity(count);
        for len in lengths {
            src.advance(4);
            frames.push(src.split_to(len).freeze());
        }

        Packet::from_frames(frames).map(Some)
    }
}

impl Encoder<Packet> for BusCodec {
    type Error = BusError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), BusError> {
        let frames = packet.into_frames();
        if frames.len() > MAX_FRAMES {
            return Err(BusError::Protocol(format!("{} frames in one message", frames.len())));
        }
        if let Some(frame) = frames.iter().find(|f| f.len() > MAX_FRAME_LEN) {
            return Err(BusError::Protocol(format!("frame of {} bytes", frame.len())));
        }
        let size: usize = 4 + frames.iter().map(|f| 4 + f.len()).sum::<usize>();

        dst.reserve(size);
        dst.put_u32(frames.len() as u32);
        for frame in frames {
            dst.put_u32(frame.len() as u32);
            dst.extend_from_slice(&frame);
        }
        Ok(())
    }
}
