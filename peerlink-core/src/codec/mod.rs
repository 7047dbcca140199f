//! `tokio_util` codec turning a byte stream into [`Packet`]s.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::PeerError;
use crate::header::{FrameHeader, HEADER_SIZE};
use crate::packet::{MAX_PAYLOAD_SIZE, Packet};

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Packet;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = FrameHeader::decode(&src[..HEADER_SIZE])?;
        let payload_len = header.payload_length as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(PeerError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        if src.len() < HEADER_SIZE + payload_len {
            src.reserve(HEADER_SIZE + payload_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(payload_len).freeze();
        Packet::from_parts(header, payload).map(Some)
    }
}

impl Encoder<Packet> for FrameCodec {
    type Error = PeerError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = item.to_bytes();
        dst.reserve(bytes.len());
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Message;

    #[test]
    fn decode_waits_for_full_frame() {
        let packet = Packet::data(1, Message::Text("partial".into())).unwrap();
        let bytes = packet.to_bytes();

        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&bytes[..HEADER_SIZE + 2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&bytes[HEADER_SIZE + 2..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(Packet::heartbeat(), &mut buf).unwrap();
        codec
            .encode(Packet::channel_open(4, "files").unwrap(), &mut buf)
            .unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), Packet::heartbeat());
        let open = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(open.channel(), 4);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn rejects_oversized_length_before_buffering() {
        let mut header = Packet::heartbeat().header().encode();
        header[20..28].copy_from_slice(&((MAX_PAYLOAD_SIZE as u64) + 1).to_le_bytes());
        let mut buf = BytesMut::from(&header[..]);
        assert!(matches!(
            FrameCodec.decode(&mut buf),
            Err(PeerError::FrameTooLarge { .. })
        ));
    }
}
