//! Defines the framing of messages sent between nodes over TCP.
use crate::error::LiquidError;
use crate::network::{Message, MessageCodec};
use bincode::{deserialize, serialize};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio_util::codec::{Decoder, Encoder, FramedRead, LengthDelimitedCodec};

impl<T> Message<T> {
    /// Creates a new `Message`.
    pub fn new(
        msg_id: usize,
        sender_id: usize,
        target_id: usize,
        msg: T,
    ) -> Self {
        Message {
            msg_id,
            sender_id,
            target_id,
            msg,
        }
    }
}

impl<T> MessageCodec<T> {
    /// Creates a new `MessageCodec` that rejects frames longer than
    /// `max_frame_bytes`
    pub(crate) fn new(max_frame_bytes: usize) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_bytes)
            .new_codec();
        MessageCodec {
            phantom: std::marker::PhantomData,
            codec,
        }
    }

    /// Reuses the framing state of this codec for messages of another type
    pub(crate) fn retype<U>(self) -> MessageCodec<U> {
        MessageCodec {
            phantom: std::marker::PhantomData,
            codec: self.codec,
        }
    }
}

impl<T: DeserializeOwned> Decoder for MessageCodec<T> {
    type Item = Message<T>;
    type Error = LiquidError;
    /// Decodes a message by reading the length of the message (at the start of
    /// a frame) and then reading that many bytes from a buffer to complete the
    /// frame.
    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        match self.codec.decode(src)? {
            Some(data) => Ok(Some(deserialize(&data)?)),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<Message<T>> for MessageCodec<T> {
    type Error = LiquidError;
    /// Encodes a message by writing the length of the serialized message at
    /// the start of a frame, and then writing that many bytes into a buffer
    /// to be sent.
    fn encode(
        &mut self,
        item: Message<T>,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let serialized = serialize(&item)?;
        Ok(self.codec.encode(Bytes::from(serialized), dst)?)
    }
}

/// Reads the next message from the given `reader`
pub(crate) async fn read_msg<R, T>(
    reader: &mut FramedRead<R, MessageCodec<T>>,
) -> Result<Message<T>, LiquidError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match reader.next().await {
        None => Err(LiquidError::StreamClosed),
        Some(x) => x,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ControlMsg;

    #[test]
    fn test_codec_frames_messages() {
        let mut codec = MessageCodec::<ControlMsg>::new(1024);
        let mut buf = BytesMut::new();
        let first = Message::new(1, 2, 3, ControlMsg::Kill);
        let second = Message::new(
            2,
            0,
            1,
            ControlMsg::Introduction {
                address: "127.0.0.1:9000".parse().unwrap(),
            },
        );
        codec.encode(first, &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.msg_id, 1);
        assert_eq!(decoded.msg, ControlMsg::Kill);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.msg, second.msg);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_rejects_large_frames() {
        let mut codec = MessageCodec::<Vec<u8>>::new(16);
        let mut buf = BytesMut::new();
        assert!(codec
            .encode(Message::new(0, 0, 0, vec![0u8; 64]), &mut buf)
            .is_err());
    }
}
