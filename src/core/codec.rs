//! Tokio codec framing D-Bus messages over a byte stream.
//!
//! Decoding is resumable: while a frame is incomplete, `decode` returns
//! `Ok(None)` and leaves the buffer untouched. File descriptors received as
//! ancillary data are queued with [`MessageCodec::push_fds`] and handed to the
//! messages that announce them, in arrival order.

use crate::config::MAX_MESSAGE_SIZE;
use crate::core::marshal::Endian;
use crate::core::message::{frame_length, Message};
use crate::error::{DbusError, Result};
use bytes::BytesMut;
use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

#[derive(Debug)]
pub struct MessageCodec {
    endian: Endian,
    max_message_size: usize,
    incoming_fds: VecDeque<OwnedFd>,
    outgoing_fds: Vec<Arc<OwnedFd>>,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            endian: Endian::Little,
            max_message_size: MAX_MESSAGE_SIZE,
            incoming_fds: VecDeque::new(),
            outgoing_fds: Vec::new(),
        }
    }

    /// Reject frames larger than `max` bytes (never above the protocol limit).
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max.min(MAX_MESSAGE_SIZE);
        self
    }

    /// Byte order used for encoded messages.
    pub fn with_endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    /// Queue fds received alongside stream bytes.
    pub fn push_fds(&mut self, fds: impl IntoIterator<Item = OwnedFd>) {
        self.incoming_fds.extend(fds);
    }

    pub fn queued_fds(&self) -> usize {
        self.incoming_fds.len()
    }

    /// Fds detached from messages passed to `encode`, to be sent with the bytes.
    pub fn take_outgoing_fds(&mut self) -> Vec<Arc<OwnedFd>> {
        std::mem::take(&mut self.outgoing_fds)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = DbusError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            let Some(total) = frame_length(src, self.max_message_size)? else {
                return Ok(None);
            };
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            let frame = src.split_to(total);
            let Some(mut message) = Message::from_bytes(&frame)? else {
                trace!(type_code = frame[1], "Ignoring message of unknown type");
                continue;
            };

            let wanted = message.declared_unix_fds() as usize;
            if wanted > 0 {
                if wanted > self.incoming_fds.len() {
                    return Err(DbusError::InvalidMessage(format!(
                        "message announces {wanted} unix fds but {} were received",
                        self.incoming_fds.len()
                    )));
                }
                let fds = self.incoming_fds.drain(..wanted).map(Arc::new).collect();
                message.attach_fds(fds);
            }
            return Ok(Some(message));
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = DbusError;

    fn encode(&mut self, mut message: Message, dst: &mut BytesMut) -> Result<()> {
        let frame = message.to_bytes(self.endian)?;
        if frame.len() > self.max_message_size {
            return Err(DbusError::InvalidMessage(format!(
                "message of {} bytes exceeds the configured {} byte limit",
                frame.len(),
                self.max_message_size
            )));
        }
        self.outgoing_fds.extend(message.take_fds());
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
