//! Frames carried by sent packets and their recovery callbacks
//!
//! Loss recovery never retransmits packets itself. Every sent packet carries
//! the list of frames it contained, each optionally paired with a
//! [`FrameHandler`]. When the packet is acknowledged or declared lost the
//! handler is told, so the layer that produced the frame can forget or
//! re-queue its data.

use std::fmt;
use std::sync::Arc;

/// Stream identifier (RFC 9000 §2.1)
pub type StreamId = u64;

/// Descriptor of a frame placed in a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// PADDING; counts towards bytes in flight but is not ack-eliciting
    Padding { len: u64 },
    /// PING
    Ping,
    /// ACK, with the largest packet number it acknowledged
    Ack { largest_acked: u64 },
    /// CRYPTO data
    Crypto { offset: u64, len: u64 },
    /// STREAM data
    Stream {
        stream_id: StreamId,
        offset: u64,
        len: u64,
        fin: bool,
    },
    /// RESET_STREAM
    ResetStream { stream_id: StreamId, final_size: u64 },
    /// MAX_DATA
    MaxData { maximum: u64 },
    /// MAX_STREAM_DATA
    MaxStreamData { stream_id: StreamId, maximum: u64 },
    /// DATA_BLOCKED
    DataBlocked { limit: u64 },
    /// STREAM_DATA_BLOCKED
    StreamDataBlocked { stream_id: StreamId, limit: u64 },
    /// HANDSHAKE_DONE
    HandshakeDone,
    /// Any other frame, identified by its frame type
    Other { frame_type: u64 },
}

impl Frame {
    /// Frames other than ACK and PADDING require acknowledgment (RFC 9002 §2)
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(self, Frame::Ack { .. } | Frame::Padding { .. })
    }
}

/// Callback notified about the fate of a frame
pub trait FrameHandler: Send + Sync {
    /// The packet carrying `frame` was acknowledged.
    fn on_acked(&self, frame: &Frame);

    /// The packet carrying `frame` was declared lost; its data should be resent.
    fn on_lost(&self, frame: &Frame);
}

/// A frame together with its recovery callback
#[derive(Clone)]
pub struct SentFrame {
    pub frame: Frame,
    pub handler: Option<Arc<dyn FrameHandler>>,
}

impl SentFrame {
    /// Frame whose fate nobody needs to learn about
    pub fn new(frame: Frame) -> Self {
        SentFrame {
            frame,
            handler: None,
        }
    }

    /// Frame with a recovery callback
    pub fn with_handler(frame: Frame, handler: Arc<dyn FrameHandler>) -> Self {
        SentFrame {
            frame,
            handler: Some(handler),
        }
    }

    pub(crate) fn notify_acked(&self) {
        if let Some(handler) = &self.handler {
            handler.on_acked(&self.frame);
        }
    }

    pub(crate) fn notify_lost(&self) {
        if let Some(handler) = &self.handler {
            handler.on_lost(&self.frame);
        }
    }
}

impl fmt::Debug for SentFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SentFrame")
            .field("frame", &self.frame)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

impl From<Frame> for SentFrame {
    fn from(frame: Frame) -> Self {
        SentFrame::new(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        acked: Mutex<Vec<Frame>>,
        lost: Mutex<Vec<Frame>>,
    }

    impl FrameHandler for Recorder {
        fn on_acked(&self, frame: &Frame) {
            self.acked.lock().push(frame.clone());
        }

        fn on_lost(&self, frame: &Frame) {
            self.lost.lock().push(frame.clone());
        }
    }

    #[test]
    fn test_ack_eliciting() {
        assert!(Frame::Ping.is_ack_eliciting());
        assert!(Frame::HandshakeDone.is_ack_eliciting());
        assert!(!Frame::Ack { largest_acked: 3 }.is_ack_eliciting());
        assert!(!Frame::Padding { len: 10 }.is_ack_eliciting());
    }

    #[test]
    fn test_handler_notified() {
        let recorder = Arc::new(Recorder::default());
        let frame = Frame::MaxData { maximum: 1000 };
        let sent = SentFrame::with_handler(frame.clone(), recorder.clone());

        sent.notify_acked();
        sent.notify_lost();
        SentFrame::new(Frame::Ping).notify_lost();

        assert_eq!(*recorder.acked.lock(), vec![frame.clone()]);
        assert_eq!(*recorder.lost.lock(), vec![frame]);
    }
}
