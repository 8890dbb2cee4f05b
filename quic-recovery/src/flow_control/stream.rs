//! Stream-level flow control

use super::{ConnectionFlowControl, WindowAccounting, WindowUpdates};
use crate::config::FlowControlConfig;
use crate::error::TransportError;
use crate::frame::StreamId;
use crate::rtt::SharedRttStats;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

struct StreamState {
    window: WindowAccounting,
    received_final_offset: bool,
    /// Limit the peer reported being blocked at in STREAM_DATA_BLOCKED
    peer_blocked_at: Option<u64>,
}

impl StreamState {
    /// The peer is blocked at our current limit and a read would move it
    fn peer_needs_update(&self) -> bool {
        self.peer_blocked_at == Some(self.window.receive_window())
            && self.window.bytes_read() + self.window.receive_window_size() > self.window.receive_window()
    }

    fn should_queue_window_update(&self) -> bool {
        !self.received_final_offset && (self.window.has_window_update() || self.peer_needs_update())
    }
}

/// Flow control of one stream, backed by the connection's controller
pub struct StreamFlowController {
    stream_id: StreamId,
    connection: Arc<dyn ConnectionFlowControl>,
    connection_window_multiplier: f64,
    state: Mutex<StreamState>,
}

impl StreamFlowController {
    pub fn new(
        stream_id: StreamId,
        connection: Arc<dyn ConnectionFlowControl>,
        config: &FlowControlConfig,
        initial_send_window: u64,
        rtt: SharedRttStats,
    ) -> Self {
        let window = WindowAccounting::new(
            config.initial_stream_receive_window,
            config.max_stream_receive_window,
            initial_send_window,
            rtt,
            config,
        );
        StreamFlowController {
            stream_id,
            connection,
            connection_window_multiplier: config.connection_window_multiplier,
            state: Mutex::new(StreamState {
                window,
                received_final_offset: false,
                peer_blocked_at: None,
            }),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Account a STREAM or RESET_STREAM frame ending at `offset`
    ///
    /// On error the stream's state is left unchanged.
    pub fn update_highest_received(&self, offset: u64, is_final: bool, now: Instant) -> Result<(), TransportError> {
        let (increment, previous) = {
            let mut state = self.state.lock();
            let highest = state.window.highest_received();

            if state.received_final_offset {
                if is_final && offset != highest {
                    return Err(TransportError::FinalSize(format!(
                        "received inconsistent final offset for stream {} (old: {highest}, new: {offset} bytes)",
                        self.stream_id
                    )));
                }
                if offset > highest {
                    return Err(TransportError::FinalSize(format!(
                        "received offset {offset} for stream {}, but final offset was already received at {highest}",
                        self.stream_id
                    )));
                }
            }
            if is_final && offset < highest {
                return Err(TransportError::FinalSize(format!(
                    "received final offset {offset} for stream {}, but already received offset {highest} before",
                    self.stream_id
                )));
            }
            let previous = (highest, state.received_final_offset, state.window.auto_tuning_started());
            if !state.window.record_highest_received(offset, now) {
                return Err(TransportError::FlowControl(format!(
                    "received {offset} bytes on stream {}, allowed {} bytes",
                    self.stream_id,
                    state.window.receive_window()
                )));
            }
            if is_final {
                state.received_final_offset = true;
            }
            // reordered frames below the highest offset add nothing
            (offset.saturating_sub(highest), previous)
        };

        if increment == 0 {
            return Ok(());
        }
        let result = self.connection.increment_highest_received(increment, now);
        if result.is_err() {
            let (highest, final_offset, epoch_started) = previous;
            let mut state = self.state.lock();
            if state.window.highest_received() == offset {
                state.window.restore_highest_received(highest, epoch_started);
                state.received_final_offset = final_offset;
            }
        }
        result
    }

    /// Account bytes read by the application
    pub fn add_bytes_read(&self, n: u64) -> WindowUpdates {
        let stream = {
            let mut state = self.state.lock();
            state.window.add_bytes_read(n);
            state.should_queue_window_update()
        };
        let connection = self.connection.add_bytes_read(n);
        WindowUpdates { stream, connection }
    }

    /// Give the connection back the credit of bytes that will never be read, e.g. after RESET_STREAM
    pub fn abandon(&self) {
        let unread = self.state.lock().window.abandon();
        if unread > 0 {
            self.connection.add_bytes_read(unread);
        }
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.state.lock().window.add_bytes_sent(n);
        self.connection.add_bytes_sent(n);
    }

    /// Bytes that may be sent now, limited by both the stream and the connection
    pub fn send_window_size(&self) -> u64 {
        let stream = self.state.lock().window.send_window_size();
        stream.min(self.connection.send_window_size())
    }

    /// Apply a MAX_STREAM_DATA frame; returns true if the limit increased
    pub fn update_send_window(&self, offset: u64) -> bool {
        self.state.lock().window.update_send_window(offset)
    }

    /// Limit to report in STREAM_DATA_BLOCKED, the first time it is hit
    pub fn is_newly_blocked(&self) -> Option<u64> {
        self.state.lock().window.is_newly_blocked()
    }

    /// The peer sent STREAM_DATA_BLOCKED at `limit`
    pub fn on_stream_data_blocked(&self, limit: u64) {
        let mut state = self.state.lock();
        if limit == state.window.receive_window() {
            state.peer_blocked_at = Some(limit);
        }
    }

    pub fn has_window_update(&self) -> bool {
        self.state.lock().should_queue_window_update()
    }

    /// New MAX_STREAM_DATA limit to advertise, if an update is due.
    ///
    /// Always `None` once the final size is known.
    pub fn window_update(&self, now: Instant) -> Option<u64> {
        let (offset, grown_size) = {
            let mut state = self.state.lock();
            if state.received_final_offset {
                return None;
            }
            let force = state.peer_needs_update();
            let old_size = state.window.receive_window_size();
            let offset = state.window.window_update(now, force)?;
            state.peer_blocked_at = None;
            let size = state.window.receive_window_size();
            (offset, (size > old_size).then_some(size))
        };

        if let Some(size) = grown_size {
            debug!(stream_id = self.stream_id, size, "increased stream receive window");
            let minimum = (size as f64 * self.connection_window_multiplier) as u64;
            self.connection.ensure_minimum_window_size(minimum, now);
        }
        Some(offset)
    }

    pub fn received_final_offset(&self) -> bool {
        self.state.lock().received_final_offset
    }

    pub fn highest_received(&self) -> u64 {
        self.state.lock().window.highest_received()
    }

    pub fn bytes_read(&self) -> u64 {
        self.state.lock().window.bytes_read()
    }

    pub fn receive_window(&self) -> u64 {
        self.state.lock().window.receive_window()
    }

    pub fn receive_window_size(&self) -> u64 {
        self.state.lock().window.receive_window_size()
    }
}

impl fmt::Debug for StreamFlowController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("StreamFlowController")
            .field("stream_id", &self.stream_id)
            .field("window", &state.window)
            .field("received_final_offset", &state.received_final_offset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_control::ConnectionFlowController;
    use crate::rtt::RttStats;
    use std::time::Duration;

    struct Fixture {
        connection: Arc<ConnectionFlowController>,
        stream: StreamFlowController,
    }

    fn fixture(stream_window: u64, connection_window: u64) -> Fixture {
        let mut rtt = RttStats::default();
        let now = Instant::now();
        rtt.update_rtt(now, now + Duration::from_millis(20), Duration::ZERO);
        let rtt = rtt.into_shared();
        let config = FlowControlConfig::default()
            .with_stream_window(stream_window, stream_window * 4)
            .with_connection_window(connection_window, connection_window * 8);
        let connection = Arc::new(ConnectionFlowController::new(&config, 10_000, rtt.clone()));
        let stream = StreamFlowController::new(4, connection.clone(), &config, 1_000, rtt);
        Fixture { connection, stream }
    }

    #[test]
    fn test_forwards_increments() {
        let now = Instant::now();
        let fx = fixture(1000, 5000);
        fx.stream.update_highest_received(300, false, now).unwrap();
        fx.stream.update_highest_received(200, false, now).unwrap();
        fx.stream.update_highest_received(700, false, now).unwrap();
        assert_eq!(fx.stream.highest_received(), 700);
        assert_eq!(fx.connection.highest_received(), 700);
    }

    #[test]
    fn test_flow_control_violation_leaves_state() {
        let now = Instant::now();
        let fx = fixture(1000, 5000);
        fx.stream.update_highest_received(500, false, now).unwrap();
        let err = fx.stream.update_highest_received(1001, false, now).unwrap_err();
        assert!(matches!(err, TransportError::FlowControl(_)));
        assert_eq!(fx.stream.highest_received(), 500);
        assert_eq!(fx.connection.highest_received(), 500);
    }

    #[test]
    fn test_connection_violation_leaves_stream_state() {
        let now = Instant::now();
        let fx = fixture(1000, 500);
        let err = fx.stream.update_highest_received(800, true, now).unwrap_err();
        assert!(matches!(err, TransportError::FlowControl(_)));
        assert_eq!(fx.stream.highest_received(), 0);
        assert!(!fx.stream.received_final_offset());
        assert_eq!(fx.connection.highest_received(), 0);

        // a final size within both windows is still accepted
        fx.stream.update_highest_received(400, true, now).unwrap();
        assert_eq!(fx.stream.highest_received(), 400);
        assert_eq!(fx.connection.highest_received(), 400);
    }

    #[test]
    fn test_final_offset_checks() {
        let now = Instant::now();
        let fx = fixture(1000, 5000);
        fx.stream.update_highest_received(600, true, now).unwrap();
        // retransmission of the final frame
        fx.stream.update_highest_received(600, true, now).unwrap();
        fx.stream.update_highest_received(100, false, now).unwrap();

        for (offset, is_final) in [(700, true), (500, true), (601, false)] {
            let err = fx.stream.update_highest_received(offset, is_final, now).unwrap_err();
            assert!(matches!(err, TransportError::FinalSize(_)), "{offset} {is_final}");
        }
    }

    #[test]
    fn test_final_below_highest() {
        let now = Instant::now();
        let fx = fixture(1000, 5000);
        fx.stream.update_highest_received(600, false, now).unwrap();
        let err = fx.stream.update_highest_received(500, true, now).unwrap_err();
        assert!(matches!(err, TransportError::FinalSize(_)));
        assert!(!fx.stream.received_final_offset());
    }

    #[test]
    fn test_no_window_update_after_final() {
        let now = Instant::now();
        let fx = fixture(1000, 5000);
        fx.stream.update_highest_received(1000, true, now).unwrap();
        let updates = fx.stream.add_bytes_read(1000);
        assert!(!updates.stream);
        assert_eq!(fx.stream.window_update(now), None);
    }

    #[test]
    fn test_reads_propagate_to_connection() {
        let now = Instant::now();
        let fx = fixture(1000, 1000);
        fx.stream.update_highest_received(1000, false, now).unwrap();
        let updates = fx.stream.add_bytes_read(500);
        assert_eq!(updates, WindowUpdates { stream: true, connection: true });
        assert_eq!(fx.connection.bytes_read(), 500);
    }

    #[test]
    fn test_auto_tuning_raises_connection_window() {
        let start = Instant::now();
        let fx = fixture(64 * 1024, 64 * 1024);
        fx.stream.update_highest_received(64 * 1024, false, start).unwrap();
        fx.stream.add_bytes_read(64 * 1024);

        let offset = fx.stream.window_update(start + Duration::from_millis(10)).unwrap();
        assert_eq!(fx.stream.receive_window_size(), 128 * 1024);
        assert_eq!(offset, 64 * 1024 + 128 * 1024);
        assert!(fx.connection.receive_window_size() >= 192 * 1024);
    }

    #[test]
    fn test_send_window_is_tighter_limit() {
        let fx = fixture(1000, 5000);
        assert_eq!(fx.stream.send_window_size(), 1000);
        fx.stream.add_bytes_sent(400);
        assert_eq!(fx.stream.send_window_size(), 600);

        fx.stream.update_send_window(20_000);
        assert_eq!(fx.stream.send_window_size(), 10_000 - 400);
    }

    #[test]
    fn test_newly_blocked_edge_triggered() {
        let fx = fixture(1000, 5000);
        fx.stream.add_bytes_sent(1000);
        assert_eq!(fx.stream.is_newly_blocked(), Some(1000));
        assert_eq!(fx.stream.is_newly_blocked(), None);
    }

    #[test]
    fn test_abandon_credits_connection() {
        let now = Instant::now();
        let fx = fixture(1000, 5000);
        fx.stream.update_highest_received(800, false, now).unwrap();
        fx.stream.add_bytes_read(300);
        fx.stream.abandon();
        assert_eq!(fx.connection.bytes_read(), 800);
    }

    #[test]
    fn test_peer_blocked_forces_update() {
        let now = Instant::now();
        let fx = fixture(1000, 5000);
        fx.stream.update_highest_received(1000, false, now).unwrap();
        fx.stream.on_stream_data_blocked(1000);
        assert!(!fx.stream.has_window_update());

        // a small read is enough to unblock the peer
        let updates = fx.stream.add_bytes_read(100);
        assert!(updates.stream);
        assert_eq!(fx.stream.window_update(now + Duration::from_secs(5)), Some(1100));
        assert!(!fx.stream.has_window_update());
    }
}
