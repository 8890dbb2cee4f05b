//! Connection-level flow control

use super::{ConnectionFlowControl, WindowAccounting, WindowIncreasePolicy};
use crate::config::FlowControlConfig;
use crate::error::TransportError;
use crate::rtt::SharedRttStats;
use parking_lot::Mutex;
use std::time::Instant;
use tracing::debug;

/// Aggregate flow control over all streams of a connection
#[derive(Debug)]
pub struct ConnectionFlowController {
    state: Mutex<WindowAccounting>,
}

impl ConnectionFlowController {
    pub fn new(config: &FlowControlConfig, initial_send_window: u64, rtt: SharedRttStats) -> Self {
        Self::from_window(WindowAccounting::new(
            config.initial_connection_receive_window,
            config.max_connection_receive_window,
            initial_send_window,
            rtt,
            config,
        ))
    }

    /// Connection controller asking `allow_window_increase` before each window growth
    pub fn with_increase_policy(
        config: &FlowControlConfig,
        initial_send_window: u64,
        rtt: SharedRttStats,
        allow_window_increase: WindowIncreasePolicy,
    ) -> Self {
        Self::from_window(
            WindowAccounting::new(
                config.initial_connection_receive_window,
                config.max_connection_receive_window,
                initial_send_window,
                rtt,
                config,
            )
            .with_increase_policy(allow_window_increase),
        )
    }

    fn from_window(window: WindowAccounting) -> Self {
        ConnectionFlowController {
            state: Mutex::new(window),
        }
    }

    /// New MAX_DATA limit to advertise, if an update is due
    pub fn window_update(&self, now: Instant) -> Option<u64> {
        let mut state = self.state.lock();
        let old_size = state.receive_window_size();
        let offset = state.window_update(now, false)?;
        if state.receive_window_size() > old_size {
            debug!(size = state.receive_window_size(), "increased connection receive window");
        }
        Some(offset)
    }

    pub fn has_window_update(&self) -> bool {
        self.state.lock().has_window_update()
    }

    /// Apply a MAX_DATA frame; returns true if the limit increased
    pub fn update_send_window(&self, offset: u64) -> bool {
        self.state.lock().update_send_window(offset)
    }

    /// Limit to report in DATA_BLOCKED, the first time it is hit
    pub fn is_newly_blocked(&self) -> Option<u64> {
        self.state.lock().is_newly_blocked()
    }

    /// Start over with a new peer limit after 0-RTT was rejected
    pub fn reset(&self, send_window: u64) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.has_received_data() {
            return Err(TransportError::Internal(
                "connection flow controller reset after reading data".to_string(),
            ));
        }
        state.reset_send_side(send_window);
        Ok(())
    }

    pub fn receive_window(&self) -> u64 {
        self.state.lock().receive_window()
    }

    pub fn receive_window_size(&self) -> u64 {
        self.state.lock().receive_window_size()
    }

    pub fn highest_received(&self) -> u64 {
        self.state.lock().highest_received()
    }

    pub fn bytes_read(&self) -> u64 {
        self.state.lock().bytes_read()
    }
}

impl ConnectionFlowControl for ConnectionFlowController {
    fn increment_highest_received(&self, increment: u64, now: Instant) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let highest = state.highest_received() + increment;
        if !state.record_highest_received(highest, now) {
            return Err(TransportError::FlowControl(format!(
                "received {highest} bytes, allowed {} bytes",
                state.receive_window()
            )));
        }
        Ok(())
    }

    fn add_bytes_read(&self, n: u64) -> bool {
        let mut state = self.state.lock();
        state.add_bytes_read(n);
        state.has_window_update()
    }

    fn add_bytes_sent(&self, n: u64) {
        self.state.lock().add_bytes_sent(n);
    }

    fn send_window_size(&self) -> u64 {
        self.state.lock().send_window_size()
    }

    fn ensure_minimum_window_size(&self, size: u64, now: Instant) {
        let mut state = self.state.lock();
        let old_size = state.receive_window_size();
        state.ensure_minimum_window_size(size, now);
        if state.receive_window_size() > old_size {
            debug!(size = state.receive_window_size(), "increased connection receive window for stream");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtt::RttStats;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn config() -> FlowControlConfig {
        FlowControlConfig::default().with_connection_window(1000, 4000)
    }

    fn controller() -> ConnectionFlowController {
        ConnectionFlowController::new(&config(), 500, RttStats::default().into_shared())
    }

    #[test]
    fn test_increment_and_violation() {
        let now = Instant::now();
        let fc = controller();
        fc.increment_highest_received(600, now).unwrap();
        fc.increment_highest_received(400, now).unwrap();
        let err = fc.increment_highest_received(1, now).unwrap_err();
        assert!(matches!(err, TransportError::FlowControl(_)));
        assert_eq!(fc.highest_received(), 1000);
    }

    #[test]
    fn test_window_update_after_half_read() {
        let now = Instant::now();
        let fc = controller();
        fc.increment_highest_received(1000, now).unwrap();
        assert!(!fc.add_bytes_read(400));
        assert!(fc.add_bytes_read(100));
        assert_eq!(fc.window_update(now + Duration::from_secs(60)), Some(1500));
        assert_eq!(fc.window_update(now + Duration::from_secs(60)), None);
    }

    #[test]
    fn test_send_side() {
        let fc = controller();
        fc.add_bytes_sent(500);
        assert_eq!(fc.send_window_size(), 0);
        assert_eq!(fc.is_newly_blocked(), Some(500));
        assert_eq!(fc.is_newly_blocked(), None);
        assert!(fc.update_send_window(800));
        assert_eq!(fc.send_window_size(), 300);
    }

    #[test]
    fn test_reset() {
        let now = Instant::now();
        let fc = controller();
        fc.add_bytes_sent(200);
        fc.reset(1200).unwrap();
        assert_eq!(fc.send_window_size(), 1200);

        fc.increment_highest_received(10, now).unwrap();
        assert!(matches!(fc.reset(100), Err(TransportError::Internal(_))));
    }

    #[test]
    fn test_increase_policy_consulted() {
        let now = Instant::now();
        let granted = Arc::new(AtomicU64::new(0));
        let budget = granted.clone();
        let fc = ConnectionFlowController::with_increase_policy(
            &config(),
            0,
            RttStats::default().into_shared(),
            Arc::new(move |delta| {
                budget.fetch_add(delta, Ordering::Relaxed);
                true
            }),
        );
        fc.ensure_minimum_window_size(1500, now);
        assert_eq!(fc.receive_window_size(), 1500);
        assert_eq!(granted.load(Ordering::Relaxed), 500);
    }
}
