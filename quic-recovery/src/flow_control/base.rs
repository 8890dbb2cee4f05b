//! Window accounting shared by stream and connection flow control
//!
//! Send side: bytes sent against the peer's limit. Receive side: the highest
//! offset received and the bytes the application read, against the limit we
//! advertised. The receive window is auto-tuned: if a window's worth of data
//! is consumed in less than `rtt_multiplier` smoothed RTTs, the window size
//! doubles up to its maximum.

use super::WindowIncreasePolicy;
use crate::config::FlowControlConfig;
use crate::rtt::SharedRttStats;
use std::fmt;
use std::time::Instant;

pub struct WindowAccounting {
    bytes_sent: u64,
    send_window: u64,
    last_blocked_at: u64,

    bytes_read: u64,
    highest_received: u64,
    /// Limit advertised to the peer
    receive_window: u64,
    receive_window_size: u64,
    max_receive_window_size: u64,

    epoch_start_time: Option<Instant>,
    epoch_start_offset: u64,

    update_threshold: f64,
    rtt_multiplier: f64,
    rtt: SharedRttStats,
    allow_increase: Option<WindowIncreasePolicy>,
}

impl WindowAccounting {
    pub fn new(
        receive_window: u64,
        max_receive_window: u64,
        initial_send_window: u64,
        rtt: SharedRttStats,
        config: &FlowControlConfig,
    ) -> Self {
        WindowAccounting {
            bytes_sent: 0,
            send_window: initial_send_window,
            last_blocked_at: 0,
            bytes_read: 0,
            highest_received: 0,
            receive_window,
            receive_window_size: receive_window,
            max_receive_window_size: max_receive_window.max(receive_window),
            epoch_start_time: None,
            epoch_start_offset: 0,
            update_threshold: config.window_update_threshold,
            rtt_multiplier: config.auto_tune_rtt_multiplier,
            rtt,
            allow_increase: None,
        }
    }

    /// Consult `policy` before every increase of the window size
    pub fn with_increase_policy(mut self, policy: WindowIncreasePolicy) -> Self {
        self.allow_increase = Some(policy);
        self
    }

    pub fn add_bytes_sent(&mut self, n: u64) {
        self.bytes_sent += n;
    }

    /// Raise the peer's limit; lower values are ignored
    pub fn update_send_window(&mut self, offset: u64) -> bool {
        if offset > self.send_window {
            self.send_window = offset;
            return true;
        }
        false
    }

    pub fn send_window_size(&self) -> u64 {
        self.send_window.saturating_sub(self.bytes_sent)
    }

    /// The limit we are blocked at, the first time it is hit
    pub fn is_newly_blocked(&mut self) -> Option<u64> {
        if self.send_window_size() != 0 || self.send_window == self.last_blocked_at {
            return None;
        }
        self.last_blocked_at = self.send_window;
        Some(self.send_window)
    }

    /// Record a higher received offset; false if it exceeds the advertised window
    pub fn record_highest_received(&mut self, offset: u64, now: Instant) -> bool {
        if offset > self.receive_window {
            return false;
        }
        if offset <= self.highest_received {
            return true;
        }
        if self.epoch_start_time.is_none() {
            self.start_auto_tuning_epoch(now);
        }
        self.highest_received = offset;
        true
    }

    /// Undo a [`record_highest_received`](Self::record_highest_received) the connection refused
    pub fn restore_highest_received(&mut self, highest: u64, epoch_started: bool) {
        self.highest_received = highest;
        if !epoch_started {
            self.epoch_start_time = None;
        }
    }

    pub fn auto_tuning_started(&self) -> bool {
        self.epoch_start_time.is_some()
    }

    pub fn add_bytes_read(&mut self, n: u64) {
        self.bytes_read += n;
    }

    /// Mark all received bytes as read, returning how many were never read
    pub fn abandon(&mut self) -> u64 {
        let unread = self.highest_received.saturating_sub(self.bytes_read);
        self.bytes_read = self.bytes_read.max(self.highest_received);
        unread
    }

    /// Enough of the window was consumed to send an update
    pub fn has_window_update(&self) -> bool {
        let remaining = self.receive_window.saturating_sub(self.bytes_read);
        remaining as f64 <= self.receive_window_size as f64 * (1.0 - self.update_threshold)
    }

    /// Auto-tune and advance the advertised window, if an update is due or `force`d
    pub fn window_update(&mut self, now: Instant, force: bool) -> Option<u64> {
        if !force && !self.has_window_update() {
            return None;
        }
        self.maybe_adjust_window_size(now);
        let window = self.bytes_read + self.receive_window_size;
        if window <= self.receive_window {
            return None;
        }
        self.receive_window = window;
        Some(window)
    }

    /// Grow the window size to at least `size`, bounded by the maximum
    pub fn ensure_minimum_window_size(&mut self, size: u64, now: Instant) {
        if size <= self.receive_window_size {
            return;
        }
        let new_size = size.min(self.max_receive_window_size);
        if new_size > self.receive_window_size && self.increase_allowed(new_size - self.receive_window_size) {
            self.receive_window_size = new_size;
        }
        self.start_auto_tuning_epoch(now);
    }

    fn maybe_adjust_window_size(&mut self, now: Instant) {
        let Some(epoch_start) = self.epoch_start_time else {
            self.start_auto_tuning_epoch(now);
            return;
        };
        let read_in_epoch = self.bytes_read - self.epoch_start_offset;
        if read_in_epoch <= self.receive_window_size / 2 {
            return;
        }
        let srtt = {
            let rtt = self.rtt.read();
            if !rtt.has_measurement() {
                return;
            }
            rtt.smoothed_rtt()
        };

        let fraction = read_in_epoch as f64 / self.receive_window_size as f64;
        if now.saturating_duration_since(epoch_start) < srtt.mul_f64(self.rtt_multiplier * fraction) {
            let new_size = (2 * self.receive_window_size).min(self.max_receive_window_size);
            if new_size > self.receive_window_size && self.increase_allowed(new_size - self.receive_window_size) {
                self.receive_window_size = new_size;
            }
        }
        self.start_auto_tuning_epoch(now);
    }

    fn increase_allowed(&self, delta: u64) -> bool {
        self.allow_increase.as_ref().map_or(true, |allow| allow(delta))
    }

    fn start_auto_tuning_epoch(&mut self, now: Instant) {
        self.epoch_start_time = Some(now);
        self.epoch_start_offset = self.bytes_read;
    }

    /// Anything received or read, or auto-tuning started
    pub fn has_received_data(&self) -> bool {
        self.bytes_read > 0 || self.highest_received > 0 || self.epoch_start_time.is_some()
    }

    /// Forget the send side, for a new peer limit
    pub fn reset_send_side(&mut self, send_window: u64) {
        self.bytes_sent = 0;
        self.last_blocked_at = 0;
        self.send_window = send_window;
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn send_window(&self) -> u64 {
        self.send_window
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn highest_received(&self) -> u64 {
        self.highest_received
    }

    pub fn receive_window(&self) -> u64 {
        self.receive_window
    }

    pub fn receive_window_size(&self) -> u64 {
        self.receive_window_size
    }

    pub fn max_receive_window_size(&self) -> u64 {
        self.max_receive_window_size
    }
}

impl fmt::Debug for WindowAccounting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowAccounting")
            .field("bytes_sent", &self.bytes_sent)
            .field("send_window", &self.send_window)
            .field("bytes_read", &self.bytes_read)
            .field("highest_received", &self.highest_received)
            .field("receive_window", &self.receive_window)
            .field("receive_window_size", &self.receive_window_size)
            .finish()
    }
}
