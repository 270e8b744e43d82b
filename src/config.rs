//! Tunables for the coordination core.

use crate::error::{Error, Result};
use crate::hal::Direction;
use smoltcp::time::Duration;

/// The size of each transfer buffer, in bytes, used by boards that don't pick their own.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;
/// The number of bytes each reconstructed word occupies in the receive buffer.
pub const WORD_BYTES: usize = 2;
/// The widest word the sampler can reconstruct, in bits.
pub const MAX_WORD_WIDTH: u8 = (WORD_BYTES * 8) as u8;

/// Returns how many words fit in a transfer buffer of `buffer_size` bytes.
pub const fn pixel_capacity(buffer_size: usize) -> usize {
    buffer_size / WORD_BYTES
}

/// Bounds the busy-wait performed after resetting the DMA engine. The wait ends as soon as either
/// bound is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetWait {
    /// The maximum number of times the reset-done status is polled.
    pub max_polls: u32,
    /// The maximum time spent polling.
    pub timeout: Duration,
}

/// Configuration passed to [crate::platform::Core::attach] and the telemetry reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// The number of bits making up a single sample.
    pub word_width: u8,
    /// How long to wait for the DMA engine to come out of reset after a transfer error.
    pub reset_wait: ResetWait,
    /// The number of timer ticks after which the receive data path gets reset.
    pub watchdog_threshold: u32,
    /// The period of the timer driving the watchdog.
    pub tick_period: Duration,
    /// The number of attempts made to send a single datagram.
    pub send_retries: u8,
    /// The time to wait after a failed send attempt.
    pub send_retry_delay: Duration,
    /// How often to emit an interim throughput report, if at all.
    pub report_interval: Option<Duration>,
    /// How long a telemetry session lasts before it is closed, if limited.
    pub session_length: Option<Duration>,
    /// Which DMA completion raises a telemetry request.
    pub telemetry_trigger: Direction,
    /// Whether each datagram starts with a 4-byte big-endian packet id.
    pub packet_id_header: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            word_width: MAX_WORD_WIDTH,
            reset_wait: ResetWait {
                max_polls: 10_000,
                timeout: Duration::from_millis(10),
            },
            // 400 ticks of 250us each make for a 100ms window, so that the receive path can never
            // be unresponsive for longer than that.
            watchdog_threshold: 400,
            tick_period: Duration::from_micros(250),
            send_retries: 10,
            send_retry_delay: Duration::from_micros(100),
            report_interval: Some(Duration::from_secs(5)),
            session_length: Some(Duration::from_secs(180)),
            telemetry_trigger: Direction::Send,
            packet_id_header: true,
        }
    }
}

impl Config {
    /// Checks that every value is within the range the core supports.
    pub fn validate(&self) -> Result<()> {
        if self.word_width == 0 || self.word_width > MAX_WORD_WIDTH {
            return Err(Error::InvalidConfig("word_width"));
        }
        if self.reset_wait.max_polls == 0 {
            return Err(Error::InvalidConfig("reset_wait.max_polls"));
        }
        if self.watchdog_threshold == 0 {
            return Err(Error::InvalidConfig("watchdog_threshold"));
        }
        if self.tick_period == Duration::ZERO {
            return Err(Error::InvalidConfig("tick_period"));
        }
        if self.send_retries == 0 {
            return Err(Error::InvalidConfig("send_retries"));
        }
        if self.send_retry_delay.total_micros() > u32::MAX as u64 {
            return Err(Error::InvalidConfig("send_retry_delay"));
        }
        Ok(())
    }

    /// The longest the receive data path can go without being reset.
    pub fn watchdog_window(&self) -> Duration {
        Duration::from_micros(self.tick_period.total_micros() * self.watchdog_threshold as u64)
    }

    /// The size of a datagram carrying a buffer of `buffer_size` bytes.
    pub fn datagram_len(&self, buffer_size: usize) -> usize {
        if self.packet_id_header {
            buffer_size + 4
        } else {
            buffer_size
        }
    }
}
