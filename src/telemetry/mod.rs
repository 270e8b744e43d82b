//! Sends the acquired data to a remote peer as a stream of fixed-size datagrams, and keeps track
//! of the throughput of the session.
//!
//! Each datagram carries a copy of the send buffer, optionally preceded by a 4-byte big-endian
//! packet id. The id counts up from 0 and is -1 for the datagram closing the session.

pub mod command;
pub mod smoltcp;
pub mod transport;

use crate::config::Config;
use crate::debug_util::{self, FormatQuantity};
use byteorder::{ByteOrder, NetworkEndian};
use log::{error, info, log_enabled, warn};
use ::smoltcp::time::{Duration, Instant};

pub use command::Command;
pub use transport::DatagramTransport;

/// The packet id carried by the datagram that closes a session.
pub const CLOSING_PACKET_ID: i32 = -1;

/// The result of [Reporter::send_one].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// The datagram was handed to the transport.
    Sent,
    /// The closing datagram was sent (or not, see `delivered`) and the endpoint was released.
    Closed { delivered: bool },
    /// The transport rejected every attempt. The endpoint was released and the session ended.
    RetryExhausted,
    /// The session has already ended, so nothing was sent.
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    /// Covers the datagrams sent since the previous interim report.
    Interim,
    /// Covers the whole session.
    Final,
}

/// A throughput report. Times are relative to the start of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub kind: ReportKind,
    pub session_id: u32,
    pub start: Duration,
    pub end: Duration,
    pub bytes: u64,
    pub datagrams: u64,
}

impl Report {
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// The average throughput over the report's time window, in bits per second.
    pub fn bandwidth_bps(&self) -> u64 {
        let micros = self.duration().total_micros();
        if micros == 0 {
            return 0;
        }
        self.bytes * 8 * 1_000_000 / micros
    }
}

/// Receives the throughput reports emitted by a [Reporter].
pub trait ReportSink {
    fn report(&mut self, report: &Report);
}

/// A [ReportSink] that prints each report to the log, in the same layout iperf uses.
#[derive(Default, Debug, Clone, Copy)]
pub struct LogReportSink;

impl ReportSink for LogReportSink {
    fn report(&mut self, report: &Report) {
        info!(
            "[{:3}] {:4.1}-{:4.1} sec  {}Bytes  {}bits/sec",
            report.session_id,
            report.start.total_millis() as f32 / 1000.0,
            report.end.total_millis() as f32 / 1000.0,
            FormatQuantity::bytes(report.bytes),
            FormatQuantity::rate(report.bandwidth_bps()),
        );
        if report.kind == ReportKind::Final {
            info!(
                "[{:3}] sent {} datagrams",
                report.session_id, report.datagrams
            );
        }
    }
}

/// The counters of a telemetry session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub session_id: u32,
    pub start: Instant,
    pub total_bytes: u64,
    pub datagrams: u64,
    /// The start of the current interim report window, if one is open.
    pub interval_start: Option<Instant>,
    pub interval_bytes: u64,
    pub interval_datagrams: u64,
}

impl SessionStats {
    fn new(session_id: u32, start: Instant) -> SessionStats {
        SessionStats {
            session_id,
            start,
            total_bytes: 0,
            datagrams: 0,
            interval_start: None,
            interval_bytes: 0,
            interval_datagrams: 0,
        }
    }

    fn record(&mut self, len: usize) {
        self.total_bytes += len as u64;
        self.datagrams += 1;
        self.interval_bytes += len as u64;
        self.interval_datagrams += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    /// Closed after sending the closing datagram.
    Closed,
    /// Terminated after running out of send retries.
    Terminated,
}

/// Sends datagrams built from a snapshot of an `N`-byte send buffer over a [DatagramTransport].
pub struct Reporter<T, D, S, const N: usize> {
    transport: T,
    delay: D,
    sink: S,
    config: Config,
    payload: [u8; N],
    packet_id: i32,
    state: SessionState,
    stats: SessionStats,
    finish_requested: bool,
}

impl<T: DatagramTransport, D: crate::hal::Delay, S: ReportSink, const N: usize>
    Reporter<T, D, S, N>
{
    /// Starts a telemetry session over an already connected transport.
    pub fn new(transport: T, delay: D, sink: S, config: &Config, now: Instant) -> Self {
        info!("Telemetry session 1 started");
        Reporter {
            transport,
            delay,
            sink,
            config: *config,
            payload: [0; N],
            packet_id: 0,
            state: SessionState::Open,
            stats: SessionStats::new(1, now),
            finish_requested: false,
        }
    }

    /// Returns whether datagrams can still be sent in this session.
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// The snapshot of the send buffer that the next datagram will carry.
    pub fn payload_mut(&mut self) -> &mut [u8; N] {
        &mut self.payload
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Makes the next [Reporter::tick] close the session.
    pub fn request_finish(&mut self) {
        self.finish_requested = true;
    }

    pub fn finish_requested(&self) -> bool {
        self.finish_requested && self.is_open()
    }

    /// Sends a single datagram carrying the current payload.
    ///
    /// Up to [Config::send_retries] attempts are made, waiting [Config::send_retry_delay] after
    /// each failed attempt. If all of them fail, a final report is emitted and the session ends.
    ///
    /// If `finished` is set the closing datagram is sent instead, with a single attempt, after
    /// which the endpoint is released regardless of the outcome.
    pub fn send_one(&mut self, finished: bool, now: Instant) -> SendResult {
        if !self.is_open() {
            return SendResult::Inactive;
        }
        if finished {
            self.packet_id = CLOSING_PACKET_ID;
        }

        let len = self.config.datagram_len(N);
        let attempts = if finished { 1 } else { self.config.send_retries };
        // Config::validate guarantees the delay fits.
        let retry_delay_us = self.config.send_retry_delay.total_micros() as u32;
        let header = self.config.packet_id_header;
        let packet_id = self.packet_id;
        let payload = &self.payload;

        let mut delivered = false;
        for attempt in 1..=attempts {
            let result = self.transport.send_with(len, |datagram| {
                fill_datagram(datagram, header, packet_id, payload);
                if log_enabled!(log::Level::Trace) {
                    debug_util::log_data_hex(log::Level::Trace, datagram);
                }
            });
            match result {
                Ok(()) => {
                    self.stats.record(len);
                    delivered = true;
                    break;
                }
                Err(err) => {
                    warn!("Error on datagram send (attempt {attempt}/{attempts}): {err:?}");
                    self.delay.delay_us(retry_delay_us);
                }
            }
        }

        if finished {
            self.transport.close();
            self.state = SessionState::Closed;
            info!("Telemetry session {} closed", self.stats.session_id);
            return SendResult::Closed { delivered };
        }
        if !delivered {
            self.emit_report(ReportKind::Final, now);
            error!("Too many datagram send retries, terminating telemetry session");
            self.transport.close();
            self.state = SessionState::Terminated;
            return SendResult::RetryExhausted;
        }
        self.packet_id = self.packet_id.wrapping_add(1);
        SendResult::Sent
    }

    /// Evaluates the reporting schedule. Must be called once per main loop iteration.
    ///
    /// Emits an interim report whenever [Config::report_interval] has passed since the previous
    /// one. Once [Config::session_length] has passed, or a finish was requested, the closing
    /// datagram is sent and the final report is emitted; the result of that send is returned.
    pub fn tick(&mut self, now: Instant) -> Option<SendResult> {
        if !self.is_open() {
            return None;
        }

        if let Some(interval) = self.config.report_interval {
            match self.stats.interval_start {
                Some(start) if now - start >= interval => {
                    self.emit_report(ReportKind::Interim, now);
                    self.stats.interval_start = None;
                    self.stats.interval_bytes = 0;
                    self.stats.interval_datagrams = 0;
                }
                Some(_) => {}
                None => self.stats.interval_start = Some(now),
            }
        }

        let expired = self
            .config
            .session_length
            .map_or(false, |length| now - self.stats.start >= length);
        if self.finish_requested || expired {
            let result = self.send_one(true, now);
            self.emit_report(ReportKind::Final, now);
            return Some(result);
        }
        None
    }

    fn emit_report(&mut self, kind: ReportKind, now: Instant) {
        let end = now - self.stats.start;
        let report = match kind {
            ReportKind::Interim => Report {
                kind,
                session_id: self.stats.session_id,
                start: self
                    .stats
                    .interval_start
                    .map_or(Duration::ZERO, |start| start - self.stats.start),
                end,
                bytes: self.stats.interval_bytes,
                datagrams: self.stats.interval_datagrams,
            },
            ReportKind::Final => Report {
                kind,
                session_id: self.stats.session_id,
                start: Duration::ZERO,
                end,
                bytes: self.stats.total_bytes,
                datagrams: self.stats.datagrams,
            },
        };
        self.sink.report(&report);
    }
}

/// Writes the datagram header (if enabled) followed by the payload into `datagram`, which must
/// be exactly as long as the header plus the payload.
fn fill_datagram(datagram: &mut [u8], header: bool, packet_id: i32, payload: &[u8]) {
    if header {
        NetworkEndian::write_i32(&mut datagram[..4], packet_id);
        datagram[4..].copy_from_slice(payload);
    } else {
        datagram.copy_from_slice(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{FakeTransport, RecordingDelay, RecordingSink};

    const N: usize = 16;

    fn reporter(
        config: &Config,
    ) -> (
        Reporter<FakeTransport, RecordingDelay, RecordingSink, N>,
        FakeTransport,
        RecordingDelay,
        RecordingSink,
    ) {
        let transport = FakeTransport::default();
        let delay = RecordingDelay::default();
        let sink = RecordingSink::default();
        let reporter = Reporter::new(
            transport.clone(),
            delay.clone(),
            sink.clone(),
            config,
            Instant::ZERO,
        );
        (reporter, transport, delay, sink)
    }

    #[test]
    fn sends_payload_with_packet_id_header() {
        let (mut reporter, transport, _, _) = reporter(&Config::default());
        reporter.payload_mut().copy_from_slice(&[0xAB; N]);
        assert_eq!(reporter.send_one(false, Instant::ZERO), SendResult::Sent);
        assert_eq!(reporter.send_one(false, Instant::ZERO), SendResult::Sent);

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(&sent[0][..4], &[0, 0, 0, 0]);
        assert_eq!(&sent[1][..4], &[0, 0, 0, 1]);
        assert_eq!(&sent[1][4..], &[0xAB; N]);
        assert_eq!(reporter.stats().total_bytes, 2 * (N as u64 + 4));
        assert_eq!(reporter.stats().datagrams, 2);
    }

    #[test]
    fn sends_bare_payload_without_header() {
        let config = Config {
            packet_id_header: false,
            ..Config::default()
        };
        let (mut reporter, transport, _, _) = reporter(&config);
        reporter.payload_mut()[0] = 7;
        assert_eq!(reporter.send_one(false, Instant::ZERO), SendResult::Sent);
        assert_eq!(transport.sent()[0].len(), N);
        assert_eq!(transport.sent()[0][0], 7);
    }

    #[test]
    fn success_after_failures_stops_retrying() {
        let (mut reporter, transport, delay, _) = reporter(&Config::default());
        transport.fail_next(3);
        assert_eq!(reporter.send_one(false, Instant::ZERO), SendResult::Sent);
        assert_eq!(transport.attempts(), 4);
        assert_eq!(delay.delays(), vec![100, 100, 100]);
        // Only the successful attempt is counted, exactly once.
        assert_eq!(reporter.stats().total_bytes, N as u64 + 4);
        assert_eq!(reporter.stats().datagrams, 1);
        assert!(reporter.is_open());
    }

    #[test]
    fn exhausting_retries_terminates_the_session() {
        let config = Config {
            send_retries: 5,
            ..Config::default()
        };
        let (mut reporter, transport, delay, sink) = reporter(&config);
        transport.fail_next(u32::MAX);
        assert_eq!(
            reporter.send_one(false, Instant::from_secs(2)),
            SendResult::RetryExhausted
        );
        assert_eq!(transport.attempts(), 5);
        assert_eq!(delay.delays().len(), 5);
        assert!(transport.is_closed());
        assert!(!reporter.is_open());
        assert_eq!(reporter.stats().total_bytes, 0);

        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, ReportKind::Final);
        assert_eq!(reports[0].end, Duration::from_secs(2));

        // No further sends once terminated.
        assert_eq!(
            reporter.send_one(false, Instant::from_secs(3)),
            SendResult::Inactive
        );
        assert_eq!(transport.attempts(), 5);
    }

    #[test]
    fn closing_datagram_is_attempted_once() {
        let (mut reporter, transport, _, _) = reporter(&Config::default());
        transport.fail_next(1);
        assert_eq!(
            reporter.send_one(true, Instant::ZERO),
            SendResult::Closed { delivered: false }
        );
        assert_eq!(transport.attempts(), 1);
        assert!(transport.is_closed());
        assert_eq!(reporter.send_one(false, Instant::ZERO), SendResult::Inactive);
    }

    #[test]
    fn closing_datagram_carries_sentinel_id() {
        let (mut reporter, transport, _, _) = reporter(&Config::default());
        assert_eq!(
            reporter.send_one(true, Instant::ZERO),
            SendResult::Closed { delivered: true }
        );
        assert_eq!(&transport.sent()[0][..4], &[0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn interim_reports_follow_the_interval() {
        let config = Config {
            report_interval: Some(Duration::from_secs(5)),
            session_length: None,
            ..Config::default()
        };
        let (mut reporter, _, _, sink) = reporter(&config);
        // The first tick opens the report window.
        assert_eq!(reporter.tick(Instant::from_secs(1)), None);
        reporter.send_one(false, Instant::from_secs(2));
        reporter.send_one(false, Instant::from_secs(3));
        assert_eq!(reporter.tick(Instant::from_secs(4)), None);
        assert!(sink.reports().is_empty());
        assert_eq!(reporter.tick(Instant::from_secs(6)), None);

        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, ReportKind::Interim);
        assert_eq!(reports[0].start, Duration::from_secs(1));
        assert_eq!(reports[0].end, Duration::from_secs(6));
        assert_eq!(reports[0].datagrams, 2);
        assert_eq!(reports[0].bytes, 2 * (N as u64 + 4));
        assert_eq!(reporter.stats().interval_bytes, 0);
    }

    #[test]
    fn session_ends_after_its_length() {
        let config = Config {
            report_interval: None,
            session_length: Some(Duration::from_secs(10)),
            ..Config::default()
        };
        let (mut reporter, transport, _, sink) = reporter(&config);
        assert_eq!(reporter.tick(Instant::from_secs(9)), None);
        assert_eq!(
            reporter.tick(Instant::from_secs(10)),
            Some(SendResult::Closed { delivered: true })
        );
        assert!(transport.is_closed());
        let reports = sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, ReportKind::Final);
        assert_eq!(reports[0].datagrams, 1);
        assert_eq!(reporter.tick(Instant::from_secs(11)), None);
    }

    #[test]
    fn requested_finish_closes_on_next_tick() {
        let config = Config {
            session_length: None,
            ..Config::default()
        };
        let (mut reporter, transport, _, _) = reporter(&config);
        reporter.request_finish();
        assert!(reporter.finish_requested());
        assert_eq!(
            reporter.tick(Instant::from_secs(1)),
            Some(SendResult::Closed { delivered: true })
        );
        assert!(transport.is_closed());
        assert!(!reporter.finish_requested());
    }

    #[test]
    fn bandwidth() {
        let report = Report {
            kind: ReportKind::Interim,
            session_id: 1,
            start: Duration::from_secs(1),
            end: Duration::from_secs(3),
            bytes: 1000,
            datagrams: 1,
        };
        assert_eq!(report.bandwidth_bps(), 4000);
        let empty = Report {
            end: Duration::from_secs(1),
            ..report
        };
        assert_eq!(empty.bandwidth_bps(), 0);
    }
}
