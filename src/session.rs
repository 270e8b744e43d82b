//! The cooperative main loop: reacts to commands from the peer, and forwards each completed scan
//! to the telemetry reporter.

use crate::error::{Error, Result};
use crate::hal::{Delay, Platform};
use crate::platform::Core;
use crate::shared::MainContext;
use crate::telemetry::{Command, DatagramTransport, ReportSink, Reporter, SendResult};
use log::{info, trace, warn};
use smoltcp::time::Instant;

pub struct Session<'a, P: Platform, T, D, S, const N: usize> {
    core: &'a Core<P, N>,
    main: MainContext<'a>,
    reporter: Reporter<T, D, S, N>,
}

impl<'a, P, T, D, S, const N: usize> Session<'a, P, T, D, S, N>
where
    P: Platform,
    T: DatagramTransport,
    D: Delay,
    S: ReportSink,
{
    pub fn new(
        core: &'a Core<P, N>,
        main: MainContext<'a>,
        reporter: Reporter<T, D, S, N>,
    ) -> Session<'a, P, T, D, S, N> {
        Session {
            core,
            main,
            reporter,
        }
    }

    pub fn main(&self) -> &MainContext<'a> {
        &self.main
    }

    pub fn reporter(&self) -> &Reporter<T, D, S, N> {
        &self.reporter
    }

    pub fn reporter_mut(&mut self) -> &mut Reporter<T, D, S, N> {
        &mut self.reporter
    }

    /// Performs one iteration of the main loop. Must be called continuously.
    ///
    /// Returns [Error::SendRetryExhausted] from the iteration in which the telemetry session was
    /// terminated. The acquisition itself is unaffected by that, and polling may continue.
    pub fn poll(&mut self, now: Instant) -> Result<()> {
        let (core, main) = (self.core, &self.main);
        let mut finish = false;
        self.reporter
            .transport_mut()
            .poll_inbound(|payload| match Command::parse(payload) {
                Ok(Command::Start) => {
                    info!("Starting acquisition");
                    core.sequencer().start_stop(main, true);
                }
                Ok(Command::Finish) => {
                    info!("Finishing acquisition");
                    core.sequencer().start_stop(main, false);
                    finish = true;
                }
                Err(err) => warn!("Ignoring datagram: {err}"),
            });
        if finish {
            self.reporter.request_finish();
        }

        let mut result = Ok(());
        if self.main.telemetry_requested() {
            result = self.forward_scan(now);
        }

        if let Some(closed) = self.reporter.tick(now) {
            info!("Telemetry session ended ({closed:?})");
        }
        result
    }

    /// Sends the current send buffer. The telemetry request is left raised while the send
    /// direction of a transfer is still in flight, so that the next iteration tries again.
    fn forward_scan(&mut self, now: Instant) -> Result<()> {
        if !self.reporter.is_open() {
            // Nobody to send to anymore.
            self.main.acknowledge_telemetry();
            return Ok(());
        }
        let snapshot = self
            .core
            .dma()
            .snapshot_send_buffer(&self.main, self.reporter.payload_mut());
        if snapshot.is_err() {
            trace!("Send buffer still owned by the DMA engine, deferring telemetry");
            return Ok(());
        }
        let sent = self.reporter.send_one(false, now);
        self.main.acknowledge_telemetry();
        if sent == SendResult::RetryExhausted {
            return Err(Error::SendRetryExhausted);
        }
        Ok(())
    }
}
