//! Host-side fakes of the peripheral collaborators, shared by the unit tests.
//!
//! Every fake is a cheap handle around shared state, so a test can keep a clone to inspect what
//! the code under test did with the instance it was handed.

use crate::hal::{
    ChannelMask, Clock, Delay, Direction, DmaEngine, DmaIrq, GpioBank, PeriodicTimer, Platform,
    RxPathRecovery,
};
use crate::telemetry::{DatagramTransport, Report, ReportSink};
use smoltcp::time::{Duration, Instant};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

#[derive(Default)]
struct DmaState {
    issued: Vec<(Direction, usize)>,
    refuse: Option<Direction>,
    pending: [DmaIrq; 2],
    acked: Vec<(Direction, DmaIrq)>,
    resets: u32,
    /// The number of polls after which a reset reports as done. `None` never finishes.
    reset_polls_needed: Option<u32>,
    reset_polls: u32,
    flushes: u32,
    invalidations: u32,
}

fn index(direction: Direction) -> usize {
    match direction {
        Direction::Send => 0,
        Direction::Receive => 1,
    }
}

#[derive(Clone)]
pub struct FakeDma(Rc<RefCell<DmaState>>);

impl Default for FakeDma {
    fn default() -> FakeDma {
        let dma = FakeDma(Rc::default());
        dma.set_reset_polls_needed(Some(1));
        dma
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeDmaRefused;

impl FakeDma {
    pub fn issued(&self) -> Vec<(Direction, usize)> {
        self.0.borrow().issued.clone()
    }

    /// Makes the engine refuse every transfer in `direction`.
    pub fn refuse(&self, direction: Option<Direction>) {
        self.0.borrow_mut().refuse = direction;
    }

    /// Asserts the given interrupt causes on a channel.
    pub fn raise(&self, direction: Direction, irq: DmaIrq) {
        let mut state = self.0.borrow_mut();
        let pending = &mut state.pending[index(direction)];
        *pending = *pending | irq;
    }

    pub fn pending(&self, direction: Direction) -> DmaIrq {
        self.0.borrow().pending[index(direction)]
    }

    pub fn acked(&self) -> Vec<(Direction, DmaIrq)> {
        self.0.borrow().acked.clone()
    }

    pub fn resets(&self) -> u32 {
        self.0.borrow().resets
    }

    pub fn reset_polls(&self) -> u32 {
        self.0.borrow().reset_polls
    }

    pub fn set_reset_polls_needed(&self, polls: Option<u32>) {
        self.0.borrow_mut().reset_polls_needed = polls;
    }

    pub fn flushes(&self) -> u32 {
        self.0.borrow().flushes
    }

    pub fn invalidations(&self) -> u32 {
        self.0.borrow().invalidations
    }
}

impl DmaEngine for FakeDma {
    type Error = FakeDmaRefused;

    unsafe fn issue_transfer(
        &mut self,
        direction: Direction,
        _buffer: *mut u8,
        len: usize,
    ) -> Result<(), FakeDmaRefused> {
        let mut state = self.0.borrow_mut();
        if state.refuse == Some(direction) {
            return Err(FakeDmaRefused);
        }
        state.issued.push((direction, len));
        Ok(())
    }

    fn irq_status(&mut self, direction: Direction) -> DmaIrq {
        self.pending(direction)
    }

    fn ack_irq(&mut self, direction: Direction, irq: DmaIrq) {
        let mut state = self.0.borrow_mut();
        let pending = &mut state.pending[index(direction)];
        *pending = DmaIrq::from_bits(pending.bits() & !irq.bits());
        state.acked.push((direction, irq));
    }

    fn reset(&mut self) {
        let mut state = self.0.borrow_mut();
        state.resets += 1;
        state.reset_polls = 0;
    }

    fn reset_is_done(&mut self) -> bool {
        let mut state = self.0.borrow_mut();
        state.reset_polls += 1;
        let polls = state.reset_polls;
        state.reset_polls_needed.map_or(false, |needed| polls >= needed)
    }

    fn flush_dcache(&mut self, _data: *const u8, _len: usize) {
        self.0.borrow_mut().flushes += 1;
    }

    fn invalidate_dcache(&mut self, _data: *const u8, _len: usize) {
        self.0.borrow_mut().invalidations += 1;
    }
}

#[derive(Default)]
struct GpioState {
    inputs: [u32; 2],
    outputs: Vec<(u8, u32)>,
    status: ChannelMask,
    cleared: Vec<ChannelMask>,
}

#[derive(Clone, Default)]
pub struct FakeGpio(Rc<RefCell<GpioState>>);

impl FakeGpio {
    pub fn set_input(&self, channel: u8, value: u32) {
        self.0.borrow_mut().inputs[channel as usize - 1] = value;
    }

    /// Marks an edge interrupt as pending on the given channels.
    pub fn raise(&self, mask: ChannelMask) {
        self.0.borrow_mut().status |= mask;
    }

    pub fn status(&self) -> ChannelMask {
        self.0.borrow().status
    }

    pub fn outputs(&self) -> Vec<(u8, u32)> {
        self.0.borrow().outputs.clone()
    }

    pub fn cleared(&self) -> Vec<ChannelMask> {
        self.0.borrow().cleared.clone()
    }
}

impl GpioBank for FakeGpio {
    fn read_discrete(&mut self, channel: u8) -> u32 {
        self.0.borrow().inputs[channel as usize - 1]
    }

    fn write_discrete(&mut self, channel: u8, value: u32) {
        self.0.borrow_mut().outputs.push((channel, value));
    }

    fn interrupt_status(&mut self) -> ChannelMask {
        self.0.borrow().status
    }

    fn clear_interrupt(&mut self, mask: ChannelMask) {
        let mut state = self.0.borrow_mut();
        state.status &= !mask;
        state.cleared.push(mask);
    }
}

#[derive(Clone, Default)]
pub struct FakeTimer(Rc<Cell<u32>>);

impl FakeTimer {
    pub fn interrupts_cleared(&self) -> u32 {
        self.0.get()
    }
}

impl PeriodicTimer for FakeTimer {
    fn clear_interrupt(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

#[derive(Clone, Default)]
pub struct FakeRecovery(Rc<Cell<u32>>);

impl FakeRecovery {
    pub fn resets(&self) -> u32 {
        self.0.get()
    }
}

impl RxPathRecovery for FakeRecovery {
    fn reset_rx_on_no_data(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

/// A clock that only moves when told to, and optionally by a fixed step on every read.
#[derive(Clone)]
pub struct TestClock {
    micros: Rc<Cell<i64>>,
    step: Duration,
}

impl Default for TestClock {
    fn default() -> TestClock {
        TestClock::with_step(Duration::ZERO)
    }
}

impl TestClock {
    pub fn with_step(step: Duration) -> TestClock {
        TestClock {
            micros: Rc::default(),
            step,
        }
    }

    pub fn advance(&self, by: Duration) {
        self.micros.set(self.micros.get() + by.total_micros() as i64);
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        let now = self.micros.get();
        self.micros.set(now + self.step.total_micros() as i64);
        Instant::from_micros(now)
    }
}

#[derive(Clone, Default)]
pub struct RecordingDelay(Rc<RefCell<Vec<u32>>>);

impl RecordingDelay {
    pub fn delays(&self) -> Vec<u32> {
        self.0.borrow().clone()
    }
}

impl Delay for RecordingDelay {
    fn delay_us(&mut self, us: u32) {
        self.0.borrow_mut().push(us);
    }
}

#[derive(Default)]
struct TransportState {
    sent: Vec<Vec<u8>>,
    attempts: u32,
    fail_next: u32,
    closed: bool,
    inbound: VecDeque<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeSendError {
    Rejected,
    Closed,
}

#[derive(Clone, Default)]
pub struct FakeTransport(Rc<RefCell<TransportState>>);

impl FakeTransport {
    /// Makes the next `count` send attempts fail.
    pub fn fail_next(&self, count: u32) {
        self.0.borrow_mut().fail_next = count;
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.0.borrow().sent.clone()
    }

    pub fn attempts(&self) -> u32 {
        self.0.borrow().attempts
    }

    pub fn is_closed(&self) -> bool {
        self.0.borrow().closed
    }

    /// Queues a datagram to be returned by the next [DatagramTransport::poll_inbound].
    pub fn push_inbound(&self, payload: &[u8]) {
        self.0.borrow_mut().inbound.push_back(payload.to_vec());
    }
}

impl DatagramTransport for FakeTransport {
    type Error = FakeSendError;

    fn send_with<F>(&mut self, len: usize, fill: F) -> Result<(), FakeSendError>
    where
        F: FnOnce(&mut [u8]),
    {
        let mut state = self.0.borrow_mut();
        if state.closed {
            return Err(FakeSendError::Closed);
        }
        state.attempts += 1;
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(FakeSendError::Rejected);
        }
        let mut datagram = vec![0; len];
        fill(&mut datagram);
        state.sent.push(datagram);
        Ok(())
    }

    fn poll_inbound<F>(&mut self, mut on_datagram: F)
    where
        F: FnMut(&[u8]),
    {
        let inbound: Vec<_> = self.0.borrow_mut().inbound.drain(..).collect();
        for payload in inbound {
            on_datagram(&payload);
        }
    }

    fn close(&mut self) {
        self.0.borrow_mut().closed = true;
    }
}

#[derive(Clone, Default)]
pub struct RecordingSink(Rc<RefCell<Vec<Report>>>);

impl RecordingSink {
    pub fn reports(&self) -> Vec<Report> {
        self.0.borrow().clone()
    }
}

impl ReportSink for RecordingSink {
    fn report(&mut self, report: &Report) {
        self.0.borrow_mut().push(*report);
    }
}

/// A [Platform] made up entirely of the fakes above.
pub struct TestPlatform;

impl Platform for TestPlatform {
    type Dma = FakeDma;
    type Clock = TestClock;
    type Gpio = FakeGpio;
    type Timer = FakeTimer;
    type RxRecovery = FakeRecovery;
}
