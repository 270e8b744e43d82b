//! The flags and counters through which interrupt handlers and the main loop communicate.
//!
//! Every value has a single writer context. Interrupt handlers get an [IrqContext], through which
//! they arm and resolve transfers, advance the pixel index and request telemetry. The main loop
//! gets a single [MainContext], through which it observes those values, acknowledges telemetry
//! requests once it has consumed the data, and records the run state. Keeping the two behind
//! different handle types means the ownership discipline is enforced by the type system rather
//! than by convention.
//!
//! Values are stored in atomics that are only ever loaded and stored. Sequences that must be
//! atomic as a whole run inside a critical section instead, so that targets without
//! compare-and-swap instructions are supported.

use crate::error::{Error, Result};
use crate::hal::Direction;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use critical_section::CriticalSection;

/// The state of one direction of the most recently armed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The transfer was issued but the engine hasn't reported back yet.
    Pending,
    /// The engine reported completion.
    Done,
    /// The engine reported an error, or the transfer could not be issued.
    Error,
}

const CLEARED: u8 = 0;
const PENDING: u8 = 1;
const DONE: u8 = 2;
const ERROR: u8 = 3;

/// A single-direction transfer state cell. A cleared cell means no transfer has been armed since
/// the last clear.
struct TransferCell(AtomicU8);

impl TransferCell {
    const fn new() -> TransferCell {
        TransferCell(AtomicU8::new(CLEARED))
    }

    fn load(&self) -> Option<TransferOutcome> {
        match self.0.load(Ordering::Acquire) {
            PENDING => Some(TransferOutcome::Pending),
            DONE => Some(TransferOutcome::Done),
            ERROR => Some(TransferOutcome::Error),
            _ => None,
        }
    }

    fn store(&self, outcome: Option<TransferOutcome>) {
        let raw = match outcome {
            None => CLEARED,
            Some(TransferOutcome::Pending) => PENDING,
            Some(TransferOutcome::Done) => DONE,
            Some(TransferOutcome::Error) => ERROR,
        };
        self.0.store(raw, Ordering::Release);
    }
}

/// The state shared between interrupt handlers and the main loop. Usually lives inside a static
/// [crate::platform::Core].
pub struct SharedState {
    send: TransferCell,
    receive: TransferCell,
    pixel_index: AtomicUsize,
    telemetry_requested: AtomicBool,
    run: AtomicBool,
    main_context_taken: AtomicBool,
}

impl SharedState {
    pub const fn new() -> SharedState {
        SharedState {
            send: TransferCell::new(),
            receive: TransferCell::new(),
            pixel_index: AtomicUsize::new(0),
            telemetry_requested: AtomicBool::new(false),
            run: AtomicBool::new(false),
            main_context_taken: AtomicBool::new(false),
        }
    }

    /// Hands out the handle for interrupt handlers. Only the interrupt entry points in this crate
    /// may obtain one.
    pub(crate) fn irq_context(&self) -> IrqContext<'_> {
        IrqContext { shared: self }
    }

    /// Hands out the main loop's handle. Returns `None` if it was handed out before.
    pub fn main_context(&self) -> Option<MainContext<'_>> {
        critical_section::with(|_| {
            if self.main_context_taken.load(Ordering::Relaxed) {
                return None;
            }
            self.main_context_taken.store(true, Ordering::Relaxed);
            Some(MainContext { shared: self })
        })
    }

    fn cell(&self, direction: Direction) -> &TransferCell {
        match direction {
            Direction::Send => &self.send,
            Direction::Receive => &self.receive,
        }
    }

    fn transfer_outcome(&self, direction: Direction) -> Option<TransferOutcome> {
        self.cell(direction).load()
    }
}

impl Default for SharedState {
    fn default() -> SharedState {
        SharedState::new()
    }
}

/// The interrupt-side handle to the [SharedState].
#[derive(Clone, Copy)]
pub struct IrqContext<'a> {
    shared: &'a SharedState,
}

impl<'a> IrqContext<'a> {
    pub fn transfer_outcome(&self, direction: Direction) -> Option<TransferOutcome> {
        self.shared.transfer_outcome(direction)
    }

    /// Clears both directions and marks them pending, unless either direction is still pending.
    ///
    /// Requiring a [CriticalSection] ensures the check and the update can't be interleaved with
    /// another interrupt handler.
    pub(crate) fn arm_transfers(&self, _cs: CriticalSection<'_>) -> Result<()> {
        if self.transfer_outcome(Direction::Send) == Some(TransferOutcome::Pending)
            || self.transfer_outcome(Direction::Receive) == Some(TransferOutcome::Pending)
        {
            return Err(Error::TransferBusy);
        }
        self.shared.send.store(Some(TransferOutcome::Pending));
        self.shared.receive.store(Some(TransferOutcome::Pending));
        Ok(())
    }

    /// Reverts a direction that was armed but never issued.
    pub(crate) fn disarm(&self, direction: Direction) {
        self.shared.cell(direction).store(None);
    }

    /// Moves a pending direction to its terminal outcome. Returns `false`, leaving the cell
    /// untouched, if the direction wasn't pending.
    pub(crate) fn resolve_transfer(&self, direction: Direction, outcome: TransferOutcome) -> bool {
        let cell = self.shared.cell(direction);
        if cell.load() != Some(TransferOutcome::Pending) {
            return false;
        }
        cell.store(Some(outcome));
        true
    }

    pub fn pixel_index(&self) -> usize {
        self.shared.pixel_index.load(Ordering::Acquire)
    }

    pub(crate) fn set_pixel_index(&self, index: usize) {
        self.shared.pixel_index.store(index, Ordering::Release);
    }

    /// Asks the main loop to send the current send buffer.
    pub(crate) fn request_telemetry(&self) {
        self.shared
            .telemetry_requested
            .store(true, Ordering::Release);
    }

    pub fn run_state(&self) -> bool {
        self.shared.run.load(Ordering::Acquire)
    }
}

/// The main-loop handle to the [SharedState]. There is only ever one.
pub struct MainContext<'a> {
    shared: &'a SharedState,
}

impl<'a> MainContext<'a> {
    pub fn transfer_outcome(&self, direction: Direction) -> Option<TransferOutcome> {
        self.shared.transfer_outcome(direction)
    }

    pub fn pixel_index(&self) -> usize {
        self.shared.pixel_index.load(Ordering::Acquire)
    }

    pub fn telemetry_requested(&self) -> bool {
        self.shared.telemetry_requested.load(Ordering::Acquire)
    }

    /// Clears the telemetry request. Must only be called after the data the request refers to
    /// has been consumed.
    pub fn acknowledge_telemetry(&self) {
        self.shared
            .telemetry_requested
            .store(false, Ordering::Release);
    }

    pub fn run_state(&self) -> bool {
        self.shared.run.load(Ordering::Acquire)
    }

    pub(crate) fn set_run_state(&self, run: bool) {
        self.shared.run.store(run, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_context_is_handed_out_once() {
        let shared = SharedState::new();
        assert!(shared.main_context().is_some());
        assert!(shared.main_context().is_none());
    }

    #[test]
    fn arming_fails_while_a_direction_is_pending() {
        let shared = SharedState::new();
        let irq = shared.irq_context();
        critical_section::with(|cs| {
            assert_eq!(irq.arm_transfers(cs), Ok(()));
            assert_eq!(irq.arm_transfers(cs), Err(Error::TransferBusy));
            // Resolving only one direction isn't enough.
            assert!(irq.resolve_transfer(Direction::Receive, TransferOutcome::Done));
            assert_eq!(irq.arm_transfers(cs), Err(Error::TransferBusy));
            assert!(irq.resolve_transfer(Direction::Send, TransferOutcome::Error));
            assert_eq!(irq.arm_transfers(cs), Ok(()));
        });
        assert_eq!(
            irq.transfer_outcome(Direction::Send),
            Some(TransferOutcome::Pending)
        );
        assert_eq!(
            irq.transfer_outcome(Direction::Receive),
            Some(TransferOutcome::Pending)
        );
    }

    #[test]
    fn outcomes_are_terminal_until_rearmed() {
        let shared = SharedState::new();
        let irq = shared.irq_context();
        critical_section::with(|cs| irq.arm_transfers(cs)).unwrap();
        assert!(irq.resolve_transfer(Direction::Send, TransferOutcome::Done));
        // A late error doesn't overwrite the completion.
        assert!(!irq.resolve_transfer(Direction::Send, TransferOutcome::Error));
        assert_eq!(
            irq.transfer_outcome(Direction::Send),
            Some(TransferOutcome::Done)
        );
        // Nothing to resolve for a cleared cell either.
        irq.disarm(Direction::Receive);
        assert!(!irq.resolve_transfer(Direction::Receive, TransferOutcome::Done));
        assert_eq!(irq.transfer_outcome(Direction::Receive), None);
    }

    #[test]
    fn telemetry_request_round_trip() {
        let shared = SharedState::new();
        let irq = shared.irq_context();
        let main = shared.main_context().unwrap();
        assert!(!main.telemetry_requested());
        irq.request_telemetry();
        assert!(main.telemetry_requested());
        main.acknowledge_telemetry();
        assert!(!main.telemetry_requested());
    }
}
