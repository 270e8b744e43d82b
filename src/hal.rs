//! Traits describing the peripheral drivers the coordination core is built on top of.
//!
//! Looking up and configuring these peripherals is left to the board-specific code. The core only
//! relies on the small set of operations below, which keeps it testable on the host.

use smoltcp::time::Instant;

/// The direction of a DMA transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Memory to peripheral (the MM2S channel).
    Send,
    /// Peripheral to memory (the S2MM channel).
    Receive,
}

impl Direction {
    pub const fn opposite(self) -> Direction {
        match self {
            Direction::Send => Direction::Receive,
            Direction::Receive => Direction::Send,
        }
    }
}

/// A set of interrupt causes asserted by one DMA channel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DmaIrq(u32);

impl DmaIrq {
    pub const NONE: DmaIrq = DmaIrq(0);
    /// The transfer completed.
    pub const COMPLETE: DmaIrq = DmaIrq(1 << 12);
    /// The interrupt delay timer expired.
    pub const DELAY: DmaIrq = DmaIrq(1 << 13);
    /// The engine hit a bus, slave or decode error and halted.
    pub const ERROR: DmaIrq = DmaIrq(1 << 14);
    /// Every cause the core knows how to handle.
    pub const ALL: DmaIrq = DmaIrq(0x7000);

    pub const fn from_bits(bits: u32) -> DmaIrq {
        DmaIrq(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns whether any of the causes in `other` are asserted in `self`.
    pub const fn intersects(self, other: DmaIrq) -> bool {
        self.0 & other.0 != 0
    }
}

impl core::ops::BitOr for DmaIrq {
    type Output = DmaIrq;

    fn bitor(self, rhs: DmaIrq) -> DmaIrq {
        DmaIrq(self.0 | rhs.0)
    }
}

/// A bus-mastering DMA engine with one channel per [Direction], operated in simple (non
/// scatter-gather) mode.
pub trait DmaEngine {
    type Error: core::fmt::Debug;

    /// Queues a transfer of `len` bytes to or from the memory at `buffer`.
    ///
    /// # Safety
    ///
    /// The memory at `buffer` must stay valid, and must not be accessed by the CPU, until the
    /// engine reports completion or an error for `direction`, or until the engine is reset.
    unsafe fn issue_transfer(
        &mut self,
        direction: Direction,
        buffer: *mut u8,
        len: usize,
    ) -> Result<(), Self::Error>;

    /// Returns the interrupt causes currently asserted for the given channel.
    fn irq_status(&mut self, direction: Direction) -> DmaIrq;

    /// Acknowledges the given interrupt causes for the given channel.
    fn ack_irq(&mut self, direction: Direction, irq: DmaIrq);

    /// Starts a soft reset of both channels.
    fn reset(&mut self);

    /// Returns whether a previously started reset has finished.
    fn reset_is_done(&mut self) -> bool;

    /// Writes back any cached lines covering the given memory, so that the engine observes the
    /// latest CPU writes.
    fn flush_dcache(&mut self, data: *const u8, len: usize);

    /// Discards any cached lines covering the given memory, so that subsequent CPU reads observe
    /// what the engine wrote.
    fn invalidate_dcache(&mut self, data: *const u8, len: usize);
}

/// A mask selecting one or more channels of a [GpioBank].
pub type ChannelMask = u32;
/// The first channel of a GPIO bank.
pub const CHANNEL_1: ChannelMask = 1 << 0;
/// The second channel of a GPIO bank.
pub const CHANNEL_2: ChannelMask = 1 << 1;

/// A bank of discrete GPIO lines with up to two channels, each of which can raise an edge
/// interrupt.
pub trait GpioBank {
    /// Reads the current level of the lines on `channel` (1-based).
    fn read_discrete(&mut self, channel: u8) -> u32;
    /// Drives the lines on `channel` (1-based) to `value`.
    fn write_discrete(&mut self, channel: u8, value: u32);
    /// Returns the channels with a pending interrupt.
    fn interrupt_status(&mut self) -> ChannelMask;
    /// Clears the pending interrupt on the given channels.
    fn clear_interrupt(&mut self, mask: ChannelMask);
}

/// An auto-reloading timer that raises an interrupt once per period.
pub trait PeriodicTimer {
    fn clear_interrupt(&mut self);
}

/// The network driver's mitigation for a receive data path that stopped responding.
pub trait RxPathRecovery {
    /// Performs a software reset of the receive data path if it hasn't seen any data recently.
    fn reset_rx_on_no_data(&mut self);
}

/// A monotonic time source. Must be safe to read from interrupt handlers.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// A blocking delay provider.
pub trait Delay {
    fn delay_us(&mut self, us: u32);
}

/// Groups the collaborator types of a single board, so that the types built on top of them only
/// need a single type parameter.
pub trait Platform: 'static {
    type Dma: DmaEngine + 'static;
    type Clock: Clock + 'static;
    type Gpio: GpioBank + 'static;
    type Timer: PeriodicTimer + 'static;
    type RxRecovery: RxPathRecovery + 'static;
}
