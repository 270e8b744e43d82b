//! Ties the interrupt-driven components together behind a single set of interrupt entry points.
//!
//! A board typically places a [Core] in a static, attaches its peripherals during start-up, and
//! routes each interrupt to [Core::on_interrupt] with the matching [InterruptSource]:
//!
//! ```ignore
//! static CORE: Core<Board, DEFAULT_BUFFER_SIZE> = Core::new();
//!
//! fn start() {
//!     let main = CORE.attach(resources, &Config::default()).unwrap();
//!     // Enable the interrupts, in InterruptSource::BY_PRIORITY order...
//! }
//!
//! #[interrupt]
//! fn GPIO_EOC() {
//!     let _ = CORE.on_interrupt(InterruptSource::WordReady);
//! }
//! ```

use crate::acquisition::{AcquisitionPins, AcquisitionStats, Sequencer};
use crate::config::Config;
use crate::dma::{DmaStats, TransferManager};
use crate::error::{Error, Result};
use crate::hal::{Direction, Platform};
use crate::shared::{MainContext, SharedState};
use crate::watchdog::Watchdog;
use log::{debug, info};

/// The interrupts the core handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    /// The data-ready edge: the next bit can be read from the data line.
    BitReady,
    /// The word-ready edge: the word in progress is complete.
    WordReady,
    /// The scan-end edge.
    ScanEnd,
    /// Completion or error of the receive DMA channel.
    DmaReceive,
    /// Completion or error of the send DMA channel.
    DmaSend,
    /// The watchdog's periodic timer.
    Timer,
}

impl InterruptSource {
    /// Every source, highest priority first. The edge interrupts come first since they must
    /// keep up with the acquisition hardware. The watchdog comes last since its window is orders
    /// of magnitude larger than any other handler's runtime.
    pub const BY_PRIORITY: [InterruptSource; 6] = [
        InterruptSource::BitReady,
        InterruptSource::WordReady,
        InterruptSource::ScanEnd,
        InterruptSource::DmaReceive,
        InterruptSource::DmaSend,
        InterruptSource::Timer,
    ];

    /// The priority level to configure for this source in the interrupt controller, where 0 is
    /// the most urgent.
    pub const fn priority(self) -> u8 {
        match self {
            InterruptSource::BitReady => 0,
            InterruptSource::WordReady => 1,
            InterruptSource::ScanEnd => 2,
            InterruptSource::DmaReceive => 3,
            InterruptSource::DmaSend => 4,
            InterruptSource::Timer => 5,
        }
    }
}

/// The peripherals handed to [Core::attach].
pub struct CoreResources<P: Platform> {
    pub dma: P::Dma,
    /// Used to bound the wait for a DMA engine reset.
    pub clock: P::Clock,
    pub pins: AcquisitionPins<P::Gpio>,
    /// Must be configured to fire every [Config::tick_period].
    pub timer: P::Timer,
    pub rx_recovery: P::RxRecovery,
}

/// The interrupt-driven half of the system, for transfer buffers of `N` bytes.
pub struct Core<P: Platform, const N: usize> {
    shared: SharedState,
    dma: TransferManager<P::Dma, P::Clock, N>,
    sequencer: Sequencer<P::Gpio, N>,
    watchdog: Watchdog<P::Timer, P::RxRecovery>,
}

impl<P: Platform, const N: usize> Core<P, N> {
    pub const fn new() -> Core<P, N> {
        Core {
            shared: SharedState::new(),
            dma: TransferManager::new(),
            sequencer: Sequencer::new(),
            watchdog: Watchdog::new(),
        }
    }

    /// Validates `config` and hands the peripherals to the components. Returns the main loop's
    /// handle to the shared state.
    ///
    /// Interrupts must only be enabled once this returned successfully. Returns
    /// [Error::AlreadyAttached] if called more than once.
    pub fn attach(&self, resources: CoreResources<P>, config: &Config) -> Result<MainContext<'_>> {
        config.validate()?;
        self.dma.attach(resources.dma, resources.clock, config)?;
        self.sequencer.attach(resources.pins, config)?;
        self.watchdog
            .attach(resources.timer, resources.rx_recovery, config)?;
        let main = self.shared.main_context().ok_or(Error::AlreadyAttached)?;
        info!(
            "Core attached: {N} byte buffers, {}-bit words, watchdog window {}",
            config.word_width,
            config.watchdog_window()
        );
        Ok(main)
    }

    /// Entry point for every interrupt handler.
    ///
    /// Errors are already recovered from (or deliberately ignored) by the time they are returned,
    /// so handlers may discard them.
    pub fn on_interrupt(&self, source: InterruptSource) -> Result<()> {
        let ctx = self.shared.irq_context();
        let result = match source {
            InterruptSource::BitReady => self.sequencer.on_bit_ready(),
            InterruptSource::WordReady => self.sequencer.on_word_ready(ctx, &self.dma),
            InterruptSource::ScanEnd => self.sequencer.on_scan_end(ctx, &self.dma),
            InterruptSource::DmaReceive => {
                self.dma.on_interrupt(ctx, Direction::Receive).map(|_| ())
            }
            InterruptSource::DmaSend => self.dma.on_interrupt(ctx, Direction::Send).map(|_| ()),
            InterruptSource::Timer => {
                self.watchdog.on_timer_interrupt();
                Ok(())
            }
        };
        if let Err(err) = result {
            debug!("{source:?} interrupt: {err}");
        }
        result
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    pub fn dma(&self) -> &TransferManager<P::Dma, P::Clock, N> {
        &self.dma
    }

    pub fn sequencer(&self) -> &Sequencer<P::Gpio, N> {
        &self.sequencer
    }

    pub fn watchdog(&self) -> &Watchdog<P::Timer, P::RxRecovery> {
        &self.watchdog
    }

    /// Returns stats about the activity of all components so far. Panics if not attached.
    pub fn stats(&self) -> CoreStats {
        CoreStats {
            dma: self.dma.stats(),
            acquisition: self.sequencer.stats(),
            watchdog_resets: self.watchdog.resets(),
        }
    }
}

impl<P: Platform, const N: usize> Default for Core<P, N> {
    fn default() -> Core<P, N> {
        Core::new()
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreStats {
    pub dma: DmaStats,
    pub acquisition: AcquisitionStats,
    pub watchdog_resets: u32,
}
