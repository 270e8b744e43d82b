//! Drives the acquisition of a scan: three GPIO edge interrupts (data-ready, word-ready and
//! scan-end) feed the [sampler::SampleAccumulator], store completed words in the receive buffer,
//! and hand each completed scan to the DMA engine.

pub mod sampler;

use crate::config::{pixel_capacity, Config, WORD_BYTES};
use crate::dma::TransferManager;
use crate::error::{Error, Result};
use crate::hal::{Clock, DmaEngine, GpioBank, CHANNEL_1};
use crate::shared::{IrqContext, MainContext};
use byteorder::{ByteOrder, LittleEndian};
use core::cell::RefCell;
use critical_section::Mutex;
use log::{debug, log_enabled, trace, warn};
use sampler::{Push, SampleAccumulator};

/// The channel (1-based) on which every acquisition GPIO bank carries its signal.
const SIGNAL_CHANNEL: u8 = 1;

/// The GPIO banks used by the [Sequencer].
pub struct AcquisitionPins<G> {
    /// Raises an interrupt at the end of each scan.
    pub scan_end: G,
    /// Raises an interrupt when the word in progress is complete.
    pub word_ready: G,
    /// Raises an interrupt when the next bit can be read from `data_line`.
    pub bit_ready: G,
    /// The bit-serial data input.
    pub data_line: G,
    /// The output that starts and stops the acquisition hardware.
    pub start_line: G,
}

/// The edge-driven acquisition state machine.
///
/// Like the [TransferManager] it is designed to be placed in a static and shared between the
/// interrupt handlers and the main loop.
pub struct Sequencer<G: 'static, const N: usize> {
    state: Mutex<RefCell<SequencerState<G, N>>>,
}

struct AttachedResources<G, const N: usize> {
    pins: AcquisitionPins<G>,
    accumulator: SampleAccumulator,
    deferred: DeferredWords<N>,
    stats: AcquisitionStats,
}

enum SequencerState<G, const N: usize> {
    Detached,
    Attached(AttachedResources<G, N>),
}

/// Words that arrived while the receive buffer was owned by the DMA engine, kept at their
/// position in the scan until the buffer can be written again.
///
/// Transfers only start at scan end, so the held words always form a single run of consecutive
/// pixel indices.
struct DeferredWords<const N: usize> {
    data: [u8; N],
    start: usize,
    end: usize,
}

impl<const N: usize> DeferredWords<N> {
    fn new() -> DeferredWords<N> {
        DeferredWords {
            data: [0; N],
            start: 0,
            end: 0,
        }
    }

    fn len(&self) -> usize {
        self.end - self.start
    }

    fn push(&mut self, index: usize, word: u16) {
        if self.len() == 0 {
            self.start = index;
        }
        let offset = index * WORD_BYTES;
        LittleEndian::write_u16(&mut self.data[offset..offset + WORD_BYTES], word);
        self.end = index + 1;
    }

    /// Writes the held words into `buffer` at their positions, and forgets them.
    fn flush_into(&mut self, buffer: &mut [u8; N]) -> usize {
        let range = self.start * WORD_BYTES..self.end * WORD_BYTES;
        buffer[range.clone()].copy_from_slice(&self.data[range]);
        self.discard()
    }

    fn discard(&mut self) -> usize {
        let len = self.len();
        self.start = 0;
        self.end = 0;
        len
    }
}

impl<G: GpioBank, const N: usize> Sequencer<G, N> {
    /// The number of words a single scan can hold.
    pub const PIXEL_CAPACITY: usize = pixel_capacity(N);

    pub const fn new() -> Sequencer<G, N> {
        Sequencer {
            state: Mutex::new(RefCell::new(SequencerState::Detached)),
        }
    }

    /// Hands the GPIO banks to this sequencer. The banks' interrupts must be routed to the
    /// `on_*` methods by the caller.
    ///
    /// Returns [Error::AlreadyAttached] if called more than once.
    pub fn attach(&self, pins: AcquisitionPins<G>, config: &Config) -> Result<()> {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            match &*state {
                SequencerState::Attached(_) => Err(Error::AlreadyAttached),
                SequencerState::Detached => {
                    *state = SequencerState::Attached(AttachedResources {
                        pins,
                        accumulator: SampleAccumulator::new(config.word_width),
                        deferred: DeferredWords::new(),
                        stats: AcquisitionStats::default(),
                    });
                    Ok(())
                }
            }
        })
    }

    /// Returns stats about this instance's activity so far.
    pub fn stats(&self) -> AcquisitionStats {
        self.use_attached_resources(|resources| resources.stats)
    }

    /// Obtains exclusive access to the attached resources and invokes the given callback with
    /// them.
    ///
    /// Panics if the sequencer was never attached.
    fn use_attached_resources<F, T>(&self, callback: F) -> T
    where
        F: FnOnce(&mut AttachedResources<G, N>) -> T,
    {
        critical_section::with(|cs| match &mut *self.state.borrow_ref_mut(cs) {
            SequencerState::Attached(resources) => callback(resources),
            SequencerState::Detached => {
                panic!("Trying to use the acquisition pins but currently detached!")
            }
        })
    }

    /// Callback to be invoked from the data-ready edge interrupt handler. Samples the data line
    /// into the word in progress.
    pub fn on_bit_ready(&self) -> Result<()> {
        self.use_attached_resources(|resources| {
            let result = acknowledge(&mut resources.pins.bit_ready, &mut resources.stats);
            if result.is_ok() {
                let bit = resources.pins.data_line.read_discrete(SIGNAL_CHANNEL) & 1 != 0;
                if let Push::Overflowed { discarded } = resources.accumulator.push_bit(bit) {
                    resources.stats.accumulator_overflows += 1;
                    warn!("Word overflowed before it was finalized, discarding {discarded:#06x}");
                }
            }
            result
        })
    }

    /// Callback to be invoked from the word-ready edge interrupt handler. Stores the word in
    /// progress at the current pixel index of the receive buffer and advances the index.
    ///
    /// Once the buffer is full further words are dropped and [Error::BufferOverrun] is returned;
    /// the index never moves past the buffer's capacity. If the receive buffer is still owned by
    /// an in-flight transfer the word is held back and written at its position as soon as the
    /// buffer is released, at the latest at scan end.
    pub fn on_word_ready<E: DmaEngine, C: Clock>(
        &self,
        ctx: IrqContext<'_>,
        dma: &TransferManager<E, C, N>,
    ) -> Result<()> {
        self.use_attached_resources(|resources| {
            acknowledge(&mut resources.pins.word_ready, &mut resources.stats)?;

            let word = resources.accumulator.take_word();
            let index = ctx.pixel_index();
            if index >= Self::PIXEL_CAPACITY {
                resources.stats.overruns += 1;
                warn!("Receive buffer full, dropping word {word:#06x}");
                return Err(Error::BufferOverrun);
            }

            let offset = index * WORD_BYTES;
            let deferred = &mut resources.deferred;
            let stored = dma.with_receive_buffer(ctx, |buffer| {
                deferred.flush_into(buffer);
                LittleEndian::write_u16(&mut buffer[offset..offset + WORD_BYTES], word);
            });
            if stored.is_err() {
                deferred.push(index, word);
                resources.stats.deferred_words += 1;
                trace!("Receive buffer is owned by the DMA engine, holding back word {index}");
            }
            ctx.set_pixel_index(index + 1);
            resources.stats.words_completed += 1;
            trace!("Word {index}: {word:#06x}");
            Ok(())
        })
    }

    /// Callback to be invoked from the scan-end edge interrupt handler.
    ///
    /// Resets the pixel index, starts a DMA transfer that carries the completed scan (copied into
    /// the send buffer, zero padded) and requests telemetry.
    ///
    /// If the previous transfer is still in flight the scan is dropped and no telemetry is
    /// requested, since the send buffer still holds the previous scan. A transfer that fails to
    /// start for any other reason is logged, but its send buffer was staged with this scan so
    /// telemetry is requested regardless.
    pub fn on_scan_end<E: DmaEngine, C: Clock>(
        &self,
        ctx: IrqContext<'_>,
        dma: &TransferManager<E, C, N>,
    ) -> Result<()> {
        self.use_attached_resources(|resources| {
            acknowledge(&mut resources.pins.scan_end, &mut resources.stats)?;

            let words = ctx.pixel_index();
            ctx.set_pixel_index(0);
            resources.stats.scans_completed += 1;
            debug!("Scan completed with {words} words");

            let deferred = &mut resources.deferred;
            if dma
                .with_receive_buffer(ctx, |buffer| deferred.flush_into(buffer))
                .is_err()
            {
                let lost = deferred.discard();
                resources.stats.dropped_words += lost as u32;
                warn!("Receive buffer never released during the scan, dropping {lost} words");
            }

            let started = dma.begin_transfer(ctx, |send, receive| {
                let len = words * WORD_BYTES;
                send[..len].copy_from_slice(&receive[..len]);
                send[len..].fill(0);
                if log_enabled!(log::Level::Debug) {
                    debug!("Scan CRC32: {:08X}", crc32fast::hash(&send[..len]));
                }
            });
            match started {
                Ok(()) => ctx.request_telemetry(),
                Err(Error::TransferBusy) => {
                    resources.stats.scans_dropped += 1;
                    warn!("Previous DMA transfer still in flight, dropping scan of {words} words");
                }
                Err(err) => {
                    warn!("Could not start DMA transfer for completed scan: {err}");
                    ctx.request_telemetry();
                }
            }
            Ok(())
        })
    }

    /// Starts or stops the acquisition hardware by driving the start line.
    pub fn start_stop(&self, main: &MainContext<'_>, run: bool) {
        self.use_attached_resources(|resources| {
            resources
                .pins
                .start_line
                .write_discrete(SIGNAL_CHANNEL, run as u32);
        });
        main.set_run_state(run);
    }
}

impl<G: GpioBank, const N: usize> Default for Sequencer<G, N> {
    fn default() -> Sequencer<G, N> {
        Sequencer::new()
    }
}

/// Clears the interrupt on the bank's signal channel, and checks that it was actually pending.
/// Any other pending channel is left alone.
fn acknowledge<G: GpioBank>(bank: &mut G, stats: &mut AcquisitionStats) -> Result<()> {
    let status = bank.interrupt_status();
    bank.clear_interrupt(CHANNEL_1);
    if status & CHANNEL_1 == 0 {
        stats.unrecognized_edges += 1;
        warn!("Unknown GPIO interrupt (status {status:#x})");
        return Err(Error::UnrecognizedInterruptCause);
    }
    Ok(())
}

/// Various acquisition-related stats.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionStats {
    /// The number of words finalized by a word-ready edge, including dropped ones.
    pub words_completed: u32,
    /// The number of scan-end edges handled.
    pub scans_completed: u32,
    /// The number of words that didn't fit in the receive buffer.
    pub overruns: u32,
    /// The number of words held back because the receive buffer was owned by the DMA engine.
    pub deferred_words: u32,
    /// The number of held back words lost because the receive buffer wasn't released before the
    /// end of their scan.
    pub dropped_words: u32,
    /// The number of scans not transferred because the previous transfer was still in flight.
    pub scans_dropped: u32,
    /// The number of words discarded because more bits arrived than the word width allows.
    pub accumulator_overflows: u32,
    /// The number of edge interrupts without the expected channel pending.
    pub unrecognized_edges: u32,
}
