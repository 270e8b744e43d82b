//! Manages the lifecycle of the double-buffered DMA transfers: issuing them, observing their
//! completion or failure from the interrupt handlers, and recovering the engine after an error.
//!
//! Completion is observed asynchronously. [TransferManager::begin_transfer] returns as soon as
//! both directions are queued, since it is called from the scan-end interrupt handler and must
//! not wait for other handlers. The main loop learns about completion through the
//! [crate::shared::MainContext] instead.

use crate::config::{Config, ResetWait};
use crate::error::{Error, Result};
use crate::hal::{Clock, Direction, DmaEngine, DmaIrq};
use crate::shared::{IrqContext, MainContext, TransferOutcome};
use core::cell::RefCell;
use core::sync::atomic::{compiler_fence, Ordering};
use critical_section::Mutex;
use log::{debug, error, trace, warn};

/// The pair of buffers moved by the engine. While a direction is pending its buffer belongs to the
/// engine and the CPU must not touch it.
struct TransferBuffers<const N: usize> {
    send: [u8; N],
    receive: [u8; N],
}

/// What an invocation of [TransferManager::on_interrupt] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaEvent {
    /// The transfer completed. `telemetry_requested` is set if this completion raised a telemetry
    /// request.
    Completed { telemetry_requested: bool },
    /// The transfer failed and the engine was reset. `reset_done` is unset if the engine didn't
    /// report the reset as finished within the configured [ResetWait].
    Failed { reset_done: bool },
    /// Only causes without an associated action (e.g. the delay timer) were asserted.
    NoAction,
}

/// Owns the transfer buffers and, once attached, the DMA engine.
///
/// This type is [Sync] (given [Send] collaborators), so it can be placed in a static and used from
/// both interrupt handlers and the main loop.
pub struct TransferManager<E: 'static, C: 'static, const N: usize> {
    state: Mutex<RefCell<ManagerState<E, C>>>,
    buffers: Mutex<RefCell<TransferBuffers<N>>>,
}

/// Resources only available once the manager was attached to an engine.
struct AttachedResources<E, C> {
    engine: E,
    clock: C,
    reset_wait: ResetWait,
    telemetry_trigger: Direction,
    stats: DmaStats,
}

enum ManagerState<E, C> {
    Detached,
    Attached(AttachedResources<E, C>),
}

impl<E: DmaEngine, C: Clock, const N: usize> TransferManager<E, C, N> {
    pub const fn new() -> TransferManager<E, C, N> {
        TransferManager {
            state: Mutex::new(RefCell::new(ManagerState::Detached)),
            buffers: Mutex::new(RefCell::new(TransferBuffers {
                send: [0; N],
                receive: [0; N],
            })),
        }
    }

    /// Hands the engine to this manager. The engine's interrupts must be routed to
    /// [TransferManager::on_interrupt] by the caller.
    ///
    /// Returns [Error::AlreadyAttached] if called more than once.
    pub fn attach(&self, engine: E, clock: C, config: &Config) -> Result<()> {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            match &*state {
                ManagerState::Attached(_) => Err(Error::AlreadyAttached),
                ManagerState::Detached => {
                    *state = ManagerState::Attached(AttachedResources {
                        engine,
                        clock,
                        reset_wait: config.reset_wait,
                        telemetry_trigger: config.telemetry_trigger,
                        stats: DmaStats::default(),
                    });
                    Ok(())
                }
            }
        })
    }

    /// Returns stats about this instance's activity so far.
    pub fn stats(&self) -> DmaStats {
        self.use_attached_resources(|_, resources| resources.stats)
    }

    /// Obtains exclusive access to the attached resources and invokes the given callback with
    /// them.
    ///
    /// Panics if the manager was never attached.
    fn use_attached_resources<F, T>(&self, callback: F) -> T
    where
        F: FnOnce(critical_section::CriticalSection<'_>, &mut AttachedResources<E, C>) -> T,
    {
        critical_section::with(|cs| match &mut *self.state.borrow_ref_mut(cs) {
            ManagerState::Attached(resources) => callback(cs, resources),
            ManagerState::Detached => {
                panic!("Trying to use the DMA engine but currently detached!")
            }
        })
    }

    /// Starts a new transfer in both directions.
    ///
    /// Fails with [Error::TransferBusy] if either direction of the previous transfer is still
    /// pending. Otherwise both directions are cleared and `stage` is called to fill the send
    /// buffer (it also gets to read the receive buffer's current contents). The receive direction
    /// is issued first, then the send direction.
    ///
    /// If the receive direction can't be issued, the send direction isn't issued either and
    /// [Error::TransferError] is returned. If only the send direction fails, the receive direction
    /// stays in flight.
    pub fn begin_transfer<F>(&self, ctx: IrqContext<'_>, stage: F) -> Result<()>
    where
        F: FnOnce(&mut [u8; N], &[u8; N]),
    {
        self.use_attached_resources(|cs, resources| {
            if let Err(err) = ctx.arm_transfers(cs) {
                resources.stats.busy_rejections += 1;
                return Err(err);
            }
            let mut buffers = self.buffers.borrow_ref_mut(cs);
            let TransferBuffers { send, receive } = &mut *buffers;
            stage(send, receive);

            // Make sure the engine sees the staged data, and that no stale cache lines get
            // written back over the data the engine is about to receive.
            resources.engine.flush_dcache(send.as_ptr(), N);
            resources.engine.flush_dcache(receive.as_ptr(), N);
            // Prevent preceding writes to the buffers from being moved past the point where the
            // transfer is started.
            compiler_fence(Ordering::Release);

            // Safety: both buffers live as long as `self`, and the CPU only accesses them again
            // once the corresponding direction is no longer pending (see `with_receive_buffer`
            // and `snapshot_send_buffer`).
            let result = unsafe {
                resources
                    .engine
                    .issue_transfer(Direction::Receive, receive.as_mut_ptr(), N)
            };
            if let Err(err) = result {
                warn!("Failed to issue receive transfer: {err:?}");
                ctx.resolve_transfer(Direction::Receive, TransferOutcome::Error);
                ctx.disarm(Direction::Send);
                resources.stats.issue_failures += 1;
                return Err(Error::TransferError(Direction::Receive));
            }
            // Safety: see above.
            let result = unsafe {
                resources
                    .engine
                    .issue_transfer(Direction::Send, send.as_mut_ptr(), N)
            };
            if let Err(err) = result {
                warn!("Failed to issue send transfer: {err:?}");
                ctx.resolve_transfer(Direction::Send, TransferOutcome::Error);
                resources.stats.issue_failures += 1;
                return Err(Error::TransferError(Direction::Send));
            }

            resources.stats.transfers_started += 1;
            trace!("DMA transfer of {N} bytes started");
            Ok(())
        })
    }

    /// Callback to be invoked from the interrupt handler of the given DMA channel.
    ///
    /// Acknowledges exactly the causes that are asserted. On an error the engine is reset, waiting
    /// a bounded amount of time for the reset to finish. Since the reset stops both channels, both
    /// directions of the transfer are marked as failed (unless already resolved).
    /// On completion the direction is marked as done and, if this is the configured
    /// [Config::telemetry_trigger] direction, a telemetry request is raised.
    ///
    /// Returns [Error::UnrecognizedInterruptCause] without touching any state if none of the
    /// known causes are asserted.
    pub fn on_interrupt(&self, ctx: IrqContext<'_>, direction: Direction) -> Result<DmaEvent> {
        self.use_attached_resources(|cs, resources| {
            let irq = resources.engine.irq_status(direction);
            resources.engine.ack_irq(direction, irq);

            if !irq.intersects(DmaIrq::ALL) {
                return Err(Error::UnrecognizedInterruptCause);
            }

            if irq.intersects(DmaIrq::ERROR) {
                ctx.resolve_transfer(direction, TransferOutcome::Error);
                resources.stats.errors += 1;
                resources.engine.reset();
                // The reset ends the transfer in both directions, so the other one won't report
                // back either.
                let other = direction.opposite();
                if ctx.resolve_transfer(other, TransferOutcome::Error) {
                    debug!("DMA {other:?} transfer aborted by the engine reset");
                }
                let reset_done = wait_for_reset(
                    &mut resources.engine,
                    &resources.clock,
                    &resources.reset_wait,
                );
                if reset_done {
                    warn!("DMA {direction:?} transfer failed, engine was reset");
                } else {
                    resources.stats.reset_timeouts += 1;
                    error!("DMA {direction:?} transfer failed, engine did not finish resetting");
                }
                return Ok(DmaEvent::Failed { reset_done });
            }

            if irq.intersects(DmaIrq::COMPLETE) {
                // Prevent subsequent reads of the buffers from being moved ahead of the point
                // where we observed the completion.
                compiler_fence(Ordering::Acquire);
                if direction == Direction::Receive {
                    let buffers = self.buffers.borrow_ref(cs);
                    resources
                        .engine
                        .invalidate_dcache(buffers.receive.as_ptr(), N);
                }
                ctx.resolve_transfer(direction, TransferOutcome::Done);
                match direction {
                    Direction::Send => resources.stats.sends_completed += 1,
                    Direction::Receive => resources.stats.receives_completed += 1,
                }
                let telemetry_requested = direction == resources.telemetry_trigger;
                if telemetry_requested {
                    ctx.request_telemetry();
                }
                debug!("DMA {direction:?} transfer completed");
                return Ok(DmaEvent::Completed {
                    telemetry_requested,
                });
            }

            Ok(DmaEvent::NoAction)
        })
    }

    /// Invokes `f` with the receive buffer, unless the receive direction of a transfer is still
    /// pending, in which case [Error::TransferBusy] is returned.
    pub fn with_receive_buffer<F, R>(&self, ctx: IrqContext<'_>, f: F) -> Result<R>
    where
        F: FnOnce(&mut [u8; N]) -> R,
    {
        critical_section::with(|cs| {
            if ctx.transfer_outcome(Direction::Receive) == Some(TransferOutcome::Pending) {
                return Err(Error::TransferBusy);
            }
            Ok(f(&mut self.buffers.borrow_ref_mut(cs).receive))
        })
    }

    /// Copies the send buffer into `out` (which is truncated to `N` bytes if longer), unless the
    /// send direction of a transfer is still pending, in which case [Error::TransferBusy] is
    /// returned.
    pub fn snapshot_send_buffer(&self, main: &MainContext<'_>, out: &mut [u8]) -> Result<()> {
        critical_section::with(|cs| {
            if main.transfer_outcome(Direction::Send) == Some(TransferOutcome::Pending) {
                return Err(Error::TransferBusy);
            }
            let buffers = self.buffers.borrow_ref(cs);
            let len = out.len().min(N);
            out[..len].copy_from_slice(&buffers.send[..len]);
            Ok(())
        })
    }
}

impl<E: DmaEngine, C: Clock, const N: usize> Default for TransferManager<E, C, N> {
    fn default() -> TransferManager<E, C, N> {
        TransferManager::new()
    }
}

/// Polls the engine's reset status until it reports the reset as done, or until either bound of
/// `wait` is hit. Returns whether the reset finished.
fn wait_for_reset<E: DmaEngine, C: Clock>(engine: &mut E, clock: &C, wait: &ResetWait) -> bool {
    let start = clock.now();
    for _ in 0..wait.max_polls {
        if engine.reset_is_done() {
            return true;
        }
        if clock.now() - start >= wait.timeout {
            break;
        }
    }
    false
}

/// Various transfer-related stats.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaStats {
    /// The number of transfers for which both directions were issued.
    pub transfers_started: u32,
    /// The number of send-direction completions.
    pub sends_completed: u32,
    /// The number of receive-direction completions.
    pub receives_completed: u32,
    /// The number of error interrupts, each of which resulted in an engine reset.
    pub errors: u32,
    /// The number of resets that didn't finish within the configured bounds.
    pub reset_timeouts: u32,
    /// The number of transfers the engine refused to queue.
    pub issue_failures: u32,
    /// The number of transfers rejected because a previous one was still pending.
    pub busy_rejections: u32,
}
