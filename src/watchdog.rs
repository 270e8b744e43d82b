//! Works around a hardware erratum in the Ethernet MAC where the receive data path can become
//! unresponsive under heavy receive traffic.
//!
//! A periodic timer drives [Watchdog::on_timer_interrupt]. Every `threshold` ticks the network
//! driver's receive path reset is invoked, so that the path can never stay stuck for longer than
//! `threshold * tick_period`. The reset is unconditional: no attempt is made to inspect the receive
//! statistics first.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::hal::{PeriodicTimer, RxPathRecovery};
use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};
use critical_section::Mutex;
use log::debug;

pub struct Watchdog<T: 'static, R: 'static> {
    /// Only written by the timer interrupt handler.
    ticks: AtomicU32,
    state: Mutex<RefCell<WatchdogState<T, R>>>,
}

struct AttachedResources<T, R> {
    timer: T,
    recovery: R,
    threshold: u32,
    resets: u32,
}

enum WatchdogState<T, R> {
    Detached,
    Attached(AttachedResources<T, R>),
}

impl<T: PeriodicTimer, R: RxPathRecovery> Watchdog<T, R> {
    pub const fn new() -> Watchdog<T, R> {
        Watchdog {
            ticks: AtomicU32::new(0),
            state: Mutex::new(RefCell::new(WatchdogState::Detached)),
        }
    }

    /// Hands the timer and the recovery action to this watchdog. The timer must already be
    /// configured to fire every [Config::tick_period], and its interrupt must be routed to
    /// [Watchdog::on_timer_interrupt] by the caller.
    ///
    /// Returns [Error::AlreadyAttached] if called more than once.
    pub fn attach(&self, timer: T, recovery: R, config: &Config) -> Result<()> {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            match &*state {
                WatchdogState::Attached(_) => Err(Error::AlreadyAttached),
                WatchdogState::Detached => {
                    self.ticks.store(0, Ordering::Relaxed);
                    *state = WatchdogState::Attached(AttachedResources {
                        timer,
                        recovery,
                        threshold: config.watchdog_threshold,
                        resets: 0,
                    });
                    Ok(())
                }
            }
        })
    }

    /// Callback to be invoked from the timer interrupt handler when the timer interrupt fires.
    /// Returns whether the receive path reset was triggered.
    pub fn on_timer_interrupt(&self) -> bool {
        critical_section::with(|cs| match &mut *self.state.borrow_ref_mut(cs) {
            WatchdogState::Attached(resources) => {
                let ticks = self.ticks.load(Ordering::Relaxed) + 1;
                let fired = ticks >= resources.threshold;
                if fired {
                    resources.recovery.reset_rx_on_no_data();
                    resources.resets += 1;
                    self.ticks.store(0, Ordering::Relaxed);
                    debug!("Receive path reset #{}", resources.resets);
                } else {
                    self.ticks.store(ticks, Ordering::Relaxed);
                }
                resources.timer.clear_interrupt();
                fired
            }
            WatchdogState::Detached => {
                panic!("Trying to use the watchdog timer but currently detached!")
            }
        })
    }

    /// The number of ticks since the last reset.
    pub fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// The number of times the receive path reset was triggered.
    pub fn resets(&self) -> u32 {
        critical_section::with(|cs| match &*self.state.borrow_ref(cs) {
            WatchdogState::Attached(resources) => resources.resets,
            WatchdogState::Detached => 0,
        })
    }
}

impl<T: PeriodicTimer, R: RxPathRecovery> Default for Watchdog<T, R> {
    fn default() -> Watchdog<T, R> {
        Watchdog::new()
    }
}
