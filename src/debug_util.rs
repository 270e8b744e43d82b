//! Contains debug utilities that may be useful for users of this crate.

use crate::platform::CoreStats;
use log::info;

/// A wrapper struct whose [core::fmt::Display] implementation prints the provided data in rows,
/// with each row containing 16 bytes of data in up to two groups of up to 8 bytes each,
/// with each byte formatted by the provided formatting function.
struct FormatDataInRowsAndGroups<'a, F> {
    data: &'a [u8],
    elem_formatter: F,
}
impl<'a, F, R> core::fmt::Display for FormatDataInRowsAndGroups<'a, F>
where
    F: Fn(&'a u8) -> R,
    R: core::fmt::Display,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (row_idx, row_values) in self.data.chunks(16).enumerate() {
            if row_idx > 0 {
                writeln!(f)?;
            }
            let offset = row_idx * 16;
            write!(f, "{offset:04x}: ")?;

            // Print values in groups of 8, each group separated by two spaces, and each element within
            // a group separated by a space.
            for (group_idx, group_values) in row_values.chunks(8).enumerate() {
                if group_idx > 0 {
                    write!(f, "  ")?;
                }
                for (elem_idx, elem) in group_values.iter().enumerate() {
                    if elem_idx > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", (self.elem_formatter)(elem))?;
                }
            }
        }
        Ok(())
    }
}

/// A byte formatter that prints the value in hexadecimal format.
struct HexFormatter<'a>(&'a u8);
impl<'a> core::fmt::Display for HexFormatter<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

/// Logs the given data buffer (e.g. a datagram or a scan) in a human-readable format, with each
/// byte printed in its hexadecimal representation, similar to how Wireshark prints network
/// packets.
pub fn log_data_hex(log_level: log::Level, data: &[u8]) {
    log::log!(
        log_level,
        "Length: {} bytes\n{}",
        data.len(),
        FormatDataInRowsAndGroups {
            data,
            elem_formatter: HexFormatter
        }
    );
}

/// Prints a quantity scaled to the largest fitting unit prefix, iperf style. The output ends with
/// the prefix (and a space before it), so that a unit can be appended directly, e.g.
/// `"{}Bytes"`.
pub struct FormatQuantity {
    value: u64,
    base: u64,
}

impl FormatQuantity {
    /// Scales by powers of 1024.
    pub fn bytes(value: u64) -> FormatQuantity {
        FormatQuantity { value, base: 1024 }
    }

    /// Scales by powers of 1000.
    pub fn rate(value: u64) -> FormatQuantity {
        FormatQuantity { value, base: 1000 }
    }
}

impl core::fmt::Display for FormatQuantity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        const PREFIXES: [&str; 4] = ["", "K", "M", "G"];
        let base = self.base as f32;
        let mut scaled = self.value as f32;
        let mut prefix = 0;
        while scaled >= base && prefix < PREFIXES.len() - 1 {
            scaled /= base;
            prefix += 1;
        }
        if prefix == 0 {
            write!(f, "{} ", self.value)
        } else {
            write!(f, "{:.2} {}", scaled, PREFIXES[prefix])
        }
    }
}

/// Logs the stats of all interrupt-driven components.
pub fn log_core_stats(stats: &CoreStats) {
    let dma = &stats.dma;
    let acq = &stats.acquisition;
    info!("--- Stats ---");
    info!(
        "DMA:  Started: {:7}, sent:      {:7}, received:  {:7}, busy:    {:5}",
        dma.transfers_started, dma.sends_completed, dma.receives_completed, dma.busy_rejections,
    );
    info!(
        "      Errors:  {:7}, timeouts:  {:7}, refused:   {:7}",
        dma.errors, dma.reset_timeouts, dma.issue_failures,
    );
    info!(
        "ACQ:  Scans:   {:7}, words:     {:7}, overruns:  {:7}, dropped: {:5}",
        acq.scans_completed, acq.words_completed, acq.overruns, acq.dropped_words,
    );
    info!(
        "      Deferred: {:6}, dropped scans: {:3}, overflows: {:5}, unknown: {:5}",
        acq.deferred_words, acq.scans_dropped, acq.accumulator_overflows, acq.unrecognized_edges,
    );
    info!("WDT:  Resets:  {:7}", stats.watchdog_resets);
}
