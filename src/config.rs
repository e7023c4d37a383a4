// Contains tunable policy values for a connection and the protocol bounds
// the codec enforces.

use std::ops::RangeInclusive;
use std::time::Duration;

pub(crate) const BAUD_BOUNDS: RangeInclusive<u32> = 9_600..=1_000_000;
pub(crate) const DEFAULT_BAUD: u32 = 115_200;

/// Per-connection timeout policy, in the order the device manual quotes them.
///
/// All values are per-message; none of them bounds the lifetime of the
/// connection itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Longest the sender will spend pushing one serialised report into the
    /// transport before marking the message `TimeoutOnSend`.
    pub send_timeout: Duration,
    /// Longest a sent message may wait for its response to finish parsing
    /// before the supervisor marks it `TimeoutOnRecv`.
    pub rx_timeout: Duration,
    /// How long a terminal message stays findable in the registry before the
    /// supervisor evicts it.
    pub auto_free_timeout: Duration,
    /// Response budget for the identity probe used during discovery.
    pub discover_timeout: Duration,
}

impl Timeouts {
    /// Defaults for serial transports. Sending needs to be a bit more
    /// generous than on USB otherwise connection attempts can fail.
    pub fn serial() -> Self {
        Self {
            send_timeout: Duration::from_millis(1000),
            rx_timeout: Duration::from_millis(5000),
            auto_free_timeout: Duration::from_millis(30_000),
            discover_timeout: Duration::from_millis(2500),
        }
    }

    /// Defaults for USB bulk transports.
    pub fn usb() -> Self {
        Self {
            send_timeout: Duration::from_millis(500),
            rx_timeout: Duration::from_millis(10_000),
            auto_free_timeout: Duration::from_millis(30_000),
            discover_timeout: Duration::from_millis(2500),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::serial()
    }
}

/// Chunking policy for block-memory transfers, provided by the transport
/// driver.
///
/// A transfer is partitioned into chunks of `transfer_unit` bytes; the total
/// length is always rounded up to a multiple of it. `dma_max_bytes` bounds
/// how much data may be outstanding at once, which fixes the in-flight
/// request budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    /// Transfer granularity in bytes. Chunk boundaries and total length are
    /// aligned to this.
    pub transfer_unit: usize,
    /// Payload bytes carried by one download (host to device) request.
    pub dl_chunk: usize,
    /// Payload bytes requested by one upload (device to host) request.
    pub ul_chunk: usize,
    /// Upper bound on bytes outstanding in the device's DMA engine.
    pub dma_max_bytes: usize,
}

impl ChunkPolicy {
    /// Number of requests that may be in flight at once for the given
    /// chunk size.
    pub fn max_in_flight(&self, chunk: usize) -> usize {
        self.dma_max_bytes / chunk.max(1)
    }

    /// `len` rounded up to the next multiple of `transfer_unit`.
    pub fn round_up(&self, len: usize) -> usize {
        if len == 0 {
            return self.transfer_unit;
        }
        (((len - 1) / self.transfer_unit) + 1) * self.transfer_unit
    }

    /// Number of chunks needed to carry `len` bytes.
    pub fn chunk_count(&self, len: usize) -> usize {
        self.round_up(len) / self.transfer_unit
    }
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            transfer_unit: 64,
            dl_chunk: 64,
            ul_chunk: 64,
            dma_max_bytes: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_aligns_to_transfer_unit() {
        let p = ChunkPolicy::default();
        assert_eq!(p.round_up(1), 64);
        assert_eq!(p.round_up(64), 64);
        assert_eq!(p.round_up(65), 128);
        assert_eq!(p.round_up(0), 64);
    }

    #[test]
    fn in_flight_budget_follows_dma_window() {
        let p = ChunkPolicy {
            transfer_unit: 64,
            dl_chunk: 64,
            ul_chunk: 64,
            dma_max_bytes: 1024,
        };
        assert_eq!(p.max_in_flight(p.ul_chunk), 16);
        assert_eq!(p.max_in_flight(0), 1024);
    }

    #[test]
    fn chunk_count_matches_rounding() {
        let p = ChunkPolicy::default();
        assert_eq!(p.chunk_count(4096), 64);
        assert_eq!(p.chunk_count(4095), 64);
        assert_eq!(p.chunk_count(4097), 65);
    }
}
