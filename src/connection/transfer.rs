// Chunking and pipelining for block-memory transfers.
//
// The default path issues ordinary image read/write reports through the
// control channel and keeps a bounded number of them in flight. Transports
// with a dedicated bulk pipe instead prime the device's DMA engine per
// chunk and move the payload bytes raw, bypassing the message pipeline for
// data only.

use super::{Core, TransferBuffer};
use crate::config::ChunkPolicy;
use crate::events::MessageEvent;
use crate::message::{MessageHandle, NULL_MESSAGE, Status};
use crate::report::{Action, Direction, HostReport};
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::time::Duration;
use uuid::Uuid;

const WAIT_SLICE: Duration = Duration::from_millis(50);

const DMA_DOWNLOAD: u16 = 0;
const DMA_UPLOAD: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferDir {
    Download,
    Upload,
}

/// State of one block transfer, alive from acceptance to the completion
/// event.
pub(crate) struct FastTransfer {
    buf: TransferBuffer,
    dir: TransferDir,
    /// Total length after rounding up to the transfer unit.
    len: usize,
    start_addr: u32,
    image_index: i32,
    uuid: Uuid,
    policy: ChunkPolicy,
    chunk_count: usize,
    /// 1-based label of the chunk currently being issued.
    current_chunk: usize,
    bytes_remaining_in_chunk: usize,
    cursor: usize,
}

impl FastTransfer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        buf: TransferBuffer,
        dir: TransferDir,
        len: usize,
        start_addr: u32,
        image_index: i32,
        uuid: Uuid,
        policy: ChunkPolicy,
    ) -> Self {
        let mut ft = Self {
            buf,
            dir,
            len,
            start_addr,
            image_index,
            uuid,
            policy,
            chunk_count: policy.chunk_count(len),
            current_chunk: 0,
            bytes_remaining_in_chunk: 0,
            cursor: 0,
        };
        ft.start_next_chunk();
        ft
    }

    fn start_next_chunk(&mut self) {
        if self.current_chunk < self.chunk_count {
            self.current_chunk += 1;
            self.bytes_remaining_in_chunk = if self.current_chunk == self.chunk_count {
                self.len - (self.current_chunk - 1) * self.policy.transfer_unit
            } else {
                self.policy.transfer_unit
            };
        }
    }
}

/// Runs one transfer to completion and fires the terminal event.
pub(crate) fn run(core: &Core, mut ft: FastTransfer) {
    log::debug!(
        "Transfer start: {:?} {} bytes in {} chunks (idx {}, uuid {})",
        ft.dir,
        ft.len,
        ft.chunk_count,
        ft.image_index,
        ft.uuid
    );
    let result = if core.driver.has_bulk() {
        run_bulk(core, &mut ft)
    } else {
        run_pipelined(core, &mut ft)
    };
    match result {
        Ok(bytes) => {
            core.transfer_progress.store(100, Ordering::Release);
            log::debug!("Transfer complete: {} bytes", bytes);
            core.events
                .trigger(MessageEvent::MemoryTransferComplete, bytes as i32);
        }
        Err(chunk) => {
            log::warn!("Transfer aborted at chunk {}", chunk);
            core.events
                .trigger(MessageEvent::MemoryTransferError, chunk as i32);
        }
    }
}

/// Pipelined transfer over the control channel. Returns the byte count on
/// success, the 1-based label of the failing chunk otherwise.
fn run_pipelined(core: &Core, ft: &mut FastTransfer) -> Result<usize, usize> {
    let chunk_size = match ft.dir {
        TransferDir::Download => ft.policy.dl_chunk,
        TransferDir::Upload => ft.policy.ul_chunk,
    };
    let max_in_flight = ft.policy.max_in_flight(chunk_size).max(1);
    let chunk_count = ft.chunk_count;

    let mut inflight: VecDeque<(MessageHandle, usize)> = VecDeque::new();
    let mut collected = 0usize;
    let mut bytes = 0usize;
    let mut failed: Option<usize> = None;

    for _ in 0..chunk_count {
        if failed.is_some() || !core.is_open() {
            break;
        }
        let label = ft.current_chunk;
        let wire_index = label - 1;
        let len = ft.bytes_remaining_in_chunk.min(chunk_size);

        let mut rpt = HostReport::new(
            Action::CtlrImage,
            match ft.dir {
                TransferDir::Download => Direction::Write,
                TransferDir::Upload => Direction::Read,
            },
            (wire_index & 0xFFFF) as u16,
        )
        .with_context((wire_index >> 16) as u8);
        match ft.dir {
            TransferDir::Download => {
                let slice = {
                    let data = ft.buf.lock().unwrap();
                    data[ft.cursor..ft.cursor + len].to_vec()
                };
                rpt = rpt.with_payload(slice);
                ft.cursor += len;
            }
            TransferDir::Upload => {
                rpt = rpt.with_len(len as u16);
            }
        }
        ft.bytes_remaining_in_chunk -= len;
        bytes += len;

        let handle = core.send_msg(&rpt);
        if handle == NULL_MESSAGE {
            failed = Some(label);
            break;
        }
        inflight.push_back((handle, label));
        ft.start_next_chunk();

        if inflight.len() >= max_in_flight {
            collect(core, ft, &mut inflight, max_in_flight, true, &mut collected, &mut failed);
        }
    }

    // Drain whatever is still outstanding, also on the failure path so the
    // registry is quiet before the error event fires.
    while !inflight.is_empty() && core.is_open() {
        collect(core, ft, &mut inflight, max_in_flight, false, &mut collected, &mut failed);
    }

    match failed {
        None if core.is_open() => Ok(bytes),
        None => Err(ft.current_chunk),
        Some(chunk) => Err(chunk),
    }
}

/// Blocks on the registry broadcast until at least one in-flight chunk
/// completed (or, when `expecting_more`, until the in-flight set has room
/// again), then folds the completions into the transfer state.
#[allow(clippy::too_many_arguments)]
fn collect(
    core: &Core,
    ft: &mut FastTransfer,
    inflight: &mut VecDeque<(MessageHandle, usize)>,
    max_in_flight: usize,
    expecting_more: bool,
    collected: &mut usize,
    failed: &mut Option<usize>,
) {
    let mut done: Vec<(usize, Option<(Status, Vec<u8>)>)> = Vec::new();
    core.registry.wait_until(
        || {
            let mut any_removed = false;
            inflight.retain(|(handle, label)| match core.registry.find(*handle) {
                Some(msg) if msg.is_complete() => {
                    let payload = msg.response().payload().to_vec();
                    done.push((*label, Some((msg.status(), payload))));
                    any_removed = true;
                    false
                }
                Some(_) => true,
                None => {
                    done.push((*label, None));
                    any_removed = true;
                    false
                }
            });
            any_removed
                || (expecting_more && inflight.len() < max_in_flight)
                || !core.is_open()
        },
        WAIT_SLICE,
    );

    for (label, outcome) in done {
        match outcome {
            Some((Status::RxOk, payload)) => {
                if ft.dir == TransferDir::Upload {
                    // Place by chunk index, not completion order.
                    let offset = (label - 1) * ft.policy.transfer_unit;
                    let mut data = ft.buf.lock().unwrap();
                    let end = (offset + payload.len()).min(data.len());
                    data[offset..end].copy_from_slice(&payload[..end - offset]);
                }
                *collected += 1;
                core.transfer_progress
                    .store(((*collected * 100) / ft.chunk_count.max(1)) as i32, Ordering::Release);
            }
            _ => {
                if failed.is_none() {
                    *failed = Some(label);
                }
            }
        }
    }
}

/// Legacy raw-bulk transfer: one DMA prime report per chunk, payload bytes
/// straight through the bulk endpoints.
fn run_bulk(core: &Core, ft: &mut FastTransfer) -> Result<usize, usize> {
    let mut bytes = 0usize;
    let chunk_count = ft.chunk_count;
    for _ in 0..chunk_count {
        if !core.is_open() {
            return Err(ft.current_chunk);
        }
        let label = ft.current_chunk;
        let chunk_len = ft.bytes_remaining_in_chunk;
        let dev_addr = ft.start_addr + ((label as u32 - 1) * ft.policy.transfer_unit as u32);

        let selector = match ft.dir {
            TransferDir::Download => DMA_DOWNLOAD,
            TransferDir::Upload => DMA_UPLOAD,
        };
        let mut prime_payload = Vec::with_capacity(8);
        prime_payload.extend_from_slice(&(chunk_len as u32).to_le_bytes());
        prime_payload.extend_from_slice(&dev_addr.to_le_bytes());
        let prime = HostReport::new(Action::CtlrImgDma, Direction::Write, selector)
            .with_payload(prime_payload);
        let resp = core.send_msg_blocking(&prime);
        if !resp.done() {
            return Err(label);
        }

        let mut moved = 0usize;
        while moved < chunk_len {
            match ft.dir {
                TransferDir::Download => {
                    let n = (chunk_len - moved).min(ft.policy.dl_chunk);
                    let slice = {
                        let data = ft.buf.lock().unwrap();
                        data[ft.cursor..ft.cursor + n].to_vec()
                    };
                    let mut written = 0usize;
                    while written < n {
                        match core.driver.write_bulk(&slice[written..]) {
                            Ok(0) => continue,
                            Ok(w) => written += w,
                            Err(e) => {
                                log::error!("Bulk write failed: {}", e);
                                return Err(label);
                            }
                        }
                    }
                    ft.cursor += n;
                    moved += n;
                    bytes += n;
                }
                TransferDir::Upload => {
                    let n = (chunk_len - moved).min(ft.policy.ul_chunk);
                    let mut tmp = vec![0u8; n];
                    let mut read = 0usize;
                    while read < n {
                        match core.driver.read_bulk(&mut tmp[read..]) {
                            Ok(0) => continue,
                            Ok(r) => read += r,
                            Err(e) => {
                                log::error!("Bulk read failed: {}", e);
                                return Err(label);
                            }
                        }
                    }
                    {
                        let mut data = ft.buf.lock().unwrap();
                        data[ft.cursor..ft.cursor + n].copy_from_slice(&tmp);
                    }
                    ft.cursor += n;
                    moved += n;
                    bytes += n;
                }
            }
        }
        ft.bytes_remaining_in_chunk = 0;
        core.transfer_progress
            .store(((label * 100) / chunk_count.max(1)) as i32, Ordering::Release);
        ft.start_next_chunk();
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn ft(dir: TransferDir, len: usize, policy: ChunkPolicy) -> FastTransfer {
        FastTransfer::new(
            Arc::new(Mutex::new(vec![0; len])),
            dir,
            len,
            0,
            0,
            Uuid::nil(),
            policy,
        )
    }

    #[test]
    fn chunks_start_at_label_one() {
        let t = ft(TransferDir::Download, 4096, ChunkPolicy::default());
        assert_eq!(t.chunk_count, 64);
        assert_eq!(t.current_chunk, 1);
        assert_eq!(t.bytes_remaining_in_chunk, 64);
    }

    #[test]
    fn last_chunk_carries_the_remainder() {
        let policy = ChunkPolicy::default();
        let mut t = ft(TransferDir::Upload, 128, policy);
        t.start_next_chunk();
        assert_eq!(t.current_chunk, 2);
        assert_eq!(t.bytes_remaining_in_chunk, 64);
        // Advancing past the last chunk changes nothing.
        t.start_next_chunk();
        assert_eq!(t.current_chunk, 2);
    }

    #[test]
    fn wire_index_overflows_into_context() {
        // Chunk labels above 0x10000 carry their high bits in the context
        // byte. Verify the arithmetic the planner applies.
        let label: usize = 0x1_0001;
        let wire_index = label - 1;
        assert_eq!((wire_index & 0xFFFF) as u16, 0x0000);
        assert_eq!((wire_index >> 16) as u8, 0x01);
    }
}
