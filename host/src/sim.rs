//! Synthetic kernel launch
//!
//! Stands in for instrumented device code: worker threads play producer
//! groups, each issuing a deterministic sequence of group accesses against
//! the shared buffer and then retiring itself with `finish_group`.

use anyhow::{Context, Result};
use gpu_patch_shared::types::{PC_STRIDE, WARP_SIZE};
use gpu_patch_shared::{AccessFlags, AddressRange, AppendError, AppendOutcome, TraceBuffer, WarpAccess};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Shape of the simulated kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelShape {
    /// Producer groups (warps); also the buffer's `num_threads`
    pub groups: u32,
    /// Memory instructions each group executes
    pub accesses_per_group: u32,
    /// Blocks the groups are spread over
    pub blocks: u32,
    /// Start of the simulated allocation
    pub base_address: u64,
    /// Bytes of the allocation the accesses wrap around
    pub footprint: u64,
    /// PC of the first instruction
    pub function_pc: u64,
    /// Distinct instructions the accesses cycle through
    pub instructions: u32,
    /// Threads executing groups
    pub workers: u32,
    /// Emit a block enter/exit marker around every group
    pub block_markers: bool,
}

impl Default for KernelShape {
    fn default() -> Self {
        Self {
            groups: 64,
            accesses_per_group: 32,
            blocks: 8,
            base_address: 0x1000_0000,
            footprint: 64 * 1024,
            function_pc: 0x7f00_0000,
            instructions: 64,
            workers: 4,
            block_markers: false,
        }
    }
}

/// Per-worker producer totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerStats {
    pub groups: u32,
    pub queued: u64,
    pub analyzed: u64,
    pub overflowed: u64,
    pub skipped: u64,
    pub dropped: u64,
}

impl ProducerStats {
    pub fn merge(&mut self, other: &ProducerStats) {
        self.groups += other.groups;
        self.queued += other.queued;
        self.analyzed += other.analyzed;
        self.overflowed += other.overflowed;
        self.skipped += other.skipped;
        self.dropped += other.dropped;
    }

    fn count(&mut self, result: Result<AppendOutcome, AppendError>) {
        match result {
            Ok(AppendOutcome::Queued { .. }) => self.queued += 1,
            Ok(AppendOutcome::Analyzed {
                hits,
                inserted,
                overflowed,
            }) => {
                self.analyzed += (hits + inserted) as u64;
                self.overflowed += overflowed as u64;
            }
            Ok(AppendOutcome::Skipped) => self.skipped += 1,
            Err(e) => {
                debug!("access lost: {}", e);
                self.dropped += 1;
            }
        }
    }
}

impl KernelShape {
    pub fn validate(&self) -> Result<()> {
        if self.groups == 0 {
            anyhow::bail!("Kernel must launch at least one group");
        }
        if self.blocks == 0 || self.instructions == 0 || self.workers == 0 {
            anyhow::bail!("Blocks, instructions and workers must be greater than 0");
        }
        if self.footprint < 4 {
            anyhow::bail!("Footprint must cover at least one 4-byte word");
        }
        Ok(())
    }

    pub fn block_of(&self, group: u32) -> u32 {
        group % self.blocks
    }

    pub fn pc_of(&self, step: u32) -> u64 {
        self.function_pc + (step % self.instructions) as u64 * PC_STRIDE
    }

    /// The `step`th access of `group`: every fourth instruction stores, the
    /// rest load; all 32 lanes touch consecutive words.
    pub fn access(&self, group: u32, step: u32) -> WarpAccess {
        let flags = if step % 4 == 3 {
            AccessFlags::WRITE
        } else {
            AccessFlags::READ
        };
        let words = self.footprint / 4;
        let first = (group as u64 * self.accesses_per_group as u64 + step as u64) * WARP_SIZE as u64;

        let mut access = WarpAccess::new(self.pc_of(step), flags, 4)
            .with_ids(group * WARP_SIZE as u32, self.block_of(group));
        for lane in 0..WARP_SIZE {
            let word = (first + lane as u64) % words;
            let value = (word as u32).to_le_bytes();
            access = access.with_lane(lane, self.base_address + word * 4, &value);
        }
        access
    }

    fn marker(&self, group: u32, flags: AccessFlags) -> WarpAccess {
        WarpAccess::new(self.function_pc, flags, 0)
            .with_ids(group * WARP_SIZE as u32, self.block_of(group))
            .with_lane(0, 0, &[])
    }

    /// Split the footprint into `n` equal, adjacent views.
    pub fn view_ranges(&self, n: usize) -> Result<Vec<AddressRange>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let width = self.footprint / n as u64;
        if width == 0 {
            anyhow::bail!("{} views do not fit in a {}-byte footprint", n, self.footprint);
        }
        (0..n as u64)
            .map(|i| {
                let start = self.base_address + i * width;
                AddressRange::new(start, start + width).context("Invalid view range")
            })
            .collect()
    }

    /// Run every group of the kernel against `buffer` on blocking tasks.
    /// Groups are handed out to workers through a shared counter.
    pub fn launch(&self, buffer: Arc<TraceBuffer>) -> Vec<JoinHandle<ProducerStats>> {
        let next_group = Arc::new(AtomicU32::new(0));
        (0..self.workers.min(self.groups))
            .map(|worker| {
                let shape = self.clone();
                let buffer = Arc::clone(&buffer);
                let next_group = Arc::clone(&next_group);
                tokio::task::spawn_blocking(move || {
                    let mut stats = ProducerStats::default();
                    loop {
                        let group = next_group.fetch_add(1, Ordering::Relaxed);
                        if group >= shape.groups {
                            break;
                        }
                        shape.run_group(&buffer, group, &mut stats);
                    }
                    debug!("worker {} finished {} groups", worker, stats.groups);
                    stats
                })
            })
            .collect()
    }

    fn run_group(&self, buffer: &TraceBuffer, group: u32, stats: &mut ProducerStats) {
        if self.block_markers {
            stats.count(buffer.record_access(&self.marker(group, AccessFlags::BLOCK_ENTER)));
        }
        for step in 0..self.accesses_per_group {
            if buffer.is_aborted() {
                stats.dropped += (self.accesses_per_group - step) as u64;
                break;
            }
            stats.count(buffer.record_access(&self.access(group, step)));
        }
        if self.block_markers {
            stats.count(buffer.record_access(&self.marker(group, AccessFlags::BLOCK_EXIT)));
        }
        stats.groups += 1;
        buffer.finish_group();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_pattern() {
        let shape = KernelShape {
            accesses_per_group: 4,
            footprint: 1024,
            instructions: 2,
            ..KernelShape::default()
        };
        let access = shape.access(1, 3);
        assert_eq!(access.flags, AccessFlags::WRITE);
        assert_eq!(access.active, u32::MAX);
        assert_eq!(access.pc, shape.function_pc + PC_STRIDE);
        assert_eq!(access.flat_block_id, 1);

        // (1 * 4 + 3) * 32 = 224 words in, wrapping at 256 words.
        assert_eq!(access.address[0], shape.base_address + 224 * 4);
        assert_eq!(access.address[31], shape.base_address + 255 * 4);
        assert_eq!(shape.access(2, 0).address[0], shape.base_address);
    }

    #[test]
    fn test_view_ranges() {
        let shape = KernelShape {
            footprint: 300,
            ..KernelShape::default()
        };
        let views = shape.view_ranges(3).unwrap();
        assert_eq!(views.len(), 3);
        assert_eq!(views[0].start, shape.base_address);
        assert_eq!(views[1].start, views[0].end);
        assert_eq!(views[2].len(), 100);
        assert!(shape.view_ranges(0).unwrap().is_empty());
        assert!(shape.view_ranges(301).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(KernelShape::default().validate().is_ok());
        let shape = KernelShape {
            groups: 0,
            ..KernelShape::default()
        };
        assert!(shape.validate().is_err());
    }

    #[tokio::test]
    async fn test_launch_runs_every_group() {
        let shape = KernelShape {
            groups: 6,
            accesses_per_group: 3,
            workers: 4,
            block_markers: true,
            ..KernelShape::default()
        };
        let buffer = Arc::new(TraceBuffer::builder(64).num_threads(shape.groups).build().unwrap());

        let mut total = ProducerStats::default();
        for handle in shape.launch(Arc::clone(&buffer)) {
            total.merge(&handle.await.unwrap());
        }
        assert_eq!(total.groups, 6);
        assert_eq!(total.queued, 6 * 5);
        assert!(buffer.is_complete());
        assert_eq!(buffer.drain().len(), 30);
    }
}
