//! Post-launch analysis of drained records and auxiliary structures

use gpu_patch_shared::{
    AccessFlags, AddressDict, AddressRange, DictEntry, DrainedRecords, RecordType, TorchViewDict,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::drain::DrainReport;
use crate::sim::ProducerStats;

/// Totals over every queued record of a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessSummary {
    pub record_type: Option<RecordType>,
    pub records: u64,
    pub active_lanes: u64,
    pub reads: u64,
    pub writes: u64,
    pub atomics: u64,
    pub shared: u64,
    pub local: u64,
    pub block_enters: u64,
    pub block_exits: u64,
    /// Full records whose active lanes all carried the same value
    pub uniform_value_records: u64,
    /// Bytes covered by queued analysis ranges
    pub analysis_bytes: u64,
    /// Records per program counter
    pub per_pc: BTreeMap<u64, u64>,
}

impl AccessSummary {
    pub fn from_batches<'a>(batches: impl IntoIterator<Item = &'a DrainedRecords>) -> Self {
        let mut summary = Self::default();
        for records in batches {
            summary.add(records);
        }
        summary
    }

    pub fn add(&mut self, records: &DrainedRecords) {
        self.record_type.get_or_insert(records.record_type());
        self.records += records.len() as u64;

        match records {
            DrainedRecords::Full(records) => {
                for record in records {
                    self.count(record.pc, record.access_flags(), record.active);
                    let mut values = record.active_lanes().map(|lane| record.lane_value(lane));
                    if let Some(first) = values.next() {
                        if values.all(|v| v == first) {
                            self.uniform_value_records += 1;
                        }
                    }
                }
            }
            DrainedRecords::Address(records) => {
                for record in records {
                    self.count(record.pc, record.access_flags(), record.active);
                }
            }
            DrainedRecords::Analysis(ranges) => {
                self.analysis_bytes += ranges.iter().map(AddressRange::len).sum::<u64>();
            }
        }
    }

    fn count(&mut self, pc: u64, flags: AccessFlags, active: u32) {
        *self.per_pc.entry(pc).or_default() += 1;
        self.active_lanes += active.count_ones() as u64;
        let tally = [
            (AccessFlags::READ, &mut self.reads),
            (AccessFlags::WRITE, &mut self.writes),
            (AccessFlags::ATOMSYS, &mut self.atomics),
            (AccessFlags::SHARED, &mut self.shared),
            (AccessFlags::LOCAL, &mut self.local),
            (AccessFlags::BLOCK_ENTER, &mut self.block_enters),
            (AccessFlags::BLOCK_EXIT, &mut self.block_exits),
        ];
        for (flag, counter) in tally {
            if flags.contains(flag) {
                *counter += 1;
            }
        }
    }

    /// The `n` program counters with the most records, busiest first.
    pub fn hottest_pcs(&self, n: usize) -> Vec<(u64, u64)> {
        let mut pcs: Vec<_> = self.per_pc.iter().map(|(&pc, &count)| (pc, count)).collect();
        pcs.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        pcs.truncate(n);
        pcs
    }
}

/// Address dictionary contents after the launch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DictionaryReport {
    pub entries: Vec<DictEntry>,
    pub read_ranges: usize,
    pub written_ranges: usize,
    /// Updates that did not fit and were queued as analysis records instead
    pub overflowed: u32,
}

impl DictionaryReport {
    pub fn from_dict(dict: &AddressDict) -> Self {
        let entries = dict.entries();
        Self {
            read_ranges: entries.iter().filter(|e| e.read).count(),
            written_ranges: entries.iter().filter(|e| e.write).count(),
            overflowed: dict.overflowed(),
            entries,
        }
    }
}

/// Which instructions used one view range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewLiveness {
    pub range_index: usize,
    pub range: AddressRange,
    pub first_read_pc: Option<u64>,
    pub last_read_pc: Option<u64>,
    pub first_write_pc: Option<u64>,
    pub last_write_pc: Option<u64>,
}

impl ViewLiveness {
    /// True if no instruction touched the range.
    pub fn is_dead(&self) -> bool {
        self.first_read_pc.is_none() && self.first_write_pc.is_none()
    }
}

/// Per-view first and last touching instruction, from the TorchView bitmaps.
pub fn view_liveness(dict: &TorchViewDict) -> Vec<ViewLiveness> {
    dict.ranges()
        .iter()
        .enumerate()
        .map(|(index, range)| {
            let (first_read_pc, last_read_pc) = pc_span(dict, dict.read_rows(index));
            let (first_write_pc, last_write_pc) = pc_span(dict, dict.write_rows(index));
            ViewLiveness {
                range_index: index,
                range: *range,
                first_read_pc,
                last_read_pc,
                first_write_pc,
                last_write_pc,
            }
        })
        .collect()
}

fn pc_span(
    dict: &TorchViewDict,
    mut rows: impl Iterator<Item = usize>,
) -> (Option<u64>, Option<u64>) {
    let first = rows.next();
    let last = rows.last().or(first);
    (first.map(|r| dict.pc_of(r)), last.map(|r| dict.pc_of(r)))
}

/// Everything the host learned from one launch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub drain: DrainReport,
    pub producers: ProducerStats,
    pub accesses: AccessSummary,
    pub dictionary: Option<DictionaryReport>,
    pub views: Vec<ViewLiveness>,
}
