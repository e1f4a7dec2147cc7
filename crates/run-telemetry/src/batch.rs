// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Batching of sequenced records into transport-sized submissions.
//!
//! A [`Batch`] holds records of one run, all of one [`RecordKind`], with
//! contiguous sequence numbers. Bulk kinds (metrics, events) are packed up to
//! the count and byte limits; every other kind travels alone because its
//! endpoint accepts a single object.
//!
//! ```text
//!   push(seq 1 metric) push(seq 2 metric) push(seq 3 alert) push(seq 4 metric)
//!            │                                   │                 │
//!            v                                   v                 v
//!   [metric 1..=2]                          [alert 3]         [metric 4]
//! ```

use std::collections::VecDeque;
use uuid::Uuid;

use crate::record::{RecordKind, SequencedRecord};

/// Count and size limits applied when cutting batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_records: usize,
    pub max_bytes: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_records: 1_000,
            max_bytes: 1_024 * 1_024,
        }
    }
}

/// An ordered group of records destined for one HTTP submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub run_id: Uuid,
    pub kind: RecordKind,
    pub records: Vec<SequencedRecord>,
}

impl Batch {
    #[must_use]
    pub fn first_seq(&self) -> u64 {
        self.records.first().map_or(0, |r| r.seq)
    }

    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.records.last().map_or(0, |r| r.seq)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Accumulates records of one run in sequence order and cuts them into
/// batches.
#[derive(Debug)]
pub struct Batcher {
    run_id: Uuid,
    limits: BatchLimits,
    pending: VecDeque<(SequencedRecord, usize)>,
    pending_bytes: usize,
}

impl Batcher {
    #[must_use]
    pub fn new(run_id: Uuid, limits: BatchLimits) -> Self {
        Self {
            run_id,
            limits,
            pending: VecDeque::new(),
            pending_bytes: 0,
        }
    }

    /// Appends a record. `size` is its encoded length in bytes.
    pub fn push(&mut self, record: SequencedRecord, size: usize) {
        debug_assert!(
            self.pending.back().map_or(true, |(last, _)| last.seq < record.seq),
            "records must be pushed in ascending sequence order"
        );
        self.pending_bytes += size;
        self.pending.push_back((record, size));
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// True once the pending records reach either limit.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.limits.max_records || self.pending_bytes >= self.limits.max_bytes
    }

    /// Cuts the next batch off the front of the queue, or `None` when empty.
    ///
    /// A batch always contains at least one record, even if that record
    /// alone exceeds the byte limit.
    pub fn next_batch(&mut self) -> Option<Batch> {
        let (first, first_size) = self.pending.pop_front()?;
        self.pending_bytes -= first_size;
        let kind = first.record.kind();
        let mut bytes = first_size;
        let mut records = vec![first];

        if kind.is_bulk() {
            while records.len() < self.limits.max_records {
                let Some((next, size)) = self.pending.front() else {
                    break;
                };
                if next.record.kind() != kind || bytes + size > self.limits.max_bytes {
                    break;
                }
                let size = *size;
                if let Some((next, _)) = self.pending.pop_front() {
                    self.pending_bytes -= size;
                    bytes += size;
                    records.push(next);
                }
            }
        }

        Some(Batch {
            run_id: self.run_id,
            kind,
            records,
        })
    }
}
