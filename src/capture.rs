//! Capture driver pairing producer callbacks with edge ids.
//!
//! The segment producer announces every segment twice: once *before* the
//! edge exists (`on_segment`, carrying the OSM-side metadata) and once when
//! the edge is materialized (`on_edge`). The two callback streams arrive in
//! strict 1:1 order, which is the only synchronization contract with the
//! producer. A FIFO of pending segments bridges the pair; each `on_edge`
//! pops the head, assigns the next sequential edge id, and appends a record
//! to the segment store.

use anyhow::{bail, Context, Result};
use log::info;
use std::collections::VecDeque;

use crate::store::{SegmentRecord, SegmentStoreWriter};

struct PendingSegment {
    base_way_id: i64,
    node_refs: Vec<i64>,
    seg_index: u32,
    barrier: bool,
}

pub struct SegmentCapture {
    writer: SegmentStoreWriter,
    pending: VecDeque<PendingSegment>,
    next_edge_id: u32,
    captured: u64,
}

impl SegmentCapture {
    pub fn new(writer: SegmentStoreWriter) -> Self {
        Self {
            writer,
            pending: VecDeque::new(),
            next_edge_id: 0,
            captured: 0,
        }
    }

    /// Called before the edge for this segment is created.
    pub fn on_segment(&mut self, base_way_id: i64, node_refs: &[i64], seg_index: u32, barrier: bool) {
        self.pending.push_back(PendingSegment {
            base_way_id,
            node_refs: node_refs.to_vec(),
            seg_index,
            barrier,
        });
    }

    /// Called when the matching edge is materialized. Pops the pending
    /// segment, assigns the next edge id, and writes the record.
    pub fn on_edge(&mut self) -> Result<()> {
        let pending = match self.pending.pop_front() {
            Some(pending) => pending,
            None => bail!(
                "edge committed with no pending segment after {} records; \
                 producer pre/commit callbacks are out of sync",
                self.captured
            ),
        };

        let edge_id = self.next_edge_id;
        self.next_edge_id = self
            .next_edge_id
            .checked_add(1)
            .context("edge id counter overflowed u32")?;

        let record = SegmentRecord::new(
            edge_id,
            pending.base_way_id,
            pending.seg_index,
            pending.barrier,
            pending.node_refs,
        )?;
        self.writer
            .write(&record)
            .with_context(|| format!("failed to write segment record for edge {edge_id}"))?;

        self.captured += 1;
        if self.captured % 100_000 == 0 {
            info!("captured {} segments", self.captured);
        }
        Ok(())
    }

    /// Verifies every pre callback was matched by a commit, then closes the
    /// store. Returns the number of captured segments.
    pub fn finish(mut self) -> Result<u64> {
        if !self.pending.is_empty() {
            bail!(
                "capture ended with {} pending segments never matched to edges; \
                 producer pre/commit callbacks are out of sync",
                self.pending.len()
            );
        }
        self.writer.close()?;
        Ok(self.captured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SegmentStoreReader;
    use anyhow::Result;
    use tempfile::NamedTempFile;

    #[test]
    fn assigns_sequential_edge_ids_in_commit_order() {
        let tmp = NamedTempFile::new().unwrap();
        let writer = SegmentStoreWriter::create(tmp.path()).unwrap();
        let mut capture = SegmentCapture::new(writer);

        capture.on_segment(100, &[1, 2, 3], 0, false);
        capture.on_edge().unwrap();
        capture.on_segment(100, &[3, 4, 5, 6], 1, false);
        capture.on_edge().unwrap();
        assert_eq!(capture.finish().unwrap(), 2);

        let reader = SegmentStoreReader::open(tmp.path()).unwrap();
        let records: Vec<_> = reader
            .records()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(records[0].edge_id, 0);
        assert_eq!(records[0].node_refs, vec![1, 2, 3]);
        assert_eq!(records[1].edge_id, 1);
        assert_eq!(records[1].seg_index, 1);
    }

    #[test]
    fn buffers_multiple_pending_segments() {
        let tmp = NamedTempFile::new().unwrap();
        let writer = SegmentStoreWriter::create(tmp.path()).unwrap();
        let mut capture = SegmentCapture::new(writer);

        capture.on_segment(7, &[1, 2], 0, false);
        capture.on_segment(7, &[2, 3], 1, true);
        capture.on_edge().unwrap();
        capture.on_edge().unwrap();
        assert_eq!(capture.finish().unwrap(), 2);

        let reader = SegmentStoreReader::open(tmp.path()).unwrap();
        let records: Vec<_> = reader
            .records()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert!(!records[0].is_barrier());
        assert!(records[1].is_barrier());
    }

    #[test]
    fn commit_without_pending_segment_fails() {
        let tmp = NamedTempFile::new().unwrap();
        let writer = SegmentStoreWriter::create(tmp.path()).unwrap();
        let mut capture = SegmentCapture::new(writer);
        let err = capture.on_edge().unwrap_err();
        assert!(err.to_string().contains("out of sync"));
    }

    #[test]
    fn unmatched_pending_segment_fails_on_finish() {
        let tmp = NamedTempFile::new().unwrap();
        let writer = SegmentStoreWriter::create(tmp.path()).unwrap();
        let mut capture = SegmentCapture::new(writer);
        capture.on_segment(100, &[1, 2], 0, false);
        let err = capture.finish().unwrap_err();
        assert!(err.to_string().contains("pending"));
    }
}
