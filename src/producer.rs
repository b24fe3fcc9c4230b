//! Reference segment producer: splits highway ways into routing segments.
//!
//! Walks the source PBF twice. The first pass counts how many accepted ways
//! reference each node and remembers barrier-tagged nodes; the second pass
//! cuts every highway-tagged way at endpoints, shared nodes, and barrier
//! nodes, announcing each resulting segment to the capture driver as a
//! pre/commit callback pair in base-way order.
//!
//! A barrier node inside a way additionally yields an artificial `[n, n]`
//! segment flagged as a barrier, inserted at its position so segment indices
//! stay dense across regular and barrier segments.

use anyhow::{Context, Result};
use log::info;
use osmpbf::{Element, ElementReader};
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::capture::SegmentCapture;

/// Drives the capture driver over every highway way in the PBF. Returns the
/// number of ways that produced at least one segment.
pub fn split_ways(osm: &Path, capture: &mut SegmentCapture) -> Result<u64> {
    info!("scanning {} for node usage", osm.display());
    let scan = scan_nodes(osm)?;
    info!(
        "node scan complete: {} referenced nodes, {} barrier nodes",
        scan.usage.len(),
        scan.barrier_nodes.len()
    );

    let reader = ElementReader::from_path(osm)
        .with_context(|| format!("failed to open {}", osm.display()))?;

    let mut ways_split = 0u64;
    let mut failure: Option<anyhow::Error> = None;
    reader.for_each(|element| {
        if failure.is_some() {
            return;
        }
        if let Element::Way(way) = element {
            if !has_highway_tag(way.tags()) {
                return;
            }
            let refs: Vec<i64> = way.refs().collect();
            match split_one_way(way.id(), &refs, &scan, capture) {
                Ok(true) => ways_split += 1,
                Ok(false) => {}
                Err(err) => failure = Some(err),
            }
        }
    })?;
    if let Some(err) = failure {
        return Err(err);
    }

    info!("split {} ways into segments", ways_split);
    Ok(ways_split)
}

struct NodeScan {
    usage: HashMap<i64, u32>,
    barrier_nodes: HashSet<i64>,
}

fn scan_nodes(osm: &Path) -> Result<NodeScan> {
    let reader = ElementReader::from_path(osm)
        .with_context(|| format!("failed to open {}", osm.display()))?;

    let mut usage: HashMap<i64, u32> = HashMap::new();
    let mut barrier_nodes = HashSet::new();

    reader.for_each(|element| match element {
        Element::Node(node) => {
            if node.tags().any(|(k, _)| k == "barrier") {
                barrier_nodes.insert(node.id());
            }
        }
        Element::DenseNode(node) => {
            if node.tags().any(|(k, _)| k == "barrier") {
                barrier_nodes.insert(node.id());
            }
        }
        Element::Way(way) => {
            if has_highway_tag(way.tags()) {
                for node_ref in way.refs() {
                    *usage.entry(node_ref).or_insert(0) += 1;
                }
            }
        }
        Element::Relation(_) => {}
    })?;

    Ok(NodeScan {
        usage,
        barrier_nodes,
    })
}

fn has_highway_tag<'a>(mut tags: impl Iterator<Item = (&'a str, &'a str)>) -> bool {
    tags.any(|(k, _)| k == "highway")
}

fn split_one_way(
    way_id: i64,
    refs: &[i64],
    scan: &NodeScan,
    capture: &mut SegmentCapture,
) -> Result<bool> {
    if refs.len() < 2 {
        return Ok(false);
    }

    let mut seg_index = 0u32;
    let mut start = 0usize;
    for i in 1..refs.len() {
        let node = refs[i];
        let is_last = i == refs.len() - 1;
        let is_junction = scan.usage.get(&node).copied().unwrap_or(0) > 1;
        let is_barrier = scan.barrier_nodes.contains(&node);
        if !(is_last || is_junction || is_barrier) {
            continue;
        }

        capture.on_segment(way_id, &refs[start..=i], seg_index, false);
        capture.on_edge()?;
        seg_index += 1;

        if is_barrier && !is_last {
            capture.on_segment(way_id, &[node, node], seg_index, true);
            capture.on_edge()?;
            seg_index += 1;
        }

        start = i;
    }

    Ok(seg_index > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SegmentStoreReader, SegmentStoreWriter};
    use tempfile::NamedTempFile;

    fn capture_one_way(refs: &[i64], usage: &[(i64, u32)], barriers: &[i64]) -> Vec<crate::store::SegmentRecord> {
        let tmp = NamedTempFile::new().unwrap();
        let writer = SegmentStoreWriter::create(tmp.path()).unwrap();
        let mut capture = SegmentCapture::new(writer);
        let scan = NodeScan {
            usage: usage.iter().copied().collect(),
            barrier_nodes: barriers.iter().copied().collect(),
        };
        split_one_way(42, refs, &scan, &mut capture).unwrap();
        capture.finish().unwrap();

        let reader = SegmentStoreReader::open(tmp.path()).unwrap();
        reader
            .records()
            .unwrap()
            .collect::<anyhow::Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn unbroken_way_is_one_segment() {
        let records = capture_one_way(&[1, 2, 3, 4], &[(1, 1), (2, 1), (3, 1), (4, 1)], &[]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].node_refs, vec![1, 2, 3, 4]);
        assert_eq!(records[0].seg_index, 0);
    }

    #[test]
    fn splits_at_junction_nodes() {
        let records = capture_one_way(&[1, 2, 3, 4], &[(1, 1), (2, 1), (3, 2), (4, 1)], &[]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].node_refs, vec![1, 2, 3]);
        assert_eq!(records[1].node_refs, vec![3, 4]);
        assert_eq!(records[1].seg_index, 1);
    }

    #[test]
    fn interior_barrier_inserts_artificial_segment() {
        let records = capture_one_way(&[1, 2, 3], &[(1, 1), (2, 1), (3, 1)], &[2]);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].node_refs, vec![1, 2]);
        assert!(records[1].is_barrier());
        assert_eq!(records[1].node_refs, vec![2, 2]);
        assert_eq!(records[2].node_refs, vec![2, 3]);
        // Indices stay dense across the barrier segment.
        let indices: Vec<u32> = records.iter().map(|r| r.seg_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
