//! Derived-PBF assembly: joins the segment store, the node and way-tag
//! caches, and the rewritten route relations into the output PBF.
//!
//! Emission order is fixed by the writer schema: nodes (ascending id), then
//! one way per segment record in store order, then relations in rewriter
//! output order. Only segments whose base way carries a `highway` tag
//! contribute nodes and ways; barrier-flagged records are dropped unless
//! `include_barriers` is set, consistently with the rewriter input.

use anyhow::{Context, Result};
use log::{info, warn};
use std::path::Path;

use crate::cache::{NodeLookup, WayTagLookup};
use crate::model::{OsmRelation, OUTPUT_TAG_WHITELIST};
use crate::pbf::PbfWriter;
use crate::store::SegmentStoreReader;

#[derive(Debug, Default, Clone, Copy)]
pub struct AssemblyStats {
    pub nodes_written: u64,
    pub ways_written: u64,
    pub ways_skipped: u64,
    pub relations_written: u64,
    pub missing_nodes: u64,
}

pub fn build_derived_pbf(
    store_path: &Path,
    nodes: &dyn NodeLookup,
    way_tags: &dyn WayTagLookup,
    relations: &[OsmRelation],
    include_barriers: bool,
    out: &Path,
) -> Result<AssemblyStats> {
    info!("writing derived PBF to {}", out.display());
    let store = SegmentStoreReader::open(store_path)?;
    let mut writer = PbfWriter::create(out)
        .with_context(|| format!("failed to create derived PBF {}", out.display()))?;
    let mut stats = AssemblyStats::default();

    // Nodes: collect refs of emitted segments, then write by ascending id.
    let mut needed_node_ids: Vec<i64> = Vec::new();
    for record in store.records()? {
        let record = record?;
        if !include_barriers && record.is_barrier() {
            continue;
        }
        if !has_highway(way_tags, record.base_way_id) {
            continue;
        }
        needed_node_ids.extend(record.node_refs.iter().copied());
    }
    needed_node_ids.sort_unstable();
    needed_node_ids.dedup();

    for &node_id in &needed_node_ids {
        let node = match nodes.node(node_id) {
            Some(node) => node,
            None => {
                warn!("node {} not found in cache, skipping", node_id);
                stats.missing_nodes += 1;
                continue;
            }
        };
        writer.write_node(node.id, node.lat, node.lon, &[])?;
        stats.nodes_written += 1;
        if stats.nodes_written % 100_000 == 0 {
            info!("written {} nodes", stats.nodes_written);
        }
    }

    // Ways: one per segment record, in store order.
    for record in store.records()? {
        let record = record?;
        if !include_barriers && record.is_barrier() {
            continue;
        }
        let base_tags = match way_tags.way_tags(record.base_way_id) {
            Some(tags) if tags.contains_key("highway") => tags,
            _ => {
                stats.ways_skipped += 1;
                continue;
            }
        };

        let mut tags: Vec<(String, String)> =
            vec![("base_id".to_string(), record.base_way_id.to_string())];
        for &key in OUTPUT_TAG_WHITELIST {
            if let Some(value) = base_tags.get(key) {
                tags.push((key.to_string(), value.clone()));
            }
        }

        writer.write_way(record.edge_id as i64, &record.node_refs, &tags)?;
        stats.ways_written += 1;
        if stats.ways_written % 10_000 == 0 {
            info!("written {} ways", stats.ways_written);
        }
    }
    if stats.ways_skipped > 0 {
        info!("skipped {} segments without a highway base way", stats.ways_skipped);
    }

    // Relations: rewriter output order.
    for relation in relations {
        let tags: Vec<(String, String)> = relation
            .tags
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        writer.write_relation(relation.id, &tags, &relation.members)?;
        stats.relations_written += 1;
    }

    writer.finish()?;
    info!(
        "derived PBF complete: {} nodes, {} ways, {} relations",
        stats.nodes_written, stats.ways_written, stats.relations_written
    );
    Ok(stats)
}

fn has_highway(way_tags: &dyn WayTagLookup, way_id: i64) -> bool {
    way_tags
        .way_tags(way_id)
        .map_or(false, |tags| tags.contains_key("highway"))
}
