//! Legacy extraction: in-memory id sets and text caches. Fine for small
//! extracts and regression fixtures; use the streaming driver for
//! country-scale inputs.

use anyhow::{Context, Result};
use log::info;
use osmpbf::{Element, ElementReader};
use std::collections::HashSet;
use std::path::Path;

use super::streaming::{convert_relation, whitelisted_tags};
use super::{elevation_from_tags, is_route_relation, ExtractionStats};
use crate::cache::{RelationCacheWriter, TextNodeCacheWriter, TextWayTagCacheWriter};
use crate::model::OsmNode;
use crate::store::SegmentStoreReader;

/// Runs the legacy extraction, writing `nodes.txt`, `way_tags.txt`, and
/// `relations.txt` into `cache_dir`.
pub fn extract(osm: &Path, store_path: &Path, cache_dir: &Path) -> Result<ExtractionStats> {
    info!("legacy extraction from {}", osm.display());

    let mut needed_node_ids: HashSet<i64> = HashSet::new();
    let mut needed_way_ids: HashSet<i64> = HashSet::new();
    {
        let reader = SegmentStoreReader::open(store_path)?;
        for record in reader.records()? {
            let record = record?;
            needed_way_ids.insert(record.base_way_id);
            needed_node_ids.extend(record.node_refs.iter().copied());
        }
    }
    info!(
        "needed ids: {} nodes, {} ways",
        needed_node_ids.len(),
        needed_way_ids.len()
    );

    std::fs::create_dir_all(cache_dir)
        .with_context(|| format!("failed to create cache directory {}", cache_dir.display()))?;

    let mut node_cache = TextNodeCacheWriter::create(cache_dir.join("nodes.txt"))?;
    let mut way_cache = TextWayTagCacheWriter::create(cache_dir.join("way_tags.txt"))?;
    let mut relation_cache = RelationCacheWriter::create(cache_dir.join("relations.txt"))?;

    let mut stats = ExtractionStats::default();
    let mut failure: Option<anyhow::Error> = None;
    let reader = ElementReader::from_path(osm)
        .with_context(|| format!("failed to open {}", osm.display()))?;
    reader.for_each(|element| {
        if failure.is_some() {
            return;
        }
        let result = match element {
            Element::Node(node) => handle_node(
                node.id(),
                node.lat(),
                node.lon(),
                elevation_from_tags(node.tags()),
                &needed_node_ids,
                &mut node_cache,
                &mut stats,
            ),
            Element::DenseNode(node) => handle_node(
                node.id(),
                node.lat(),
                node.lon(),
                elevation_from_tags(node.tags()),
                &needed_node_ids,
                &mut node_cache,
                &mut stats,
            ),
            Element::Way(way) => {
                if needed_way_ids.contains(&way.id()) {
                    stats.ways_extracted += 1;
                    way_cache.put(way.id(), &whitelisted_tags(way.tags()))
                } else {
                    Ok(())
                }
            }
            Element::Relation(relation) => {
                if is_route_relation(relation.tags()) {
                    stats.relations_extracted += 1;
                    relation_cache.put(&convert_relation(&relation))
                } else {
                    Ok(())
                }
            }
        };
        if let Err(err) = result {
            failure = Some(err);
        }
    })?;
    if let Some(err) = failure {
        return Err(err);
    }

    node_cache.finish()?;
    way_cache.finish()?;
    relation_cache.finish()?;

    info!(
        "extraction complete: {} nodes, {} ways, {} relations",
        stats.nodes_extracted, stats.ways_extracted, stats.relations_extracted
    );
    Ok(stats)
}

fn handle_node(
    id: i64,
    lat: f64,
    lon: f64,
    ele: f64,
    needed: &HashSet<i64>,
    cache: &mut TextNodeCacheWriter,
    stats: &mut ExtractionStats,
) -> Result<()> {
    if !needed.contains(&id) {
        return Ok(());
    }
    stats.nodes_extracted += 1;
    cache.put(&OsmNode { id, lat, lon, ele })
}
