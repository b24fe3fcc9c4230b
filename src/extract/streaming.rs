//! Streaming extraction: binary caches, sorted-array membership tests, and
//! an optional dictionary-building pre-pass. This is the driver for
//! country-scale inputs; it never holds a hash set of node ids.

use anyhow::{Context, Result};
use log::info;
use osmpbf::{Element, ElementReader};
use std::path::Path;

use super::{elevation_from_tags, id_sets, is_route_relation, ExtractionStats};
use crate::cache::{
    BinaryNodeCacheWriter, CompressedWayTagCacheWriter, RelationCacheWriter, TagDictionary,
};
use crate::model::{Member, MemberKind, OsmNode, OsmRelation, Tags, EXTRACT_TAG_WHITELIST};

const DICTIONARY_SAMPLE_SIZE: usize = 100_000;

/// Runs the streaming extraction: derive id sets from the segment store,
/// optionally build the tag dictionary, then scan the PBF once, writing
/// `nodes.bin`, `way_tags.bin`, and `relations.txt` into `cache_dir`.
pub fn extract(
    osm: &Path,
    store_path: &Path,
    cache_dir: &Path,
    build_dictionary: bool,
) -> Result<ExtractionStats> {
    info!("streaming extraction from {}", osm.display());

    let ids = id_sets::extract_needed_ids(store_path)?;
    info!(
        "id arrays hold ~{} MB",
        (ids.node_ids.len() + ids.way_ids.len()) * 8 / 1024 / 1024
    );

    std::fs::create_dir_all(cache_dir)
        .with_context(|| format!("failed to create cache directory {}", cache_dir.display()))?;

    let dictionary = if build_dictionary {
        build_tag_dictionary(osm, &ids.way_ids)?
    } else {
        TagDictionary::empty()
    };

    let mut node_cache = BinaryNodeCacheWriter::create(cache_dir.join("nodes.bin"))?;
    let mut way_cache =
        CompressedWayTagCacheWriter::create(cache_dir.join("way_tags.bin"), dictionary)?;
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
                &ids.node_ids,
                &mut node_cache,
                &mut stats,
            ),
            Element::DenseNode(node) => handle_node(
                node.id(),
                node.lat(),
                node.lon(),
                elevation_from_tags(node.tags()),
                &ids.node_ids,
                &mut node_cache,
                &mut stats,
            ),
            Element::Way(way) => {
                if ids.way_ids.binary_search(&way.id()).is_ok() {
                    let tags = whitelisted_tags(way.tags());
                    stats.ways_extracted += 1;
                    way_cache.put(way.id(), &tags)
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
    needed: &[i64],
    cache: &mut BinaryNodeCacheWriter,
    stats: &mut ExtractionStats,
) -> Result<()> {
    if needed.binary_search(&id).is_err() {
        return Ok(());
    }
    stats.nodes_extracted += 1;
    cache.put(&OsmNode { id, lat, lon, ele })
}

/// Samples the first qualifying ways and builds the frequency dictionary
/// from their whitelisted tags.
fn build_tag_dictionary(osm: &Path, needed_way_ids: &[i64]) -> Result<TagDictionary> {
    info!("building tag dictionary from a sample of ways");

    let mut sample: Vec<Tags> = Vec::new();
    let reader = ElementReader::from_path(osm)
        .with_context(|| format!("failed to open {}", osm.display()))?;
    reader.for_each(|element| {
        if sample.len() >= DICTIONARY_SAMPLE_SIZE {
            return;
        }
        if let Element::Way(way) = element {
            if needed_way_ids.binary_search(&way.id()).is_ok() {
                sample.push(whitelisted_tags(way.tags()));
            }
        }
    })?;

    Ok(TagDictionary::build(sample.iter()))
}

pub(crate) fn whitelisted_tags<'a>(tags: impl Iterator<Item = (&'a str, &'a str)>) -> Tags {
    tags.filter(|(k, _)| EXTRACT_TAG_WHITELIST.contains(k))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub(crate) fn convert_relation(relation: &osmpbf::Relation) -> OsmRelation {
    let tags: Tags = relation
        .tags()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let members = relation
        .members()
        .map(|member| {
            let kind = match member.member_type {
                osmpbf::RelMemberType::Node => MemberKind::Node,
                osmpbf::RelMemberType::Way => MemberKind::Way,
                osmpbf::RelMemberType::Relation => MemberKind::Relation,
            };
            Member::new(kind, member.member_id, member.role().unwrap_or(""))
        })
        .collect();
    OsmRelation::new(relation.id(), tags, members)
}
