//! End-to-end pipeline test: build a small source PBF, capture segments,
//! extract caches, and assemble the derived PBF, then read the result back.

use std::collections::BTreeMap;
use std::path::Path;

use osmpbf::{Element, ElementReader};
use tempfile::tempdir;

use waysplit::assemble::build_derived_pbf;
use waysplit::cache::{
    BinaryNodeCache, CompressedWayTagCache, NodeLookup, RelationCache, TextNodeCache,
    TextWayTagCache, WayTagLookup,
};
use waysplit::capture::SegmentCapture;
use waysplit::extract;
use waysplit::model::{Member, MemberKind};
use waysplit::pbf::PbfWriter;
use waysplit::producer::split_ways;
use waysplit::rewrite::RouteRelationRewriter;
use waysplit::store::{SegmentStoreReader, SegmentStoreWriter};

fn tag(k: &str, v: &str) -> (String, String) {
    (k.to_string(), v.to_string())
}

/// Two connected highway ways sharing node 3, with a barrier gate at node 5,
/// and one bicycle route relation over both ways.
fn write_source_pbf(path: &Path) {
    let mut writer = PbfWriter::create(path).unwrap();

    writer.write_node(1, 50.10, 8.10, &[]).unwrap();
    writer.write_node(2, 50.11, 8.11, &[]).unwrap();
    writer.write_node(3, 50.12, 8.12, &[]).unwrap();
    writer.write_node(4, 50.13, 8.13, &[tag("ele", "231.5")]).unwrap();
    writer.write_node(5, 50.14, 8.14, &[tag("barrier", "gate")]).unwrap();
    writer.write_node(6, 50.15, 8.15, &[]).unwrap();

    writer
        .write_way(
            100,
            &[1, 2, 3],
            &[
                tag("highway", "residential"),
                tag("name", "Hauptstrasse"),
                tag("building", "no"),
            ],
        )
        .unwrap();
    writer
        .write_way(
            200,
            &[3, 4, 5, 6],
            &[tag("highway", "path"), tag("surface", "gravel")],
        )
        .unwrap();

    writer
        .write_relation(
            500,
            &[tag("type", "route"), tag("route", "bicycle")],
            &[
                Member::new(MemberKind::Way, 100, ""),
                Member::new(MemberKind::Node, 2, "stop"),
                Member::new(MemberKind::Way, 200, "forward"),
            ],
        )
        .unwrap();

    writer.finish().unwrap();
}

fn capture(osm: &Path, store: &Path) -> u64 {
    let writer = SegmentStoreWriter::create(store).unwrap();
    let mut capture = SegmentCapture::new(writer);
    split_ways(osm, &mut capture).unwrap();
    capture.finish().unwrap()
}

#[derive(Debug, Default)]
struct DerivedContent {
    node_ids: Vec<i64>,
    ways: Vec<(i64, Vec<i64>, BTreeMap<String, String>)>,
    relations: Vec<(i64, Vec<(String, i64, String)>)>,
    order: Vec<char>,
}

fn read_derived(path: &Path) -> DerivedContent {
    let mut content = DerivedContent::default();
    let reader = ElementReader::from_path(path).unwrap();
    reader
        .for_each(|element| match element {
            Element::Node(node) => {
                content.node_ids.push(node.id());
                content.order.push('n');
            }
            Element::DenseNode(node) => {
                content.node_ids.push(node.id());
                content.order.push('n');
            }
            Element::Way(way) => {
                let tags = way
                    .tags()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
                content.ways.push((way.id(), way.refs().collect(), tags));
                content.order.push('w');
            }
            Element::Relation(relation) => {
                let members = relation
                    .members()
                    .map(|m| {
                        let kind = match m.member_type {
                            osmpbf::RelMemberType::Node => "NODE",
                            osmpbf::RelMemberType::Way => "WAY",
                            osmpbf::RelMemberType::Relation => "RELATION",
                        };
                        (
                            kind.to_string(),
                            m.member_id,
                            m.role().unwrap_or("").to_string(),
                        )
                    })
                    .collect();
                content.relations.push((relation.id(), members));
                content.order.push('r');
            }
        })
        .unwrap();
    content
}

#[test]
fn capture_splits_at_junctions_and_barriers() {
    let dir = tempdir().unwrap();
    let osm = dir.path().join("source.osm.pbf");
    let store = dir.path().join("segments.rseg");
    write_source_pbf(&osm);

    assert_eq!(capture(&osm, &store), 4);

    let reader = SegmentStoreReader::open(&store).unwrap();
    let records: Vec<_> = reader
        .records()
        .unwrap()
        .collect::<anyhow::Result<Vec<_>>>()
        .unwrap();

    // Way 100 is one segment; way 200 splits at the barrier node 5.
    assert_eq!(records[0].base_way_id, 100);
    assert_eq!(records[0].node_refs, vec![1, 2, 3]);
    assert_eq!(records[1].node_refs, vec![3, 4, 5]);
    assert!(records[2].is_barrier());
    assert_eq!(records[2].node_refs, vec![5, 5]);
    assert_eq!(records[3].node_refs, vec![5, 6]);
    let edge_ids: Vec<u32> = records.iter().map(|r| r.edge_id).collect();
    assert_eq!(edge_ids, vec![0, 1, 2, 3]);
}

#[test]
fn streaming_extraction_fills_binary_caches() {
    let dir = tempdir().unwrap();
    let osm = dir.path().join("source.osm.pbf");
    let store = dir.path().join("segments.rseg");
    let cache_dir = dir.path().join("cache");
    write_source_pbf(&osm);
    capture(&osm, &store);

    let stats = extract::streaming::extract(&osm, &store, &cache_dir, true).unwrap();
    assert_eq!(stats.nodes_extracted, 6);
    assert_eq!(stats.ways_extracted, 2);
    assert_eq!(stats.relations_extracted, 1);

    let nodes = BinaryNodeCache::open(cache_dir.join("nodes.bin")).unwrap();
    assert_eq!(nodes.len(), 6);
    let node4 = nodes.get(4).unwrap();
    assert_eq!(node4.ele, 231.5);
    assert!(!nodes.get(1).unwrap().has_elevation());

    let ways = CompressedWayTagCache::open(cache_dir.join("way_tags.bin")).unwrap();
    assert_eq!(ways.len(), 2);
    let way100 = ways.get(100).unwrap();
    assert_eq!(way100.get("highway").map(String::as_str), Some("residential"));
    // Non-whitelisted keys are dropped at extract time.
    assert!(!way100.contains_key("building"));

    let relations = RelationCache::load(cache_dir.join("relations.txt")).unwrap();
    assert_eq!(relations.len(), 1);
    assert_eq!(relations.relations()[0].id, 500);
    assert_eq!(relations.relations()[0].members.len(), 3);
}

#[test]
fn full_pipeline_binary_caches() {
    let dir = tempdir().unwrap();
    let osm = dir.path().join("source.osm.pbf");
    let store = dir.path().join("segments.rseg");
    let cache_dir = dir.path().join("cache");
    let derived = dir.path().join("derived.osm.pbf");
    write_source_pbf(&osm);
    capture(&osm, &store);
    extract::streaming::extract(&osm, &store, &cache_dir, false).unwrap();

    let nodes = BinaryNodeCache::open(cache_dir.join("nodes.bin")).unwrap();
    let way_tags = CompressedWayTagCache::open(cache_dir.join("way_tags.bin")).unwrap();
    let relations = RelationCache::load(cache_dir.join("relations.txt")).unwrap();

    let rewriter = RouteRelationRewriter::from_store(&store, false).unwrap();
    let rewritten = rewriter.rewrite_all(relations.relations());

    let stats =
        build_derived_pbf(&store, &nodes, &way_tags, &rewritten, false, &derived).unwrap();
    assert_eq!(stats.nodes_written, 6);
    assert_eq!(stats.ways_written, 3); // barrier segment excluded
    assert_eq!(stats.relations_written, 1);

    let content = read_derived(&derived);

    // Sections in order, nodes ascending.
    assert_eq!(content.order, "nnnnnnwwwr".chars().collect::<Vec<_>>());
    assert_eq!(content.node_ids, vec![1, 2, 3, 4, 5, 6]);

    // Ways carry the edge id, the original node refs, base_id and
    // whitelisted base tags.
    let (way_id, refs, tags) = &content.ways[0];
    assert_eq!(*way_id, 0);
    assert_eq!(refs, &vec![1, 2, 3]);
    assert_eq!(tags.get("base_id").map(String::as_str), Some("100"));
    assert_eq!(tags.get("highway").map(String::as_str), Some("residential"));
    assert_eq!(tags.get("name").map(String::as_str), Some("Hauptstrasse"));
    assert!(!tags.contains_key("building"));

    let way_ids: Vec<i64> = content.ways.iter().map(|(id, _, _)| *id).collect();
    assert_eq!(way_ids, vec![0, 1, 3]);

    // The relation references segment ways in base-way order, with roles
    // copied and non-way members preserved in place.
    let (relation_id, members) = &content.relations[0];
    assert_eq!(*relation_id, 500);
    assert_eq!(
        members,
        &vec![
            ("WAY".to_string(), 0, "".to_string()),
            ("NODE".to_string(), 2, "stop".to_string()),
            ("WAY".to_string(), 1, "forward".to_string()),
            ("WAY".to_string(), 3, "forward".to_string()),
        ]
    );
}

#[test]
fn including_barrier_edges_yields_a_superset() {
    let dir = tempdir().unwrap();
    let osm = dir.path().join("source.osm.pbf");
    let store = dir.path().join("segments.rseg");
    let cache_dir = dir.path().join("cache");
    write_source_pbf(&osm);
    capture(&osm, &store);
    extract::streaming::extract(&osm, &store, &cache_dir, false).unwrap();

    let nodes = BinaryNodeCache::open(cache_dir.join("nodes.bin")).unwrap();
    let way_tags = CompressedWayTagCache::open(cache_dir.join("way_tags.bin")).unwrap();
    let relations = RelationCache::load(cache_dir.join("relations.txt")).unwrap();

    let with_path = dir.path().join("with.osm.pbf");
    let rewriter = RouteRelationRewriter::from_store(&store, true).unwrap();
    let rewritten = rewriter.rewrite_all(relations.relations());
    let with_stats =
        build_derived_pbf(&store, &nodes, &way_tags, &rewritten, true, &with_path).unwrap();
    assert_eq!(with_stats.ways_written, 4);

    let content = read_derived(&with_path);
    let way_ids: Vec<i64> = content.ways.iter().map(|(id, _, _)| *id).collect();
    assert_eq!(way_ids, vec![0, 1, 2, 3]);
    // The barrier segment now shows up as a relation member too.
    assert_eq!(content.relations[0].1.len(), 5);
}

#[test]
fn full_pipeline_text_caches() {
    let dir = tempdir().unwrap();
    let osm = dir.path().join("source.osm.pbf");
    let store = dir.path().join("segments.rseg");
    let cache_dir = dir.path().join("cache");
    let derived = dir.path().join("derived.osm.pbf");
    write_source_pbf(&osm);
    capture(&osm, &store);

    let stats = extract::simple::extract(&osm, &store, &cache_dir).unwrap();
    assert_eq!(stats.nodes_extracted, 6);
    assert!(cache_dir.join("nodes.txt").exists());
    assert!(cache_dir.join("way_tags.txt").exists());

    let nodes = TextNodeCache::load(cache_dir.join("nodes.txt")).unwrap();
    let way_tags = TextWayTagCache::load(cache_dir.join("way_tags.txt")).unwrap();
    let relations = RelationCache::load(cache_dir.join("relations.txt")).unwrap();

    let rewriter = RouteRelationRewriter::from_store(&store, false).unwrap();
    let rewritten = rewriter.rewrite_all(relations.relations());
    let stats =
        build_derived_pbf(&store, &nodes, &way_tags, &rewritten, false, &derived).unwrap();
    assert_eq!(stats.nodes_written, 6);
    assert_eq!(stats.ways_written, 3);

    let content = read_derived(&derived);
    assert_eq!(content.node_ids, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(content.relations[0].1.len(), 4);
}
