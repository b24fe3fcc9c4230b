//! Route-relation rewriter: expands each WAY member into the ordered list
//! of segment ways captured for that base way.

use anyhow::Result;
use log::{debug, info};
use std::collections::HashMap;
use std::path::Path;

use crate::model::{Member, MemberKind, OsmRelation};
use crate::store::{SegmentRecord, SegmentStoreReader};

pub struct RouteRelationRewriter {
    segments_by_way: HashMap<i64, Vec<SegmentRecord>>,
}

impl RouteRelationRewriter {
    /// Loads the segment store and groups records by base way, each group
    /// sorted by ascending segment index. Barrier-flagged records are
    /// dropped unless `include_barriers` is set.
    pub fn from_store(store_path: &Path, include_barriers: bool) -> Result<Self> {
        let reader = SegmentStoreReader::open(store_path)?;
        let mut segments_by_way: HashMap<i64, Vec<SegmentRecord>> = HashMap::new();

        for record in reader.records()? {
            let record = record?;
            if !include_barriers && record.is_barrier() {
                continue;
            }
            segments_by_way
                .entry(record.base_way_id)
                .or_default()
                .push(record);
        }

        for segments in segments_by_way.values_mut() {
            segments.sort_by_key(|record| record.seg_index);
        }

        info!(
            "loaded {} base ways with segments for relation rewriting",
            segments_by_way.len()
        );
        Ok(Self { segments_by_way })
    }

    pub fn base_way_count(&self) -> usize {
        self.segments_by_way.len()
    }

    /// Rewrites one relation. WAY members with captured segments are
    /// replaced by one member per segment (ref = edge id, role copied);
    /// unknown ways and NODE/RELATION members pass through unchanged. The
    /// relation id and tags are preserved.
    pub fn rewrite(&self, relation: &OsmRelation) -> OsmRelation {
        let mut members = Vec::with_capacity(relation.members.len());
        let mut ways_expanded = 0usize;

        for member in &relation.members {
            if member.kind != MemberKind::Way {
                members.push(member.clone());
                continue;
            }
            match self.segments_by_way.get(&member.ref_id) {
                Some(segments) if !segments.is_empty() => {
                    for segment in segments {
                        members.push(Member::new(
                            MemberKind::Way,
                            segment.edge_id as i64,
                            member.role.clone(),
                        ));
                    }
                    ways_expanded += 1;
                }
                // The base way was never processed by the producer.
                _ => members.push(member.clone()),
            }
        }

        if ways_expanded > 0 {
            debug!(
                "relation {}: expanded {} way members into {} segment members",
                relation.id,
                ways_expanded,
                members.len()
            );
        }

        OsmRelation::new(relation.id, relation.tags.clone(), members)
    }

    pub fn rewrite_all(&self, relations: &[OsmRelation]) -> Vec<OsmRelation> {
        info!("rewriting {} route relations", relations.len());
        relations.iter().map(|r| self.rewrite(r)).collect()
    }
}
