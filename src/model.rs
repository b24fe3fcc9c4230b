//! Shared value types for OSM elements flowing through the pipeline.

use std::collections::BTreeMap;

/// Tag keys retained when extracting way tags from the source PBF.
pub const EXTRACT_TAG_WHITELIST: &[&str] = &[
    "highway", "name", "ref", "surface", "maxspeed", "oneway", "bicycle", "foot", "lanes",
    "cycleway", "sidewalk", "lit", "access",
];

/// Tag keys copied from the base way onto emitted segment ways.
pub const OUTPUT_TAG_WHITELIST: &[&str] = &[
    "highway", "name", "ref", "surface", "maxspeed", "oneway", "bicycle", "foot",
];

pub type Tags = BTreeMap<String, String>;

/// An OSM node with optional elevation. `ele` is NaN when unknown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OsmNode {
    pub id: i64,
    pub lat: f64,
    pub lon: f64,
    pub ele: f64,
}

impl OsmNode {
    pub fn new(id: i64, lat: f64, lon: f64) -> Self {
        Self {
            id,
            lat,
            lon,
            ele: f64::NAN,
        }
    }

    pub fn with_elevation(id: i64, lat: f64, lon: f64, ele: f64) -> Self {
        Self { id, lat, lon, ele }
    }

    pub fn has_elevation(&self) -> bool {
        !self.ele.is_nan()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Node,
    Way,
    Relation,
}

impl MemberKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberKind::Node => "NODE",
            MemberKind::Way => "WAY",
            MemberKind::Relation => "RELATION",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NODE" => Some(MemberKind::Node),
            "WAY" => Some(MemberKind::Way),
            "RELATION" => Some(MemberKind::Relation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub kind: MemberKind,
    pub ref_id: i64,
    pub role: String,
}

impl Member {
    pub fn new(kind: MemberKind, ref_id: i64, role: impl Into<String>) -> Self {
        Self {
            kind,
            ref_id,
            role: role.into(),
        }
    }
}

/// An OSM relation with tags and ordered members.
#[derive(Debug, Clone, PartialEq)]
pub struct OsmRelation {
    pub id: i64,
    pub tags: Tags,
    pub members: Vec<Member>,
}

impl OsmRelation {
    pub fn new(id: i64, tags: Tags, members: Vec<Member>) -> Self {
        Self { id, tags, members }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elevation_is_optional() {
        let plain = OsmNode::new(1, 50.0, 8.0);
        assert!(!plain.has_elevation());
        let with_ele = OsmNode::with_elevation(1, 50.0, 8.0, 120.5);
        assert!(with_ele.has_elevation());
    }

    #[test]
    fn member_kind_round_trip() {
        for kind in [MemberKind::Node, MemberKind::Way, MemberKind::Relation] {
            assert_eq!(MemberKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MemberKind::parse("BOGUS"), None);
    }
}
