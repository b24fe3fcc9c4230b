//! Extract stage: derives needed-ID sets from the segment store and pulls
//! the matching nodes, way tags, and route relations out of the source PBF
//! into on-disk caches.

pub mod id_sets;
pub mod simple;
pub mod streaming;

/// Counters reported by both extraction drivers.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractionStats {
    pub nodes_extracted: u64,
    pub ways_extracted: u64,
    pub relations_extracted: u64,
}

/// True for relations the pipeline preserves: `type=route` or
/// `type=route_master`.
pub(crate) fn is_route_relation<'a>(mut tags: impl Iterator<Item = (&'a str, &'a str)>) -> bool {
    tags.any(|(k, v)| k == "type" && (v == "route" || v == "route_master"))
}

/// Parses a node's `ele` tag; unparseable or missing elevation becomes NaN.
pub(crate) fn elevation_from_tags<'a>(
    mut tags: impl Iterator<Item = (&'a str, &'a str)>,
) -> f64 {
    tags.find(|(k, _)| *k == "ele")
        .and_then(|(_, v)| v.parse::<f64>().ok())
        .unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_relation_detection() {
        assert!(is_route_relation([("type", "route")].into_iter()));
        assert!(is_route_relation([("type", "route_master")].into_iter()));
        assert!(!is_route_relation([("type", "restriction")].into_iter()));
        assert!(!is_route_relation([("route", "bicycle")].into_iter()));
    }

    #[test]
    fn elevation_parsing() {
        assert_eq!(elevation_from_tags([("ele", "123.5")].into_iter()), 123.5);
        assert!(elevation_from_tags([("ele", "n/a")].into_iter()).is_nan());
        assert!(elevation_from_tags(std::iter::empty()).is_nan());
    }
}
