//! Waysplit: turn an OSM PBF extract into a segmented derived PBF.
//!
//! Every routing-graph edge produced by the segment producer becomes a
//! first-class OSM way in the output, and every route relation is rewritten
//! so its members reference those segment ways in base-way order.
//!
//! Three batch stages, chained by on-disk artifacts:
//! - capture: drive the segment producer over the input PBF and append one
//!   record per segment to the segment store (`*.rseg`)
//! - extract: derive the needed node/way id sets from the store, then pull
//!   matching nodes, way tags, and route relations into cache files
//! - assemble: rewrite route relations against the store and emit the
//!   derived PBF (nodes, segment ways, rewritten relations)
//!
//! Each stage is independently resumable; re-run a failed stage with
//! `--force`.

pub mod assemble;
pub mod cache;
pub mod capture;
pub mod extract;
pub mod model;
pub mod pbf;
pub mod producer;
pub mod rewrite;
pub mod store;

pub use model::{Member, MemberKind, OsmNode, OsmRelation};
pub use store::{SegmentRecord, SegmentStoreReader, SegmentStoreWriter};
