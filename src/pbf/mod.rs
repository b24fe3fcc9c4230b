//! Derived-PBF encoding: prost wire messages and a blob-framing writer that
//! enforces the nodes, ways, relations section order.

pub mod proto;
mod writer;

pub use writer::PbfWriter;
