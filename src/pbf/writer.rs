//! Sequential PBF writer.
//!
//! Elements are buffered into primitive blocks of at most 8000 entities,
//! each with its own string table, zlib-compressed and framed as
//! `[len:u32 BE][BlobHeader][Blob]`. The downstream schema requires all
//! nodes before all ways before all relations; the writer tracks the
//! current section and rejects out-of-order writes.
//!
//! Every entity carries synthetic metadata (version 1, changeset 1, user
//! "anonymous", timestamp = writer creation time).

use anyhow::{bail, Context, Result};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use prost::Message;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use super::proto;
use crate::model::{Member, MemberKind};

const GRANULARITY: i32 = 100; // nanodegrees per coordinate unit
const DATE_GRANULARITY: i32 = 1000; // millis per timestamp unit
const BLOCK_ELEMENTS: usize = 8000;
const SYNTHETIC_USER: &str = "anonymous";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Section {
    Nodes,
    Ways,
    Relations,
    Finished,
}

struct StringTableBuilder {
    indices: HashMap<String, u32>,
    table: Vec<Vec<u8>>,
}

impl StringTableBuilder {
    fn new() -> Self {
        // Index 0 is reserved for the empty string.
        Self {
            indices: HashMap::new(),
            table: vec![Vec::new()],
        }
    }

    fn intern(&mut self, s: &str) -> u32 {
        if s.is_empty() {
            return 0;
        }
        if let Some(&index) = self.indices.get(s) {
            return index;
        }
        let index = self.table.len() as u32;
        self.table.push(s.as_bytes().to_vec());
        self.indices.insert(s.to_string(), index);
        index
    }

    fn take(&mut self) -> proto::StringTable {
        let table = std::mem::replace(&mut self.table, vec![Vec::new()]);
        self.indices.clear();
        proto::StringTable { s: table }
    }
}

pub struct PbfWriter<W: Write> {
    out: W,
    section: Section,
    strings: StringTableBuilder,
    nodes: Vec<proto::Node>,
    ways: Vec<proto::Way>,
    relations: Vec<proto::Relation>,
    timestamp: i64,
}

impl PbfWriter<BufWriter<File>> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        Self::new(BufWriter::new(file))
    }
}

impl<W: Write> PbfWriter<W> {
    pub fn new(out: W) -> Result<Self> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let mut writer = Self {
            out,
            section: Section::Nodes,
            strings: StringTableBuilder::new(),
            nodes: Vec::new(),
            ways: Vec::new(),
            relations: Vec::new(),
            timestamp,
        };
        writer.write_file_header()?;
        Ok(writer)
    }

    fn write_file_header(&mut self) -> Result<()> {
        let header = proto::HeaderBlock {
            bbox: None,
            required_features: vec!["OsmSchema-V0.6".to_string()],
            optional_features: Vec::new(),
            writingprogram: Some(concat!("waysplit ", env!("CARGO_PKG_VERSION")).to_string()),
            source: None,
        };
        self.write_blob("OSMHeader", &header.encode_to_vec())
    }

    pub fn write_node(&mut self, id: i64, lat: f64, lon: f64, tags: &[(String, String)]) -> Result<()> {
        if self.section != Section::Nodes {
            bail!("nodes must be written before ways and relations");
        }

        let (keys, vals) = self.intern_tags(tags);
        let info = self.synthetic_info();
        self.nodes.push(proto::Node {
            id,
            keys,
            vals,
            info: Some(info),
            lat: to_coord_units(lat),
            lon: to_coord_units(lon),
        });

        if self.nodes.len() >= BLOCK_ELEMENTS {
            self.flush_block()?;
        }
        Ok(())
    }

    pub fn write_way(&mut self, id: i64, refs: &[i64], tags: &[(String, String)]) -> Result<()> {
        match self.section {
            Section::Nodes => self.advance(Section::Ways)?,
            Section::Ways => {}
            _ => bail!("ways must be written after nodes and before relations"),
        }

        let (keys, vals) = self.intern_tags(tags);
        let info = self.synthetic_info();
        self.ways.push(proto::Way {
            id,
            keys,
            vals,
            info: Some(info),
            refs: delta_encode(refs),
        });

        if self.ways.len() >= BLOCK_ELEMENTS {
            self.flush_block()?;
        }
        Ok(())
    }

    pub fn write_relation(
        &mut self,
        id: i64,
        tags: &[(String, String)],
        members: &[Member],
    ) -> Result<()> {
        match self.section {
            Section::Nodes | Section::Ways => self.advance(Section::Relations)?,
            Section::Relations => {}
            Section::Finished => bail!("writer is finished"),
        }

        let (keys, vals) = self.intern_tags(tags);
        let info = self.synthetic_info();

        let roles_sid = members
            .iter()
            .map(|m| self.strings.intern(&m.role) as i32)
            .collect();
        let memids: Vec<i64> = members.iter().map(|m| m.ref_id).collect();
        let types = members
            .iter()
            .map(|m| match m.kind {
                MemberKind::Node => proto::MemberType::Node as i32,
                MemberKind::Way => proto::MemberType::Way as i32,
                MemberKind::Relation => proto::MemberType::Relation as i32,
            })
            .collect();

        self.relations.push(proto::Relation {
            id,
            keys,
            vals,
            info: Some(info),
            roles_sid,
            memids: delta_encode(&memids),
            types,
        });

        if self.relations.len() >= BLOCK_ELEMENTS {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Flushes buffered elements and the underlying stream. Must be called;
    /// dropping an unfinished writer loses the tail of the file.
    pub fn finish(mut self) -> Result<()> {
        self.flush_block()?;
        self.section = Section::Finished;
        self.out.flush()?;
        Ok(())
    }

    fn advance(&mut self, to: Section) -> Result<()> {
        self.flush_block()?;
        self.section = to;
        Ok(())
    }

    fn intern_tags(&mut self, tags: &[(String, String)]) -> (Vec<u32>, Vec<u32>) {
        let keys = tags.iter().map(|(k, _)| self.strings.intern(k)).collect();
        let vals = tags.iter().map(|(_, v)| self.strings.intern(v)).collect();
        (keys, vals)
    }

    fn synthetic_info(&mut self) -> proto::Info {
        proto::Info {
            version: Some(1),
            timestamp: Some(self.timestamp),
            changeset: Some(1),
            uid: Some(0),
            user_sid: Some(self.strings.intern(SYNTHETIC_USER)),
        }
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.nodes.is_empty() && self.ways.is_empty() && self.relations.is_empty() {
            return Ok(());
        }

        let group = proto::PrimitiveGroup {
            nodes: std::mem::take(&mut self.nodes),
            ways: std::mem::take(&mut self.ways),
            relations: std::mem::take(&mut self.relations),
        };
        let block = proto::PrimitiveBlock {
            stringtable: Some(self.strings.take()),
            primitivegroup: vec![group],
            granularity: Some(GRANULARITY),
            date_granularity: Some(DATE_GRANULARITY),
            lat_offset: Some(0),
            lon_offset: Some(0),
        };

        self.write_blob("OSMData", &block.encode_to_vec())
    }

    fn write_blob(&mut self, blob_type: &str, payload: &[u8]) -> Result<()> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(payload)?;
        let compressed = encoder.finish()?;

        let blob = proto::Blob {
            raw: None,
            raw_size: Some(payload.len() as i32),
            zlib_data: Some(compressed),
        };
        let blob_bytes = blob.encode_to_vec();

        let header = proto::BlobHeader {
            r#type: blob_type.to_string(),
            indexdata: None,
            datasize: blob_bytes.len() as i32,
        };
        let header_bytes = header.encode_to_vec();

        self.out.write_all(&(header_bytes.len() as u32).to_be_bytes())?;
        self.out.write_all(&header_bytes)?;
        self.out.write_all(&blob_bytes)?;
        Ok(())
    }
}

fn to_coord_units(degrees: f64) -> i64 {
    (degrees * 1e9 / GRANULARITY as f64).round() as i64
}

fn delta_encode(values: &[i64]) -> Vec<i64> {
    let mut deltas = Vec::with_capacity(values.len());
    let mut last = 0i64;
    for &value in values {
        deltas.push(value - last);
        last = value;
    }
    deltas
}
