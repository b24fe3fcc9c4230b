//! Legacy text node cache: one `id,lat,lon,ele` line per node, empty `ele`
//! when unknown. Kept for diff-friendly debugging on small inputs.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use super::NodeLookup;
use crate::model::OsmNode;

pub struct TextNodeCacheWriter {
    out: BufWriter<File>,
    count: u32,
}

impl TextNodeCacheWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let out = BufWriter::new(
            File::create(path)
                .with_context(|| format!("failed to create node cache {}", path.display()))?,
        );
        Ok(Self { out, count: 0 })
    }

    pub fn put(&mut self, node: &OsmNode) -> Result<()> {
        if node.has_elevation() {
            writeln!(self.out, "{},{},{},{}", node.id, node.lat, node.lon, node.ele)?;
        } else {
            writeln!(self.out, "{},{},{},", node.id, node.lat, node.lon)?;
        }
        self.count += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<u32> {
        self.out.flush()?;
        Ok(self.count)
    }
}

pub struct TextNodeCache {
    nodes: HashMap<i64, OsmNode>,
}

impl TextNodeCache {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(
            File::open(path)
                .with_context(|| format!("failed to open node cache {}", path.display()))?,
        );

        let mut nodes = HashMap::new();
        for line in reader.lines() {
            let line = line?;
            let mut parts = line.split(',');
            let (id, lat, lon) = match (parts.next(), parts.next(), parts.next()) {
                (Some(id), Some(lat), Some(lon)) => (id, lat, lon),
                _ => continue,
            };
            let id: i64 = id
                .parse()
                .with_context(|| format!("malformed node cache line: {line}"))?;
            let lat: f64 = lat
                .parse()
                .with_context(|| format!("malformed node cache line: {line}"))?;
            let lon: f64 = lon
                .parse()
                .with_context(|| format!("malformed node cache line: {line}"))?;
            let ele = match parts.next() {
                Some(ele) if !ele.is_empty() => ele
                    .parse()
                    .with_context(|| format!("malformed node cache line: {line}"))?,
                _ => f64::NAN,
            };
            nodes.insert(id, OsmNode { id, lat, lon, ele });
        }

        Ok(Self { nodes })
    }

    pub fn get(&self, id: i64) -> Option<OsmNode> {
        self.nodes.get(&id).copied()
    }
}

impl NodeLookup for TextNodeCache {
    fn node(&self, id: i64) -> Option<OsmNode> {
        self.get(id)
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }
}
