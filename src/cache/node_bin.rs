//! Binary node cache - RNOD format v1
//!
//! Random-access map from node id to (lat, lon, ele), backed by one
//! memory-mapped file.
//!
//! Layout (big-endian):
//!   header (9 bytes):  "RNOD" | version u8 | node_count u32
//!   index section:     node_count * (id i64 | data_offset u32)
//!   data section:      node_count * (lat f64 | lon f64 | ele f64)
//!
//! Missing elevation is stored as NaN. The writer streams index and data to
//! two temp files and concatenates them behind the header on finish, so a
//! single sequential PBF pass can feed it without buffering.

use anyhow::{bail, Context, Result};
use log::info;
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::NodeLookup;
use crate::model::OsmNode;

const MAGIC: [u8; 4] = *b"RNOD";
const VERSION: u8 = 1;
const HEADER_SIZE: usize = 9;
const INDEX_ENTRY_SIZE: usize = 12;
const RECORD_SIZE: usize = 24;

pub struct BinaryNodeCacheWriter {
    final_path: PathBuf,
    index_path: PathBuf,
    data_path: PathBuf,
    index: Option<BufWriter<File>>,
    data: Option<BufWriter<File>>,
    count: u32,
}

impl BinaryNodeCacheWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let final_path = path.as_ref().to_path_buf();
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let index_path = tmp_sibling(&final_path, "idx");
        let data_path = tmp_sibling(&final_path, "dat");
        let index = BufWriter::with_capacity(1 << 20, File::create(&index_path)?);
        let data = BufWriter::with_capacity(1 << 20, File::create(&data_path)?);

        Ok(Self {
            final_path,
            index_path,
            data_path,
            index: Some(index),
            data: Some(data),
            count: 0,
        })
    }

    pub fn put(&mut self, node: &OsmNode) -> Result<()> {
        let (index, data) = match (self.index.as_mut(), self.data.as_mut()) {
            (Some(index), Some(data)) => (index, data),
            _ => bail!("node cache writer is finished"),
        };
        let offset = self.count as u64 * RECORD_SIZE as u64;
        if offset > u32::MAX as u64 {
            bail!("node cache data section exceeds the u32 offset range");
        }
        index.write_all(&node.id.to_be_bytes())?;
        index.write_all(&(offset as u32).to_be_bytes())?;

        data.write_all(&node.lat.to_be_bytes())?;
        data.write_all(&node.lon.to_be_bytes())?;
        data.write_all(&node.ele.to_be_bytes())?;

        self.count += 1;
        if self.count % 1_000_000 == 0 {
            info!("node cache: written {} nodes", self.count);
        }
        Ok(())
    }

    /// Concatenates header + index + data into the final file and removes
    /// the temp files. Returns the node count.
    pub fn finish(mut self) -> Result<u32> {
        let mut index = self.index.take().context("node cache writer already finished")?;
        let mut data = self.data.take().context("node cache writer already finished")?;
        index.flush()?;
        data.flush()?;
        drop(index);
        drop(data);

        let mut out = BufWriter::new(File::create(&self.final_path).with_context(|| {
            format!("failed to create node cache {}", self.final_path.display())
        })?);
        out.write_all(&MAGIC)?;
        out.write_all(&[VERSION])?;
        out.write_all(&self.count.to_be_bytes())?;
        io::copy(&mut File::open(&self.index_path)?, &mut out)?;
        io::copy(&mut File::open(&self.data_path)?, &mut out)?;
        out.flush()?;

        info!("node cache complete: {} nodes", self.count);
        Ok(self.count)
    }
}

impl Drop for BinaryNodeCacheWriter {
    // Temp files are removed whether finish ran or the stage failed.
    fn drop(&mut self) {
        self.index.take();
        self.data.take();
        std::fs::remove_file(&self.index_path).ok();
        std::fs::remove_file(&self.data_path).ok();
    }
}

fn tmp_sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{suffix}.tmp"));
    path.with_file_name(name)
}

/// Memory-mapped reader. Heap holds only the id-to-offset map; the 24-byte
/// coordinate records stay in the page cache.
pub struct BinaryNodeCache {
    map: Mmap,
    index: HashMap<i64, u32>,
    data_base: usize,
}

impl BinaryNodeCache {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open node cache {}", path.display()))?;
        let map = unsafe { Mmap::map(&file)? };

        if map.len() < HEADER_SIZE {
            bail!("node cache {} too short for header", path.display());
        }
        if map[0..4] != MAGIC {
            bail!("node cache {}: bad magic", path.display());
        }
        if map[4] != VERSION {
            bail!(
                "node cache {}: unsupported version {}",
                path.display(),
                map[4]
            );
        }
        let count = u32::from_be_bytes(map[5..9].try_into().unwrap()) as usize;

        let index_size = count * INDEX_ENTRY_SIZE;
        let data_base = HEADER_SIZE + index_size;
        if map.len() < data_base + count * RECORD_SIZE {
            bail!("node cache {}: truncated", path.display());
        }

        let mut index = HashMap::with_capacity(count);
        for i in 0..count {
            let entry = HEADER_SIZE + i * INDEX_ENTRY_SIZE;
            let id = i64::from_be_bytes(map[entry..entry + 8].try_into().unwrap());
            let offset = u32::from_be_bytes(map[entry + 8..entry + 12].try_into().unwrap());
            index.insert(id, offset);
        }

        info!("loaded binary node cache: {} nodes", count);
        Ok(Self {
            map,
            index,
            data_base,
        })
    }

    pub fn get(&self, id: i64) -> Option<OsmNode> {
        let offset = self.data_base + *self.index.get(&id)? as usize;
        let lat = f64::from_be_bytes(self.map[offset..offset + 8].try_into().unwrap());
        let lon = f64::from_be_bytes(self.map[offset + 8..offset + 16].try_into().unwrap());
        let ele = f64::from_be_bytes(self.map[offset + 16..offset + 24].try_into().unwrap());
        Some(OsmNode { id, lat, lon, ele })
    }
}

impl NodeLookup for BinaryNodeCache {
    fn node(&self, id: i64) -> Option<OsmNode> {
        self.get(id)
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_preserves_bits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes.bin");

        let nodes = vec![
            OsmNode::with_elevation(1, 50.123456789, 8.987654321, 120.25),
            OsmNode::new(2, -33.5, 151.25),
            OsmNode::with_elevation(9_000_000_000, 0.0, -0.0, -12.5),
        ];

        let mut writer = BinaryNodeCacheWriter::create(&path).unwrap();
        for node in &nodes {
            writer.put(node).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 3);

        // Temp files are gone.
        assert!(!tmp_sibling(&path, "idx").exists());
        assert!(!tmp_sibling(&path, "dat").exists());

        let cache = BinaryNodeCache::open(&path).unwrap();
        assert_eq!(cache.len(), 3);
        for node in &nodes {
            let read = cache.get(node.id).unwrap();
            assert_eq!(read.lat.to_bits(), node.lat.to_bits());
            assert_eq!(read.lon.to_bits(), node.lon.to_bits());
            assert_eq!(read.ele.to_bits(), node.ele.to_bits());
        }
        assert!(!cache.get(2).unwrap().has_elevation());
        assert!(cache.get(12345).is_none());
    }

    #[test]
    fn empty_cache_is_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes.bin");
        let writer = BinaryNodeCacheWriter::create(&path).unwrap();
        assert_eq!(writer.finish().unwrap(), 0);

        let cache = BinaryNodeCache::open(&path).unwrap();
        assert!(cache.is_empty());
        assert!(cache.get(1).is_none());
    }

    #[test]
    fn rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nodes.bin");
        std::fs::write(&path, b"not a node cache").unwrap();
        assert!(BinaryNodeCache::open(&path).is_err());
    }
}
