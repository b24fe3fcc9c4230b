use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{SegmentRecord, HEADER_SIZE, MAGIC, VERSION};

/// Reads an RSEG file, either as a single-pass record stream or - when
/// opened indexed - via point lookups by edge id.
#[derive(Debug)]
pub struct SegmentStoreReader {
    path: PathBuf,
    record_count: u32,
    // Present only for indexed readers. The mutex serializes the seek+read
    // pair so point lookups are safe from concurrent callers.
    index: Option<HashMap<u32, u64>>,
    file: Option<Mutex<File>>,
}

impl SegmentStoreReader {
    /// Opens for streaming access only.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_inner(path.as_ref(), false)
    }

    /// Opens and eagerly scans the file once to build an edge-id index for
    /// point lookups.
    pub fn open_indexed<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_inner(path.as_ref(), true)
    }

    fn open_inner(path: &Path, indexed: bool) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open segment store {}", path.display()))?;
        let mut reader = BufReader::new(file);
        let record_count = read_header(&mut reader)
            .with_context(|| format!("invalid segment store {}", path.display()))?;

        let mut store = Self {
            path: path.to_path_buf(),
            record_count,
            index: None,
            file: None,
        };

        if indexed {
            let mut index = HashMap::with_capacity(record_count as usize);
            let mut offset = HEADER_SIZE;
            for _ in 0..record_count {
                let record = read_record(&mut reader)
                    .with_context(|| format!("truncated segment store {}", path.display()))?;
                index.insert(record.edge_id, offset);
                offset += record.encoded_len();
            }
            store.index = Some(index);
            store.file = Some(Mutex::new(File::open(path)?));
        }

        Ok(store)
    }

    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    /// Returns a lazy single-pass iterator over all records. Each call opens
    /// a fresh handle; the handle is released once the iterator is exhausted
    /// or dropped.
    pub fn records(&self) -> Result<Records> {
        let file = File::open(&self.path)
            .with_context(|| format!("failed to open segment store {}", self.path.display()))?;
        let mut reader = BufReader::with_capacity(1 << 20, file);
        read_header(&mut reader)?;
        Ok(Records {
            reader: Some(reader),
            remaining: self.record_count,
        })
    }

    /// Point lookup by edge id. Requires an indexed reader.
    pub fn get_by_edge_id(&self, edge_id: u32) -> Result<Option<SegmentRecord>> {
        let index = match self.index.as_ref() {
            Some(index) => index,
            None => bail!("random access not enabled; open the store with open_indexed"),
        };
        let offset = match index.get(&edge_id) {
            Some(offset) => *offset,
            None => return Ok(None),
        };

        let file = self.file.as_ref().expect("indexed reader keeps a handle");
        let mut guard = file.lock().unwrap();
        guard.seek(SeekFrom::Start(offset))?;
        let record = read_record(&mut *guard)?;
        Ok(Some(record))
    }
}

/// Single-pass iterator over segment records. Yields an error and stops if
/// the file ends mid-record.
pub struct Records {
    reader: Option<BufReader<File>>,
    remaining: u32,
}

impl Iterator for Records {
    type Item = Result<SegmentRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            self.reader = None;
            return None;
        }
        let reader = self.reader.as_mut()?;
        match read_record(reader) {
            Ok(record) => {
                self.remaining -= 1;
                Some(Ok(record))
            }
            Err(err) => {
                self.remaining = 0;
                self.reader = None;
                Some(Err(err.context("truncated segment record")))
            }
        }
    }
}

fn read_header<R: Read>(reader: &mut R) -> Result<u32> {
    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .context("failed to read segment store header")?;
    if magic != MAGIC {
        bail!("bad magic {:02x?}, expected RSEG", magic);
    }

    let version = read_u8(reader)?;
    if version != VERSION {
        bail!("unsupported segment store version {version}, expected {VERSION}");
    }

    read_u32(reader)
}

fn read_record<R: Read>(reader: &mut R) -> Result<SegmentRecord> {
    let edge_id = read_u32(reader)?;
    let base_way_id = read_i64(reader)?;
    let seg_index = read_u32(reader)?;
    let flags = read_u8(reader)?;
    let node_count = read_u32(reader)? as usize;

    let mut node_refs = Vec::with_capacity(node_count.min(1 << 16));
    for _ in 0..node_count {
        node_refs.push(read_i64(reader)?);
    }

    Ok(SegmentRecord {
        edge_id,
        base_way_id,
        seg_index,
        flags,
        node_refs,
    })
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_i64<R: Read>(reader: &mut R) -> Result<i64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(i64::from_be_bytes(buf))
}
