//! Compressed way-tag cache - RWAY format v1
//!
//! OSM tag distributions are heavily skewed, so common `key=value` pairs are
//! replaced by a 16-bit index into a frequency-ordered dictionary; everything
//! else is stored inline.
//!
//! Layout (big-endian):
//!   header (11 bytes): "RWAY" | version u8 | way_count u32 | dict_size u16
//!   dictionary:        dict_size NUL-terminated UTF-8 "key=value" strings
//!   index section:     way_count * (way_id i64 | data_offset u32)
//!   data section:      per way: tag_count u8, then per tag either
//!                        0x00 | dict_index u16
//!                      or
//!                        0x01 | key_len u16 | key | val_len u16 | val

use anyhow::{bail, Context, Result};
use log::info;
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::WayTagLookup;
use crate::model::Tags;

const MAGIC: [u8; 4] = *b"RWAY";
const VERSION: u8 = 1;
const HEADER_SIZE: usize = 11;
const INDEX_ENTRY_SIZE: usize = 12;
const TYPE_DICT_REF: u8 = 0;
const TYPE_CUSTOM: u8 = 1;
const MAX_DICT_SIZE: usize = 32_000;

/// Frequency-ordered `key=value` dictionary, frozen before any way is
/// encoded.
#[derive(Default)]
pub struct TagDictionary {
    entries: Vec<String>,
    lookup: HashMap<String, u16>,
}

impl TagDictionary {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a dictionary from a sample of tag maps: pairs are counted,
    /// pairs seen at least twice qualify, and the most frequent
    /// `min(unique, 32 000)` are kept in frequency-descending order.
    pub fn build<'a, I>(sample: I) -> Self
    where
        I: IntoIterator<Item = &'a Tags>,
    {
        let mut frequency: HashMap<String, u64> = HashMap::new();
        for tags in sample {
            for (key, value) in tags {
                *frequency.entry(format!("{key}={value}")).or_insert(0) += 1;
            }
        }

        let mut pairs: Vec<(String, u64)> = frequency
            .into_iter()
            .filter(|(_, count)| *count >= 2)
            .collect();
        pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        pairs.truncate(MAX_DICT_SIZE);

        let mut dict = Self::default();
        for (pair, _) in pairs {
            dict.push(pair);
        }
        info!("tag dictionary built: {} common pairs", dict.len());
        dict
    }

    fn push(&mut self, entry: String) {
        let index = self.entries.len() as u16;
        self.lookup.insert(entry.clone(), index);
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn index_of(&self, key: &str, value: &str) -> Option<u16> {
        self.lookup.get(&format!("{key}={value}")).copied()
    }
}

pub struct CompressedWayTagCacheWriter {
    final_path: PathBuf,
    index_path: PathBuf,
    data_path: PathBuf,
    index: Option<BufWriter<File>>,
    data: Option<BufWriter<File>>,
    dictionary: TagDictionary,
    count: u32,
    data_offset: u64,
}

impl CompressedWayTagCacheWriter {
    pub fn create<P: AsRef<Path>>(path: P, dictionary: TagDictionary) -> Result<Self> {
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
            dictionary,
            count: 0,
            data_offset: 0,
        })
    }

    pub fn put(&mut self, way_id: i64, tags: &Tags) -> Result<()> {
        let (index, data) = match (self.index.as_mut(), self.data.as_mut()) {
            (Some(index), Some(data)) => (index, data),
            _ => bail!("way tag cache writer is finished"),
        };
        if tags.len() > u8::MAX as usize {
            bail!("way {} has {} tags, the format caps at 255", way_id, tags.len());
        }
        if self.data_offset > u32::MAX as u64 {
            bail!("way-tag data section exceeds the u32 offset range");
        }

        index.write_all(&way_id.to_be_bytes())?;
        index.write_all(&(self.data_offset as u32).to_be_bytes())?;

        data.write_all(&[tags.len() as u8])?;
        self.data_offset += 1;

        for (key, value) in tags {
            if let Some(dict_index) = self.dictionary.index_of(key, value) {
                data.write_all(&[TYPE_DICT_REF])?;
                data.write_all(&dict_index.to_be_bytes())?;
                self.data_offset += 3;
            } else {
                let key_bytes = key.as_bytes();
                let value_bytes = value.as_bytes();
                if key_bytes.len() > u16::MAX as usize || value_bytes.len() > u16::MAX as usize {
                    bail!("way {} tag exceeds the u16 length range", way_id);
                }
                data.write_all(&[TYPE_CUSTOM])?;
                data.write_all(&(key_bytes.len() as u16).to_be_bytes())?;
                data.write_all(key_bytes)?;
                data.write_all(&(value_bytes.len() as u16).to_be_bytes())?;
                data.write_all(value_bytes)?;
                self.data_offset += 1 + 2 + key_bytes.len() as u64 + 2 + value_bytes.len() as u64;
            }
        }

        self.count += 1;
        if self.count % 100_000 == 0 {
            info!("way tag cache: written {} ways", self.count);
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<u32> {
        let mut index = self.index.take().context("way tag cache writer already finished")?;
        let mut data = self.data.take().context("way tag cache writer already finished")?;
        index.flush()?;
        data.flush()?;
        drop(index);
        drop(data);

        let mut out = BufWriter::new(File::create(&self.final_path).with_context(|| {
            format!("failed to create way tag cache {}", self.final_path.display())
        })?);
        out.write_all(&MAGIC)?;
        out.write_all(&[VERSION])?;
        out.write_all(&self.count.to_be_bytes())?;
        out.write_all(&(self.dictionary.len() as u16).to_be_bytes())?;
        for entry in &self.dictionary.entries {
            out.write_all(entry.as_bytes())?;
            out.write_all(&[0])?;
        }
        io::copy(&mut File::open(&self.index_path)?, &mut out)?;
        io::copy(&mut File::open(&self.data_path)?, &mut out)?;
        out.flush()?;

        info!("way tag cache complete: {} ways", self.count);
        Ok(self.count)
    }
}

impl Drop for CompressedWayTagCacheWriter {
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

/// Reader: maps the file, restores the dictionary, and decodes every blob
/// into an in-memory map up front.
pub struct CompressedWayTagCache {
    tags: HashMap<i64, Tags>,
    dict_size: usize,
}

impl CompressedWayTagCache {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("failed to open way tag cache {}", path.display()))?;
        let map = unsafe { Mmap::map(&file)? };

        if map.len() < HEADER_SIZE {
            bail!("way tag cache {} too short for header", path.display());
        }
        if map[0..4] != MAGIC {
            bail!("way tag cache {}: bad magic", path.display());
        }
        if map[4] != VERSION {
            bail!(
                "way tag cache {}: unsupported version {}",
                path.display(),
                map[4]
            );
        }
        let count = u32::from_be_bytes(map[5..9].try_into().unwrap()) as usize;
        let dict_size = u16::from_be_bytes(map[9..11].try_into().unwrap()) as usize;

        // Dictionary: dict_size NUL-terminated strings.
        let mut dict_entries = Vec::with_capacity(dict_size);
        let mut pos = HEADER_SIZE;
        for _ in 0..dict_size {
            let end = map[pos..]
                .iter()
                .position(|&b| b == 0)
                .map(|nul| pos + nul)
                .with_context(|| {
                    format!("way tag cache {}: unterminated dictionary entry", path.display())
                })?;
            dict_entries.push(String::from_utf8_lossy(&map[pos..end]).into_owned());
            pos = end + 1;
        }

        let index_start = pos;
        let data_start = index_start + count * INDEX_ENTRY_SIZE;
        if map.len() < data_start {
            bail!("way tag cache {}: truncated index", path.display());
        }
        let data = &map[data_start..];

        let mut tags = HashMap::with_capacity(count);
        for i in 0..count {
            let entry = index_start + i * INDEX_ENTRY_SIZE;
            let way_id = i64::from_be_bytes(map[entry..entry + 8].try_into().unwrap());
            let offset = u32::from_be_bytes(map[entry + 8..entry + 12].try_into().unwrap());
            let decoded = decode_tags(data, offset as usize, &dict_entries)
                .with_context(|| format!("way tag cache {}: bad blob for way {way_id}", path.display()))?;
            tags.insert(way_id, decoded);
        }

        info!(
            "loaded way tag cache: {} ways, {} dictionary entries",
            count, dict_size
        );
        Ok(Self {
            tags,
            dict_size,
        })
    }

    pub fn get(&self, way_id: i64) -> Option<&Tags> {
        self.tags.get(&way_id)
    }

    pub fn dictionary_size(&self) -> usize {
        self.dict_size
    }
}

impl WayTagLookup for CompressedWayTagCache {
    fn way_tags(&self, way_id: i64) -> Option<&Tags> {
        self.get(way_id)
    }

    fn len(&self) -> usize {
        self.tags.len()
    }
}

fn decode_tags(data: &[u8], offset: usize, dict: &[String]) -> Result<Tags> {
    let mut tags = Tags::new();
    let tag_count = *data.get(offset).context("blob offset out of range")? as usize;
    let mut pos = offset + 1;

    for _ in 0..tag_count {
        let kind = *data.get(pos).context("blob truncated")?;
        pos += 1;
        match kind {
            TYPE_DICT_REF => {
                let raw = data.get(pos..pos + 2).context("blob truncated")?;
                let dict_index = u16::from_be_bytes(raw.try_into().unwrap()) as usize;
                pos += 2;
                let entry = dict
                    .get(dict_index)
                    .with_context(|| format!("dictionary index {dict_index} out of range"))?;
                // A dictionary string without '=' is malformed and skipped.
                if let Some(eq) = entry.find('=') {
                    tags.insert(entry[..eq].to_string(), entry[eq + 1..].to_string());
                }
            }
            TYPE_CUSTOM => {
                let raw = data.get(pos..pos + 2).context("blob truncated")?;
                let key_len = u16::from_be_bytes(raw.try_into().unwrap()) as usize;
                pos += 2;
                let key = data.get(pos..pos + key_len).context("blob truncated")?;
                pos += key_len;
                let raw = data.get(pos..pos + 2).context("blob truncated")?;
                let value_len = u16::from_be_bytes(raw.try_into().unwrap()) as usize;
                pos += 2;
                let value = data.get(pos..pos + value_len).context("blob truncated")?;
                pos += value_len;
                tags.insert(
                    String::from_utf8_lossy(key).into_owned(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
            other => bail!("unknown tag entry type {other}"),
        }
    }

    Ok(tags)
}
