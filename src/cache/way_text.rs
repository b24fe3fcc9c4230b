//! Legacy text way-tag cache. Per way: a line with the way id, one
//! `key=value` line per tag, and a blank separator line. Newlines and `=`
//! in keys and values are backslash-escaped.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use super::WayTagLookup;
use crate::model::Tags;

pub struct TextWayTagCacheWriter {
    out: BufWriter<File>,
    count: u32,
}

impl TextWayTagCacheWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let out = BufWriter::new(
            File::create(path)
                .with_context(|| format!("failed to create way tag cache {}", path.display()))?,
        );
        Ok(Self { out, count: 0 })
    }

    pub fn put(&mut self, way_id: i64, tags: &Tags) -> Result<()> {
        writeln!(self.out, "{way_id}")?;
        for (key, value) in tags {
            writeln!(self.out, "{}={}", escape(key), escape(value))?;
        }
        writeln!(self.out)?;
        self.count += 1;
        Ok(())
    }

    pub fn finish(mut self) -> Result<u32> {
        self.out.flush()?;
        Ok(self.count)
    }
}

pub struct TextWayTagCache {
    tags: HashMap<i64, Tags>,
}

impl TextWayTagCache {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(
            File::open(path)
                .with_context(|| format!("failed to open way tag cache {}", path.display()))?,
        );

        let mut tags: HashMap<i64, Tags> = HashMap::new();
        let mut current: Option<(i64, Tags)> = None;

        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                if let Some((way_id, way_tags)) = current.take() {
                    tags.insert(way_id, way_tags);
                }
            } else if let Some((_, way_tags)) = current.as_mut() {
                let eq = find_unescaped_eq(&line)
                    .with_context(|| format!("malformed way tag line: {line}"))?;
                way_tags.insert(unescape(&line[..eq]), unescape(&line[eq + 1..]));
            } else {
                let way_id = line
                    .parse()
                    .with_context(|| format!("malformed way id line: {line}"))?;
                current = Some((way_id, Tags::new()));
            }
        }
        if let Some((way_id, way_tags)) = current.take() {
            tags.insert(way_id, way_tags);
        }

        Ok(Self { tags })
    }

    pub fn get(&self, way_id: i64) -> Option<&Tags> {
        self.tags.get(&way_id)
    }
}

impl WayTagLookup for TextWayTagCache {
    fn way_tags(&self, way_id: i64) -> Option<&Tags> {
        self.get(way_id)
    }

    fn len(&self) -> usize {
        self.tags.len()
    }
}

fn escape(s: &str) -> String {
    s.replace('\n', "\\n").replace('=', "\\=")
}

fn unescape(s: &str) -> String {
    s.replace("\\=", "=").replace("\\n", "\n")
}

/// Index of the first `=` not preceded by a backslash.
pub(crate) fn find_unescaped_eq(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    bytes
        .iter()
        .enumerate()
        .find(|(i, &b)| b == b'=' && (*i == 0 || bytes[i - 1] != b'\\'))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn round_trip_with_escaping() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("way_tags.txt");

        let awkward = tags(&[("note", "a=b\nc"), ("highway", "path")]);
        let plain = tags(&[("surface", "gravel")]);

        let mut writer = TextWayTagCacheWriter::create(&path).unwrap();
        writer.put(100, &awkward).unwrap();
        writer.put(200, &plain).unwrap();
        writer.finish().unwrap();

        let cache = TextWayTagCache::load(&path).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(100), Some(&awkward));
        assert_eq!(cache.get(200), Some(&plain));
    }

    #[test]
    fn finds_first_unescaped_eq() {
        assert_eq!(find_unescaped_eq("a=b"), Some(1));
        assert_eq!(find_unescaped_eq("a\\=b=c"), Some(4));
        assert_eq!(find_unescaped_eq("abc"), None);
    }
}
