//! Needed-ID extraction with external merge-sort.
//!
//! Streams the segment store once, spilling every base way id and node ref
//! to raw big-endian i64 files, then turns each spill file into a sorted,
//! duplicate-free array without ever holding more than one chunk of ids in
//! memory. Membership tests downstream binary-search the arrays.

use anyhow::{Context, Result};
use log::info;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use crate::store::SegmentStoreReader;

/// Ids per in-memory sort chunk (80 MiB of i64s).
const CHUNK_SIZE: usize = 10_000_000;

/// Sorted, deduplicated id arrays derived from the segment store.
pub struct IdSets {
    pub node_ids: Vec<i64>,
    pub way_ids: Vec<i64>,
}

/// Streams the segment store and returns the sorted-unique node and way id
/// sets. Spill and chunk files live in a private temp directory that is
/// removed on every exit path.
pub fn extract_needed_ids(store_path: &Path) -> Result<IdSets> {
    let tmp = tempfile::tempdir().context("failed to create temp directory for id spill")?;
    let node_spill = tmp.path().join("node_ids.bin");
    let way_spill = tmp.path().join("way_ids.bin");

    info!("spilling ids from {}", store_path.display());
    {
        let reader = SegmentStoreReader::open(store_path)?;
        let mut node_out = BufWriter::new(File::create(&node_spill)?);
        let mut way_out = BufWriter::new(File::create(&way_spill)?);

        let mut records = 0u64;
        for record in reader.records()? {
            let record = record?;
            way_out.write_all(&record.base_way_id.to_be_bytes())?;
            for node_ref in &record.node_refs {
                node_out.write_all(&node_ref.to_be_bytes())?;
            }
            records += 1;
            if records % 1_000_000 == 0 {
                info!("spilled ids from {} segment records", records);
            }
        }
        node_out.flush()?;
        way_out.flush()?;
    }

    info!("sorting and deduplicating node ids");
    let node_ids = sort_dedup(&node_spill, CHUNK_SIZE)?;
    info!("sorting and deduplicating way ids");
    let way_ids = sort_dedup(&way_spill, CHUNK_SIZE)?;

    info!(
        "needed ids: {} nodes, {} ways",
        node_ids.len(),
        way_ids.len()
    );
    Ok(IdSets { node_ids, way_ids })
}

/// External sort with dedup over a raw big-endian i64 file: sort fixed-size
/// chunks in memory, write them beside the input, then k-way merge.
pub(crate) fn sort_dedup(ids_file: &Path, chunk_size: usize) -> Result<Vec<i64>> {
    let total = std::fs::metadata(ids_file)?.len() / 8;
    let dir = ids_file.parent().context("spill file has no parent")?;

    // Chunk pass.
    let mut chunk_paths = Vec::new();
    {
        let mut reader = BufReader::with_capacity(8 << 20, File::open(ids_file)?);
        let mut remaining = total;
        while remaining > 0 {
            let count = remaining.min(chunk_size as u64) as usize;
            let mut chunk = Vec::with_capacity(count);
            for _ in 0..count {
                chunk.push(read_i64(&mut reader)?.context("spill file truncated")?);
            }
            chunk.sort_unstable();

            let chunk_path = dir.join(format!("chunk_{}.bin", chunk_paths.len()));
            let mut out = BufWriter::new(File::create(&chunk_path)?);
            for id in &chunk {
                out.write_all(&id.to_be_bytes())?;
            }
            out.flush()?;
            chunk_paths.push(chunk_path);

            remaining -= count as u64;
        }
    }

    // Merge pass with dedup.
    let mut readers = Vec::with_capacity(chunk_paths.len());
    for path in &chunk_paths {
        readers.push(BufReader::with_capacity(1 << 20, File::open(path)?));
    }

    let mut heap: BinaryHeap<Reverse<(i64, usize)>> = BinaryHeap::new();
    for (idx, reader) in readers.iter_mut().enumerate() {
        if let Some(value) = read_i64(reader)? {
            heap.push(Reverse((value, idx)));
        }
    }

    let mut unique = Vec::new();
    let mut last: Option<i64> = None;
    while let Some(Reverse((value, idx))) = heap.pop() {
        if last != Some(value) {
            unique.push(value);
            last = Some(value);
            if unique.len() % 1_000_000 == 0 {
                info!("merged {} unique ids", unique.len());
            }
        }
        if let Some(next) = read_i64(&mut readers[idx])? {
            heap.push(Reverse((next, idx)));
        }
    }

    drop(readers);
    for path in &chunk_paths {
        std::fs::remove_file(path).ok();
    }

    Ok(unique)
}

/// Reads one big-endian i64; returns None at clean end of file.
fn read_i64<R: Read>(reader: &mut R) -> Result<Option<i64>> {
    let mut buf = [0u8; 8];
    match reader.read_exact(&mut buf) {
        Ok(()) => Ok(Some(i64::from_be_bytes(buf))),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SegmentRecord, SegmentStoreWriter};
    use tempfile::tempdir;

    fn write_spill(dir: &Path, values: &[i64]) -> std::path::PathBuf {
        let path = dir.join("ids.bin");
        let mut out = BufWriter::new(File::create(&path).unwrap());
        for v in values {
            out.write_all(&v.to_be_bytes()).unwrap();
        }
        out.flush().unwrap();
        path
    }

    #[test]
    fn sorts_and_deduplicates() {
        let dir = tempdir().unwrap();
        let path = write_spill(dir.path(), &[5, 3, 5, 1, 3, 2, 1]);
        assert_eq!(sort_dedup(&path, CHUNK_SIZE).unwrap(), vec![1, 2, 3, 5]);
    }

    #[test]
    fn merges_across_multiple_chunks() {
        let dir = tempdir().unwrap();
        let values: Vec<i64> = (0..100).map(|i| (i * 37) % 50).collect();
        let path = write_spill(dir.path(), &values);

        // Tiny chunks force a real k-way merge.
        let result = sort_dedup(&path, 7).unwrap();
        let mut expected: Vec<i64> = values.clone();
        expected.sort_unstable();
        expected.dedup();
        assert_eq!(result, expected);

        // Chunk files are gone after the merge.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("chunk_"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn empty_input_yields_empty_set() {
        let dir = tempdir().unwrap();
        let path = write_spill(dir.path(), &[]);
        assert!(sort_dedup(&path, CHUNK_SIZE).unwrap().is_empty());
    }

    #[test]
    fn negative_ids_sort_correctly() {
        let dir = tempdir().unwrap();
        let path = write_spill(dir.path(), &[0, -5, 3, -5, i64::MIN]);
        assert_eq!(
            sort_dedup(&path, 2).unwrap(),
            vec![i64::MIN, -5, 0, 3]
        );
    }

    #[test]
    fn extracts_ids_from_store() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("test.rseg");
        let mut writer = SegmentStoreWriter::create(&store).unwrap();
        writer
            .write(&SegmentRecord::new(0, 100, 0, false, vec![3, 1, 2]).unwrap())
            .unwrap();
        writer
            .write(&SegmentRecord::new(1, 100, 1, false, vec![2, 5]).unwrap())
            .unwrap();
        writer
            .write(&SegmentRecord::new(2, 50, 0, false, vec![5, 6]).unwrap())
            .unwrap();
        writer.close().unwrap();

        let ids = extract_needed_ids(&store).unwrap();
        assert_eq!(ids.node_ids, vec![1, 2, 3, 5, 6]);
        assert_eq!(ids.way_ids, vec![50, 100]);
    }
}
