use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{SegmentRecord, MAGIC, VERSION};

/// Appends segment records to an RSEG file. The header record count is
/// written as 0 on create and patched with the final count on close.
pub struct SegmentStoreWriter {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    record_count: u32,
}

impl SegmentStoreWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .with_context(|| format!("failed to create segment store {}", path.display()))?;
        let mut out = BufWriter::new(file);

        out.write_all(&MAGIC)?;
        out.write_all(&[VERSION])?;
        out.write_all(&0u32.to_be_bytes())?;

        Ok(Self {
            path,
            out: Some(out),
            record_count: 0,
        })
    }

    pub fn write(&mut self, record: &SegmentRecord) -> Result<()> {
        let out = match self.out.as_mut() {
            Some(out) => out,
            None => bail!("segment store writer is closed"),
        };
        if record.node_refs.len() < 2 {
            bail!(
                "segment record for way {} has {} node refs, need at least 2",
                record.base_way_id,
                record.node_refs.len()
            );
        }

        out.write_all(&record.edge_id.to_be_bytes())?;
        out.write_all(&record.base_way_id.to_be_bytes())?;
        out.write_all(&record.seg_index.to_be_bytes())?;
        out.write_all(&[record.flags])?;
        out.write_all(&(record.node_refs.len() as u32).to_be_bytes())?;
        for node_ref in &record.node_refs {
            out.write_all(&node_ref.to_be_bytes())?;
        }

        self.record_count += 1;
        Ok(())
    }

    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    /// Flushes all records and patches the header record count. Further
    /// writes fail; closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        let mut out = match self.out.take() {
            Some(out) => out,
            None => return Ok(()),
        };
        out.flush().context("failed to flush segment store")?;
        drop(out);

        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .with_context(|| format!("failed to reopen {} for header patch", self.path.display()))?;
        file.seek(SeekFrom::Start(5))?;
        file.write_all(&self.record_count.to_be_bytes())?;
        Ok(())
    }
}
