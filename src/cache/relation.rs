//! Route-relation cache, always text. One block per relation:
//!
//! ```text
//! RELATION <id>
//! TAG key=value
//! MEMBER <NODE|WAY|RELATION>,<ref>,<role>
//! <blank line>
//! ```
//!
//! Newlines, commas, and `=` in keys, values, and roles are
//! backslash-escaped on write (in that order) and unescaped in reverse
//! order on read.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use super::way_text::find_unescaped_eq;
use crate::model::{Member, MemberKind, OsmRelation, Tags};

pub struct RelationCacheWriter {
    out: BufWriter<File>,
    count: u32,
}

impl RelationCacheWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let out = BufWriter::new(
            File::create(path)
                .with_context(|| format!("failed to create relation cache {}", path.display()))?,
        );
        Ok(Self { out, count: 0 })
    }

    pub fn put(&mut self, relation: &OsmRelation) -> Result<()> {
        writeln!(self.out, "RELATION {}", relation.id)?;
        for (key, value) in &relation.tags {
            writeln!(self.out, "TAG {}={}", escape(key), escape(value))?;
        }
        for member in &relation.members {
            writeln!(
                self.out,
                "MEMBER {},{},{}",
                member.kind.as_str(),
                member.ref_id,
                escape(&member.role)
            )?;
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

/// Loads every relation from the cache file, preserving source order.
pub struct RelationCache {
    relations: Vec<OsmRelation>,
}

impl RelationCache {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(
            File::open(path)
                .with_context(|| format!("failed to open relation cache {}", path.display()))?,
        );

        let mut relations = Vec::new();
        let mut current: Option<OsmRelation> = None;

        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                if let Some(relation) = current.take() {
                    relations.push(relation);
                }
            } else if let Some(id) = line.strip_prefix("RELATION ") {
                let id = id
                    .parse()
                    .with_context(|| format!("malformed relation header: {line}"))?;
                current = Some(OsmRelation::new(id, Tags::new(), Vec::new()));
            } else if let Some(tag_line) = line.strip_prefix("TAG ") {
                let relation = current
                    .as_mut()
                    .with_context(|| format!("TAG line outside a relation block: {line}"))?;
                let eq = find_unescaped_eq(tag_line)
                    .with_context(|| format!("malformed TAG line: {line}"))?;
                relation.tags.insert(
                    unescape(&tag_line[..eq]),
                    unescape(&tag_line[eq + 1..]),
                );
            } else if let Some(member_line) = line.strip_prefix("MEMBER ") {
                let relation = current
                    .as_mut()
                    .with_context(|| format!("MEMBER line outside a relation block: {line}"))?;
                relation.members.push(parse_member(member_line)?);
            } else {
                bail!("malformed relation cache line: {line}");
            }
        }
        // A final block without a trailing blank line still counts.
        if let Some(relation) = current.take() {
            relations.push(relation);
        }

        Ok(Self { relations })
    }

    pub fn relations(&self) -> &[OsmRelation] {
        &self.relations
    }

    pub fn into_relations(self) -> Vec<OsmRelation> {
        self.relations
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}

fn parse_member(line: &str) -> Result<Member> {
    let mut parts = line.splitn(3, ',');
    let (kind, ref_id, role) = match (parts.next(), parts.next(), parts.next()) {
        (Some(kind), Some(ref_id), Some(role)) => (kind, ref_id, role),
        _ => bail!("malformed MEMBER line: {line}"),
    };
    let kind = MemberKind::parse(kind)
        .with_context(|| format!("unknown member type in line: {line}"))?;
    let ref_id = ref_id
        .parse()
        .with_context(|| format!("malformed member ref in line: {line}"))?;
    Ok(Member::new(kind, ref_id, unescape(role)))
}

fn escape(s: &str) -> String {
    s.replace('\n', "\\n").replace(',', "\\,").replace('=', "\\=")
}

fn unescape(s: &str) -> String {
    s.replace("\\=", "=").replace("\\,", ",").replace("\\n", "\n")
}
