use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use waysplit::assemble::build_derived_pbf;
use waysplit::cache::{
    BinaryNodeCache, CompressedWayTagCache, NodeLookup, RelationCache, TextNodeCache,
    TextWayTagCache, WayTagLookup,
};
use waysplit::capture::SegmentCapture;
use waysplit::extract;
use waysplit::producer::split_ways;
use waysplit::rewrite::RouteRelationRewriter;
use waysplit::store::SegmentStoreWriter;

#[derive(Parser)]
#[command(name = "waysplit")]
#[command(version)]
#[command(about = "Capture way segments from OSM data and build derived PBF files", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture segment metadata from an OSM PBF file into a segment store
    CaptureSegments {
        /// Input OSM PBF file
        #[arg(long)]
        osm: PathBuf,
        /// Output segment store file (*.rseg)
        #[arg(long, short = 'o')]
        segments: PathBuf,
        /// Re-capture even if the segment store already exists
        #[arg(long, short = 'f')]
        force: bool,
    },
    /// Extract needed nodes, way tags, and route relations from a PBF file
    ExtractOsm {
        /// Input OSM PBF file
        #[arg(long)]
        osm: PathBuf,
        /// Input segment store file (*.rseg)
        #[arg(long)]
        segments: PathBuf,
        /// Output cache directory
        #[arg(long, short = 'o')]
        out: PathBuf,
        /// Use binary caches and the streaming id-set extractor
        #[arg(long)]
        optimized: bool,
        /// Sample ways first and build a tag dictionary (only with --optimized)
        #[arg(long)]
        build_dictionary: bool,
        /// Re-extract even if the cache already exists
        #[arg(long, short = 'f')]
        force: bool,
    },
    /// Build the derived PBF with segment ways and rewritten route relations
    BuildDerivedPbf {
        /// Input segment store file (*.rseg)
        #[arg(long)]
        segments: PathBuf,
        /// Cache directory written by extract-osm
        #[arg(long)]
        cache: PathBuf,
        /// Output derived PBF file
        #[arg(long, short = 'o')]
        out: PathBuf,
        /// Keep barrier edges in the output (default: excluded)
        #[arg(long)]
        include_barrier_edges: bool,
        /// Rebuild even if the derived PBF already exists
        #[arg(long, short = 'f')]
        force: bool,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::CaptureSegments {
            osm,
            segments,
            force,
        } => capture_segments(&osm, &segments, force),
        Commands::ExtractOsm {
            osm,
            segments,
            out,
            optimized,
            build_dictionary,
            force,
        } => extract_osm(&osm, &segments, &out, optimized, build_dictionary, force),
        Commands::BuildDerivedPbf {
            segments,
            cache,
            out,
            include_barrier_edges,
            force,
        } => build_pbf(&segments, &cache, &out, include_barrier_edges, force),
    };

    if let Err(err) = result {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn capture_segments(osm: &Path, segments: &Path, force: bool) -> Result<()> {
    require_file(osm, "OSM file")?;

    if segments.exists() && !force {
        println!("Segment store already exists: {}", segments.display());
        println!("Skipping capture. Use --force to re-capture.");
        report_file(segments);
        return Ok(());
    }
    ensure_parent_dir(segments)?;
    if force && segments.exists() {
        println!("Forcing re-capture (existing file will be overwritten)");
    }

    println!("Capturing segments from {}...", osm.display());
    let writer = SegmentStoreWriter::create(segments)?;
    let mut capture = SegmentCapture::new(writer);
    split_ways(osm, &mut capture)?;
    let captured = capture.finish()?;

    println!();
    println!("Success! Captured {captured} segments");
    println!("Output written to: {}", segments.display());
    Ok(())
}

fn extract_osm(
    osm: &Path,
    segments: &Path,
    cache_dir: &Path,
    optimized: bool,
    build_dictionary: bool,
    force: bool,
) -> Result<()> {
    require_file(osm, "OSM file")?;
    require_file(segments, "Segment store")?;

    if cache_exists(cache_dir, optimized) && !force {
        println!("Cache already exists: {}", cache_dir.display());
        println!("Skipping extraction. Use --force to re-extract.");
        for name in cache_file_names(optimized) {
            report_file(&cache_dir.join(name));
        }
        return Ok(());
    }
    if force && cache_exists(cache_dir, optimized) {
        println!("Forcing re-extraction (existing cache will be overwritten)");
    }

    println!("Extracting OSM data from {}...", osm.display());
    let stats = if optimized {
        println!("Using binary caches and streaming id-set extraction");
        extract::streaming::extract(osm, segments, cache_dir, build_dictionary)?
    } else {
        println!("Using legacy text caches (consider --optimized for large inputs)");
        extract::simple::extract(osm, segments, cache_dir)?
    };

    println!();
    println!("Success! Extraction complete:");
    println!("  Nodes extracted: {}", stats.nodes_extracted);
    println!("  Ways extracted: {}", stats.ways_extracted);
    println!("  Relations extracted: {}", stats.relations_extracted);
    println!("Output written to: {}", cache_dir.display());
    Ok(())
}

fn build_pbf(
    segments: &Path,
    cache_dir: &Path,
    out: &Path,
    include_barrier_edges: bool,
    force: bool,
) -> Result<()> {
    require_file(segments, "Segment store")?;
    if !cache_dir.exists() {
        bail!("Cache directory does not exist: {}", cache_dir.display());
    }
    if !cache_dir.is_dir() {
        bail!("Cache path is not a directory: {}", cache_dir.display());
    }

    if out.exists() && !force {
        println!("Derived PBF already exists: {}", out.display());
        println!("Skipping build. Use --force to rebuild.");
        report_file(out);
        return Ok(());
    }
    ensure_parent_dir(out)?;
    if force && out.exists() {
        println!("Forcing rebuild (existing file will be overwritten)");
    }

    println!("Building derived PBF...");
    println!("  Segment store: {}", segments.display());
    println!("  Cache directory: {}", cache_dir.display());
    println!("  Exclude barrier edges: {}", !include_barrier_edges);
    println!();

    // Cache format is auto-detected by file presence.
    println!("Loading cache files...");
    let node_cache: Box<dyn NodeLookup> = if cache_dir.join("nodes.bin").exists() {
        println!("  Using binary node cache");
        Box::new(BinaryNodeCache::open(cache_dir.join("nodes.bin"))?)
    } else {
        println!("  Using legacy text node cache");
        Box::new(TextNodeCache::load(cache_dir.join("nodes.txt"))?)
    };
    println!("  Loaded {} nodes", node_cache.len());

    let way_tags: Box<dyn WayTagLookup> = if cache_dir.join("way_tags.bin").exists() {
        println!("  Using compressed way tag cache");
        Box::new(CompressedWayTagCache::open(cache_dir.join("way_tags.bin"))?)
    } else {
        println!("  Using legacy text way tag cache");
        Box::new(TextWayTagCache::load(cache_dir.join("way_tags.txt"))?)
    };
    println!("  Loaded {} ways", way_tags.len());

    let relation_cache = RelationCache::load(cache_dir.join("relations.txt"))?;
    println!("  Loaded {} relations", relation_cache.len());
    println!();

    println!("Rewriting route relations...");
    let rewriter = RouteRelationRewriter::from_store(segments, include_barrier_edges)?;
    let rewritten = rewriter.rewrite_all(relation_cache.relations());

    println!("Writing derived PBF...");
    let stats = build_derived_pbf(
        segments,
        node_cache.as_ref(),
        way_tags.as_ref(),
        &rewritten,
        include_barrier_edges,
        out,
    )?;

    println!();
    println!("Success! Derived PBF written to: {}", out.display());
    println!("  Nodes: {}", stats.nodes_written);
    println!("  Ways: {}", stats.ways_written);
    println!("  Relations: {}", stats.relations_written);
    if stats.missing_nodes > 0 {
        println!("  Nodes missing from cache: {}", stats.missing_nodes);
    }
    report_file(out);
    Ok(())
}

fn require_file(path: &Path, what: &str) -> Result<()> {
    if !path.exists() {
        bail!("{} does not exist: {}", what, path.display());
    }
    if !path.is_file() {
        bail!("{} is not a file: {}", what, path.display());
    }
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn cache_file_names(optimized: bool) -> [&'static str; 3] {
    if optimized {
        ["nodes.bin", "way_tags.bin", "relations.txt"]
    } else {
        ["nodes.txt", "way_tags.txt", "relations.txt"]
    }
}

fn cache_exists(cache_dir: &Path, optimized: bool) -> bool {
    cache_file_names(optimized)
        .iter()
        .all(|name| cache_dir.join(name).exists())
}

fn report_file(path: &Path) {
    if let Ok(metadata) = std::fs::metadata(path) {
        println!("  {}: {} KB", path.display(), metadata.len() / 1024);
    }
}
