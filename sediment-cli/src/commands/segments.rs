use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use sediment::storage::{decode_id, encode_id, CancellationToken};
use sediment::Engine;

use super::open_index;

fn parse_id(id: &str) -> Result<u64> {
    decode_id(id).with_context(|| format!("Invalid segment id '{}', expected hex", id))
}

/// Print the live segments of an index overlapping `[time_min, time_max]`.
pub fn list_segments(engine: &Engine, index: &str, time_min: i64, time_max: i64) -> Result<()> {
    let index = open_index(engine, index)?;
    let reader = index.get_reader(time_min, time_max)?;
    let segments = reader.segments();

    println!("{:<14} {:>12} {:>20} {:>20}", "ID", "SIZE", "TIME_MIN", "TIME_MAX");
    for segment in segments {
        println!(
            "{:<14} {:>12} {:>20} {:>20}",
            encode_id(segment.id),
            segment.size,
            segment.time_min,
            segment.time_max
        );
    }
    println!();
    println!("{} segment(s) in '{}'", segments.len(), index.name());
    Ok(())
}

pub fn segment_stats(engine: &Engine, index: &str) -> Result<()> {
    let index = open_index(engine, index)?;
    let (count, bytes) = index.segment_stats();
    println!("Index:        {}", index.name());
    println!("Storage type: {}", index.storage_type());
    println!("Files:        {}", count);
    println!("Bytes:        {}", bytes);
    Ok(())
}

pub fn add_segment(
    engine: &Engine,
    index: &str,
    input: &Path,
    time_min: i64,
    time_max: i64,
) -> Result<()> {
    let data = fs::read(input).with_context(|| format!("Failed to read {:?}", input))?;
    let writer = open_index(engine, index)?.get_writer()?;
    let id = writer.add_segment(&data, time_min, time_max, &CancellationToken::new())?;
    tracing::info!(index, id = %encode_id(id), bytes = data.len(), "added segment");
    println!("{}", encode_id(id));
    Ok(())
}

pub fn get_segment(engine: &Engine, index: &str, id: &str, output: Option<&Path>) -> Result<()> {
    let id = parse_id(id)?;
    let index = open_index(engine, index)?;
    let reader = index.get_reader(0, 0)?;
    let data = reader.load(id)?.release()?;

    match output {
        Some(path) => {
            fs::write(path, &data).with_context(|| format!("Failed to write {:?}", path))?;
            tracing::info!(path = %path.display(), bytes = data.len(), "wrote segment");
        }
        None => std::io::stdout().lock().write_all(&data)?,
    }
    Ok(())
}

pub fn remove_segment(engine: &Engine, index: &str, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let writer = open_index(engine, index)?.get_writer()?;
    if !writer.remove_segment(id)? {
        anyhow::bail!("Segment {} not found in '{}'", encode_id(id), index);
    }
    println!("Removed segment {}", encode_id(id));
    Ok(())
}
