use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;

use crate::models::Event;
use crate::utils;

/// Writes one JSON object per line, replacing any existing file.
pub fn write_jsonl(path: &Path, events: &[Event]) -> anyhow::Result<()> {
    utils::ensure_parent(path)
        .with_context(|| format!("creating output directory for {}", path.display()))?;
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    write_jsonl_to(&mut writer, events)?;
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    Ok(())
}

pub fn write_jsonl_to<W: Write>(writer: &mut W, events: &[Event]) -> anyhow::Result<()> {
    for event in events {
        serde_json::to_writer(&mut *writer, event)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}
