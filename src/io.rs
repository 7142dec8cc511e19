//! Edge-list loaders and writers.
//!
//! Two interchange formats, both produced by the external format tools:
//!
//! - **binary**: packed little-endian `(src: u32, dst: u32)` pairs, 8 bytes
//!   per edge, no header;
//! - **text**: one `src dst` pair per line, whitespace separated, `#`
//!   starting a comment line.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::types::Edge;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    Binary,
    Text,
}

pub fn read_edges(path: &Path, format: GraphFormat) -> Result<Vec<Edge>> {
    match format {
        GraphFormat::Binary => read_binary_edges(path),
        GraphFormat::Text => read_text_edges(path),
    }
}

pub fn read_binary_edges(path: &Path) -> Result<Vec<Edge>> {
    let bytes = fs::read(path)?;
    if bytes.len() % 8 != 0 {
        return Err(Error::InvalidInput(format!(
            "{}: binary edge file length {} is not a multiple of 8",
            path.display(),
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            Edge::new(
                u32::from_le_bytes(chunk[0..4].try_into().expect("chunk is 8 bytes")),
                u32::from_le_bytes(chunk[4..8].try_into().expect("chunk is 8 bytes")),
            )
        })
        .collect())
}

pub fn read_text_edges(path: &Path) -> Result<Vec<Edge>> {
    let contents = fs::read_to_string(path)?;
    let mut edges = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let parse = |field: Option<&str>| -> Result<u32> {
            field
                .and_then(|f| f.parse().ok())
                .ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "{}:{}: expected `src dst`, got {line:?}",
                        path.display(),
                        lineno + 1
                    ))
                })
        };
        let src = parse(fields.next())?;
        let dst = parse(fields.next())?;
        edges.push(Edge::new(src, dst));
    }
    Ok(edges)
}

pub fn write_binary_edges(path: &Path, edges: &[Edge]) -> Result<()> {
    let mut out = BufWriter::new(fs::File::create(path)?);
    for e in edges {
        out.write_all(&e.src.to_le_bytes())?;
        out.write_all(&e.dst.to_le_bytes())?;
    }
    out.flush()?;
    Ok(())
}

pub fn write_text_edges(path: &Path, edges: &[Edge]) -> Result<()> {
    let mut out = BufWriter::new(fs::File::create(path)?);
    for e in edges {
        writeln!(out, "{} {}", e.src, e.dst)?;
    }
    out.flush()?;
    Ok(())
}

/// Write walker-major paths as packed little-endian u32, mapping dense ids
/// back to original names.
pub fn write_walks(path: &Path, walks: &[u32], id2name: &[u32]) -> Result<()> {
    let mut out = BufWriter::new(fs::File::create(path)?);
    for &v in walks {
        out.write_all(&id2name[v as usize].to_le_bytes())?;
    }
    out.flush()?;
    Ok(())
}
