//! One physical JSONL segment: line I/O, tail reads and the tip anchor.

use apiary_core::hash::HASH_ALG;
use apiary_core::{Event, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Last committed event of a segment, persisted beside it so that
/// tampering with the final line is detectable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TipAnchor {
    pub event_id: String,
    pub hash: String,
    pub ts: String,
    #[serde(default = "default_alg")]
    pub alg: String,
}

fn default_alg() -> String {
    HASH_ALG.to_string()
}

impl TipAnchor {
    pub fn of(event: &Event) -> Self {
        Self {
            event_id: event.id.clone(),
            hash: event.hash.clone(),
            ts: event.ts.clone(),
            alg: HASH_ALG.to_string(),
        }
    }
}

/// Append serialized events as lines in a single write, then fsync.
/// A failed write or sync truncates the file back to its previous length,
/// so a torn batch never leaves a partial line behind.
pub fn append_lines(path: &Path, events: &[Event]) -> Result<()> {
    let mut buf = Vec::new();
    for event in events {
        serde_json::to_writer(&mut buf, event)?;
        buf.push(b'\n');
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    append_or_rollback(&mut file, &buf)?;
    Ok(())
}

/// A writable segment file that can be measured, synced and cut back.
trait SegmentSink: Write {
    fn len(&self) -> io::Result<u64>;
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl SegmentSink for File {
    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.sync_all()
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

fn append_or_rollback<S: SegmentSink>(sink: &mut S, buf: &[u8]) -> io::Result<()> {
    let committed = sink.len()?;
    let written = sink.write_all(buf).and_then(|()| sink.sync());
    if let Err(e) = written {
        if let Err(undo) = sink.truncate_to(committed) {
            tracing::error!(error = %undo, len = committed, "could not roll back torn append");
        }
        return Err(e);
    }
    Ok(())
}

/// Raw non-empty lines with their 1-based line numbers.
pub fn read_lines(path: &Path) -> Result<Vec<(usize, String)>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut lines = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push((i + 1, line));
        }
    }
    Ok(lines)
}

pub fn read_events(path: &Path) -> Result<Vec<Event>> {
    read_lines(path)?
        .into_iter()
        .map(|(_, line)| Ok(serde_json::from_str(&line)?))
        .collect()
}

/// Read the last event by scanning backwards from the end of the file.
pub fn last_event(path: &Path) -> Result<Option<Event>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata()?.len();
    const CHUNK: u64 = 8 * 1024;
    let mut tail: Vec<u8> = Vec::new();
    let mut pos = len;
    loop {
        let trimmed_len = tail
            .iter()
            .rposition(|b| !b.is_ascii_whitespace())
            .map(|i| i + 1)
            .unwrap_or(0);
        if let Some(nl) = tail[..trimmed_len].iter().rposition(|&b| b == b'\n') {
            return Ok(Some(serde_json::from_slice(&tail[nl + 1..trimmed_len])?));
        }
        if pos == 0 {
            if trimmed_len == 0 {
                return Ok(None);
            }
            return Ok(Some(serde_json::from_slice(&tail[..trimmed_len])?));
        }
        let step = CHUNK.min(pos);
        pos -= step;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0u8; step as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&tail);
        tail = chunk;
    }
}

pub fn read_anchor(path: &Path) -> Result<Option<TipAnchor>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Replace the anchor atomically (temp file in the same dir, then rename).
pub fn write_anchor(path: &Path, anchor: &TipAnchor) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, anchor)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
