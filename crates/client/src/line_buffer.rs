use bytes::BytesMut;

use crate::wire::StreamRecord;

/// Accumulates raw body chunks and yields only complete lines. The trailing
/// fragment after the last newline is retained until more bytes arrive.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.split_to(position + 1);
            // Splitting on the newline byte first keeps multi-byte characters intact.
            let text = String::from_utf8_lossy(&line[..position]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }

    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Drains the unterminated fragment once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split();
        Some(String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine {
    Blank,
    Sentinel,
    Record(String),
    Malformed,
}

pub fn parse_stream_line(line: &str, sentinel: &str) -> StreamLine {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return StreamLine::Blank;
    }

    let payload = trimmed
        .strip_prefix("data:")
        .map(str::trim_start)
        .unwrap_or(trimmed);
    if payload.is_empty() {
        return StreamLine::Blank;
    }
    if payload == sentinel {
        return StreamLine::Sentinel;
    }

    match serde_json::from_str::<StreamRecord>(payload) {
        Ok(record) => StreamLine::Record(record.content),
        Err(_) => StreamLine::Malformed,
    }
}
