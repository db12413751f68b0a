// Bulk-load row encoding for worker response fragments.

use crate::error::{Result, ShardError};
use crate::proto::worker::{ResponseData, RowBundle};

pub const COL_SEP: u8 = b'\t';
pub const ROW_SEP: u8 = b'\n';
pub const NULL_TOKEN: &[u8] = b"\\N";

/// Escape a byte string for LOAD DATA INFILE.
///
/// Escaped characters: NUL, backspace, newline, carriage return, tab,
/// ASCII 26 (Ctrl+Z), and the backslash itself.
pub fn escape_bytes(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    for &b in src {
        match b {
            0x00 => out.extend_from_slice(b"\\0"),
            0x08 => out.extend_from_slice(b"\\b"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            0x1a => out.extend_from_slice(b"\\Z"),
            b'\\' => out.extend_from_slice(b"\\\\"),
            other => out.push(other),
        }
    }
    out
}

/// Inverse of [`escape_bytes`].
pub fn unescape_bytes(src: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(src.len());
    let mut iter = src.iter();
    while let Some(&b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'0') => out.push(0x00),
            Some(b'b') => out.push(0x08),
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(b'Z') => out.push(0x1a),
            Some(b'\\') => out.push(b'\\'),
            Some(&other) => {
                return Err(ShardError::Merge(format!(
                    "invalid escape sequence \\{}",
                    other as char
                )))
            }
            None => return Err(ShardError::Merge("dangling escape at end of cell".to_string())),
        }
    }
    Ok(out)
}

/// Streams the rows of one response fragment as bulk-load bytes.
///
/// Every row is prefixed with the provenance cells (`jobId`, `attempt`) so
/// the result table records which task and attempt produced it. Rows after
/// the first start with the row separator, matching the virtual-file layout
/// the bulk loader reads.
#[derive(Debug)]
pub struct ProtoRowBuffer {
    encoded: Vec<u8>,
    offset: usize,
}

impl ProtoRowBuffer {
    pub fn new(data: &ResponseData, job_id: i64, attempt: u32) -> Self {
        let job_id_cell = format!("'{}'", job_id).into_bytes();
        let attempt_cell = format!("'{}'", attempt).into_bytes();
        let mut encoded = Vec::new();
        for (i, row) in data.rows.iter().enumerate() {
            if i > 0 {
                encoded.push(ROW_SEP);
            }
            encoded.extend_from_slice(&job_id_cell);
            encoded.push(COL_SEP);
            encoded.extend_from_slice(&attempt_cell);
            Self::copy_row_bundle(&mut encoded, row);
        }
        Self { encoded, offset: 0 }
    }

    fn copy_row_bundle(dest: &mut Vec<u8>, row: &RowBundle) {
        for cell in &row.cells {
            dest.push(COL_SEP);
            match cell {
                Some(bytes) => {
                    dest.push(b'\'');
                    dest.extend_from_slice(&escape_bytes(bytes));
                    dest.push(b'\'');
                }
                None => dest.extend_from_slice(NULL_TOKEN),
            }
        }
    }

    /// Total encoded size in bytes.
    pub fn size(&self) -> usize {
        self.encoded.len()
    }

    /// Fill `buffer` with the next encoded bytes; returns the count copied.
    /// Zero means the fragment is exhausted.
    pub fn fetch(&mut self, buffer: &mut [u8]) -> usize {
        let remaining = self.encoded.len() - self.offset;
        let n = remaining.min(buffer.len());
        buffer[..n].copy_from_slice(&self.encoded[self.offset..self.offset + n]);
        self.offset += n;
        n
    }

    /// Drain the remaining encoded bytes in one allocation.
    pub fn read_all(&mut self) -> Vec<u8> {
        let rest = self.encoded[self.offset..].to_vec();
        self.offset = self.encoded.len();
        rest
    }
}
