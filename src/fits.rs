// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Minimal FITS primitives: 80-character header records grouped into
//! 2880-byte blocks, big-endian payloads. Just enough to write the star
//! table the solvers consume and to read the headers they produce.

use std::collections::HashMap;
use std::io::{self, Read, Write};

pub const RECORD_LEN: usize = 80;
pub const BLOCK_LEN: usize = 2880;

#[derive(Debug)]
pub enum FitsError {
    Io(io::Error),
    Malformed(String),
}

impl std::fmt::Display for FitsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FitsError::Io(e) => write!(f, "IO error: {}", e),
            FitsError::Malformed(s) => write!(f, "malformed FITS data: {}", s),
        }
    }
}

impl std::error::Error for FitsError {}

impl From<io::Error> for FitsError {
    fn from(e: io::Error) -> Self {
        FitsError::Io(e)
    }
}

/// Formats one 80-character header record. `value` of None yields a
/// bare-keyword record (e.g. END). String values must arrive already
/// quoted; numeric values are right-justified ending at column 30.
pub fn format_record(keyword: &str, value: Option<&str>) -> [u8; RECORD_LEN] {
    let mut record = [b' '; RECORD_LEN];
    let kw = keyword.as_bytes();
    let kw_len = kw.len().min(8);
    record[..kw_len].copy_from_slice(&kw[..kw_len]);

    if let Some(value) = value {
        record[8] = b'=';
        record[9] = b' ';
        let v = value.as_bytes();
        let start = if value.starts_with('\'') {
            10
        } else {
            30_usize.saturating_sub(v.len()).max(10)
        };
        let v_len = v.len().min(RECORD_LEN - start);
        record[start..start + v_len].copy_from_slice(&v[..v_len]);
    }
    record
}

pub fn write_record<W: Write>(w: &mut W, keyword: &str, value: Option<&str>)
                              -> io::Result<()> {
    w.write_all(&format_record(keyword, value))
}

/// Quoted, blank-padded FITS string value.
pub fn string_value(s: &str) -> String {
    format!("'{:<8}'", s)
}

/// Number of fill bytes needed to reach the next block boundary.
pub fn block_padding(bytes: usize) -> usize {
    (BLOCK_LEN - bytes % BLOCK_LEN) % BLOCK_LEN
}

pub fn write_block_padding<W: Write>(w: &mut W, bytes_written: usize, fill: u8)
                                     -> io::Result<()> {
    let padding = block_padding(bytes_written);
    if padding > 0 {
        w.write_all(&vec![fill; padding])?;
    }
    Ok(())
}

/// One header unit's keywords. Values are stored with quotes and inline
/// comments already stripped.
#[derive(Debug, Default)]
pub struct HeaderMap {
    keywords: HashMap<String, String>,
}

impl HeaderMap {
    pub fn contains(&self, key: &str) -> bool {
        self.keywords.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.keywords.get(key).map(String::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        let raw = self.keywords.get(key)?;
        // Fortran-style D exponents appear in some writers' output.
        raw.replace(['D', 'd'], "E").parse::<f64>().ok()
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.keywords.get(key)?.parse::<i64>().ok()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.keywords.get(key)?.as_str() {
            "T" => Some(true),
            "F" => Some(false),
            _ => None,
        }
    }
}

fn clean_value(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix('\'') {
        // Quoted string; trailing blanks inside the quotes are padding.
        if let Some(end) = rest.find('\'') {
            return rest[..end].trim_end().to_string();
        }
        return rest.trim_end().to_string();
    }
    trimmed.split('/').next().unwrap_or("").trim().to_string()
}

/// Reads one header unit (through END, including block padding) from the
/// reader, leaving it positioned at the start of the data unit.
pub fn read_header<R: Read>(reader: &mut R) -> Result<HeaderMap, FitsError> {
    let mut header = HeaderMap::default();
    let mut buffer = [0u8; RECORD_LEN];
    let mut records = 0usize;

    loop {
        reader.read_exact(&mut buffer).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                FitsError::Malformed("header truncated before END".to_string())
            } else {
                FitsError::Io(e)
            }
        })?;
        records += 1;

        let record = String::from_utf8_lossy(&buffer);
        let keyword = record[..8].trim_end();
        if keyword == "END" {
            break;
        }
        if keyword.is_empty() || keyword == "COMMENT" || keyword == "HISTORY" {
            continue;
        }
        if record.len() > 10 && &record[8..10] == "= " {
            header.keywords.insert(keyword.to_string(),
                                   clean_value(&record[10..]));
        }
    }

    // Consume the rest of the header's final block. Tolerate EOF here:
    // bare header files are sometimes written unpadded.
    let mut padding = vec![0u8; block_padding(records * RECORD_LEN)];
    if !padding.is_empty() {
        let mut filled = 0;
        while filled < padding.len() {
            match reader.read(&mut padding[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Err(FitsError::Io(e)),
            }
        }
    }
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header_bytes(records: &[(&str, Option<&str>)]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for (kw, val) in records {
            bytes.extend_from_slice(&format_record(kw, *val));
        }
        bytes.extend_from_slice(&format_record("END", None));
        let padding = block_padding(bytes.len());
        bytes.extend(std::iter::repeat(b' ').take(padding));
        bytes
    }

    #[test]
    fn test_record_layout() {
        let record = format_record("NAXIS1", Some("12"));
        assert_eq!(&record[..6], b"NAXIS1");
        assert_eq!(record[8], b'=');
        // Right-justified ending at column 30.
        assert_eq!(&record[28..30], b"12");
        assert_eq!(record.len(), RECORD_LEN);
    }

    #[test]
    fn test_header_round_trip() {
        let bytes = header_bytes(&[
            ("SIMPLE", Some("T")),
            ("BITPIX", Some("8")),
            ("CRVAL1", Some("180.125")),
            ("OBJECT", Some(string_value("M31").as_str())),
        ]);
        let header = read_header(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(header.get_bool("SIMPLE"), Some(true));
        assert_eq!(header.get_i64("BITPIX"), Some(8));
        assert_eq!(header.get_f64("CRVAL1"), Some(180.125));
        assert_eq!(header.get_str("OBJECT"), Some("M31"));
        assert!(!header.contains("MISSING"));
    }

    #[test]
    fn test_fortran_exponent() {
        let bytes = header_bytes(&[("CDELT1", Some("-4.1666D-4"))]);
        let header = read_header(&mut Cursor::new(bytes)).unwrap();
        let v = header.get_f64("CDELT1").unwrap();
        assert!((v - (-4.1666e-4)).abs() < 1e-12);
    }

    #[test]
    fn test_inline_comment_stripped() {
        let bytes = header_bytes(&[("CRPIX1", Some("500.0 / ref pixel"))]);
        let header = read_header(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(header.get_f64("CRPIX1"), Some(500.0));
    }

    #[test]
    fn test_truncated_header_is_error() {
        let mut bytes = header_bytes(&[("SIMPLE", Some("T"))]);
        bytes.truncate(100);
        // Remove END and padding so the stream ends mid-header.
        assert!(read_header(&mut Cursor::new(bytes)).is_err());
    }

    #[test]
    fn test_block_padding() {
        assert_eq!(block_padding(0), 0);
        assert_eq!(block_padding(1), BLOCK_LEN - 1);
        assert_eq!(block_padding(BLOCK_LEN), 0);
        assert_eq!(block_padding(BLOCK_LEN + 80), BLOCK_LEN - 80);
    }
}  // mod tests.
