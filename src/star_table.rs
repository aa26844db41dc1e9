// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Reads and writes the FITS binary-table star list ("XYLS") exchanged with
//! the external solvers. Columns are single-precision floats named X_IMAGE,
//! Y_IMAGE and MAG_AUTO; decode looks columns up by name so tables written
//! by foreign tools with different column orders still load.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use log::debug;

use crate::error::SolverError;
use crate::fits::{block_padding, read_header, string_value,
                  write_block_padding, write_record, HeaderMap, RECORD_LEN};
use crate::solution::StarRecord;

pub const X_COLUMN: &str = "X_IMAGE";
pub const Y_COLUMN: &str = "Y_IMAGE";
pub const MAG_COLUMN: &str = "MAG_AUTO";

const PIXEL_UNIT: &str = "pixels";
const MAG_UNIT: &str = "magnitude";

/// Writes `stars` to `path` as a binary star table.
pub fn write_star_table(path: &Path, stars: &[StarRecord])
                        -> Result<(), SolverError> {
    let file = File::create(path).map_err(|e| {
        SolverError::codec(format!("creating {}: {}", path.display(), e))
    })?;
    let mut w = BufWriter::new(file);
    write_table(&mut w, stars).map_err(|e| {
        SolverError::codec(format!("writing {}: {}", path.display(), e))
    })?;
    debug!("wrote star table with {} rows to {}", stars.len(),
           path.display());
    Ok(())
}

fn write_table<W: Write>(w: &mut W, stars: &[StarRecord])
                         -> std::io::Result<()> {
    // Empty primary HDU.
    write_record(w, "SIMPLE", Some("T"))?;
    write_record(w, "BITPIX", Some("8"))?;
    write_record(w, "NAXIS", Some("0"))?;
    write_record(w, "EXTEND", Some("T"))?;
    write_record(w, "END", None)?;
    write_block_padding(w, 5 * RECORD_LEN, b' ')?;

    // Binary table extension header. Three 1E columns, 12 bytes per row.
    let records: Vec<(&str, String)> = vec![
        ("XTENSION", string_value("BINTABLE")),
        ("BITPIX", "8".to_string()),
        ("NAXIS", "2".to_string()),
        ("NAXIS1", "12".to_string()),
        ("NAXIS2", stars.len().to_string()),
        ("PCOUNT", "0".to_string()),
        ("GCOUNT", "1".to_string()),
        ("TFIELDS", "3".to_string()),
        ("TTYPE1", string_value(X_COLUMN)),
        ("TFORM1", string_value("1E")),
        ("TUNIT1", string_value(PIXEL_UNIT)),
        ("TTYPE2", string_value(Y_COLUMN)),
        ("TFORM2", string_value("1E")),
        ("TUNIT2", string_value(PIXEL_UNIT)),
        ("TTYPE3", string_value(MAG_COLUMN)),
        ("TFORM3", string_value("1E")),
        ("TUNIT3", string_value(MAG_UNIT)),
    ];
    for (kw, val) in &records {
        write_record(w, kw, Some(val.as_str()))?;
    }
    write_record(w, "END", None)?;
    write_block_padding(w, (records.len() + 1) * RECORD_LEN, b' ')?;

    for star in stars {
        w.write_f32::<BigEndian>(star.pixel.x as f32)?;
        w.write_f32::<BigEndian>(star.pixel.y as f32)?;
        w.write_f32::<BigEndian>(star.mag)?;
    }
    write_block_padding(w, stars.len() * 12, 0)?;
    w.flush()
}

struct Column {
    name: String,
    offset: usize,
    width: usize,
    form: char,
}

impl Column {
    fn read_f64(&self, row: &[u8]) -> f64 {
        match self.form {
            'E' => BigEndian::read_f32(&row[self.offset..]) as f64,
            'D' => BigEndian::read_f64(&row[self.offset..]),
            _ => unreachable!("non-float column"),
        }
    }
}

fn element_width(form: char) -> Option<usize> {
    match form {
        'L' | 'B' | 'A' | 'X' => Some(1),
        'I' => Some(2),
        'J' | 'E' => Some(4),
        'K' | 'D' => Some(8),
        _ => None,
    }
}

fn columns_from_header(header: &HeaderMap) -> Result<Vec<Column>, SolverError> {
    let tfields = header.get_i64("TFIELDS").ok_or_else(|| {
        SolverError::codec("table extension missing TFIELDS")
    })?;
    let mut columns = Vec::new();
    let mut offset = 0usize;
    for i in 1..=tfields {
        let form = header.get_str(&format!("TFORM{}", i)).ok_or_else(|| {
            SolverError::codec(format!("missing TFORM{}", i))
        })?;
        let (repeat, kind) = parse_tform(form)?;
        let width = element_width(kind).ok_or_else(|| {
            SolverError::codec(format!("unsupported column format {}", form))
        })?;
        let name = header
            .get_str(&format!("TTYPE{}", i))
            .unwrap_or("")
            .to_string();
        let total = repeat * width;
        columns.push(Column { name, offset, width: total, form: kind });
        offset += total;
    }
    Ok(columns)
}

fn parse_tform(form: &str) -> Result<(usize, char), SolverError> {
    let form = form.trim();
    let split = form.find(|c: char| c.is_ascii_alphabetic()).ok_or_else(|| {
        SolverError::codec(format!("bad TFORM value {:?}", form))
    })?;
    let repeat = if split == 0 {
        1
    } else {
        form[..split].parse::<usize>().map_err(|_| {
            SolverError::codec(format!("bad TFORM repeat in {:?}", form))
        })?
    };
    Ok((repeat, form.as_bytes()[split] as char))
}

fn find_float_column<'a>(columns: &'a [Column], name: &str)
                         -> Result<&'a Column, SolverError> {
    let col = columns
        .iter()
        .find(|c| c.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| {
            SolverError::codec(format!("star table has no {} column", name))
        })?;
    if col.form != 'E' && col.form != 'D' {
        return Err(SolverError::codec(format!(
            "column {} has non-float format {}", name, col.form)));
    }
    Ok(col)
}

/// Reads a star table written by us or by any conformant external tool.
pub fn read_star_table(path: &Path) -> Result<Vec<StarRecord>, SolverError> {
    let file = File::open(path).map_err(|e| {
        SolverError::codec(format!("opening {}: {}", path.display(), e))
    })?;
    let mut r = BufReader::new(file);

    let primary = read_header(&mut r)
        .map_err(|e| SolverError::codec(e.to_string()))?;
    skip_data_unit(&mut r, &primary)?;

    let table = read_header(&mut r)
        .map_err(|e| SolverError::codec(e.to_string()))?;
    match table.get_str("XTENSION") {
        Some("BINTABLE") => (),
        other => {
            return Err(SolverError::codec(format!(
                "expected BINTABLE extension, found {:?}", other)));
        }
    }
    let row_len = table.get_i64("NAXIS1").ok_or_else(|| {
        SolverError::codec("table extension missing NAXIS1")
    })? as usize;
    let num_rows = table.get_i64("NAXIS2").ok_or_else(|| {
        SolverError::codec("table extension missing NAXIS2")
    })? as usize;

    let columns = columns_from_header(&table)?;
    let declared_width: usize =
        columns.last().map(|c| c.offset + c.width).unwrap_or(0);
    if declared_width > row_len {
        return Err(SolverError::codec(format!(
            "columns span {} bytes but NAXIS1 is {}", declared_width,
            row_len)));
    }

    let x_col = find_float_column(&columns, X_COLUMN)?;
    let y_col = find_float_column(&columns, Y_COLUMN)?;
    let mag_col = find_float_column(&columns, MAG_COLUMN)?;

    let mut stars = Vec::with_capacity(num_rows);
    let mut row = vec![0u8; row_len];
    for i in 0..num_rows {
        r.read_exact(&mut row).map_err(|_| {
            SolverError::codec(format!(
                "star table truncated at row {} of {}", i, num_rows))
        })?;
        stars.push(StarRecord {
            pixel: [x_col.read_f64(&row), y_col.read_f64(&row)].into(),
            mag: mag_col.read_f64(&row) as f32,
            sky: None,
        });
    }
    debug!("read star table with {} rows from {}", stars.len(),
           path.display());
    Ok(stars)
}

fn skip_data_unit<R: Read>(r: &mut R, header: &HeaderMap)
                           -> Result<(), SolverError> {
    let naxis = header.get_i64("NAXIS").unwrap_or(0);
    if naxis == 0 {
        return Ok(());
    }
    let bitpix = header.get_i64("BITPIX").unwrap_or(8).unsigned_abs() as usize;
    let mut elements = 1usize;
    for i in 1..=naxis {
        elements *= header.get_i64(&format!("NAXIS{}", i)).unwrap_or(0)
            as usize;
    }
    let data_bytes = elements * bitpix / 8;
    let total = data_bytes + block_padding(data_bytes);
    let mut remaining = total;
    let mut chunk = [0u8; 4096];
    while remaining > 0 {
        let want = remaining.min(chunk.len());
        r.read_exact(&mut chunk[..want]).map_err(|_| {
            SolverError::codec("primary data unit truncated")
        })?;
        remaining -= want;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fits::format_record;
    use tempfile::TempDir;

    fn sample_stars(n: usize) -> Vec<StarRecord> {
        (0..n)
            .map(|i| {
                StarRecord::new(10.5 + i as f64 * 3.25,
                                900.0 - i as f64 * 7.5,
                                8.0 + i as f32 * 0.125)
            })
            .collect()
    }

    #[test]
    fn test_round_trip_preserves_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stars.xyls");
        let stars = sample_stars(50);
        write_star_table(&path, &stars).unwrap();

        let decoded = read_star_table(&path).unwrap();
        assert_eq!(decoded.len(), 50);
        for (a, b) in stars.iter().zip(decoded.iter()) {
            // Pixel coordinates survive to single-precision tolerance.
            assert!((a.pixel.x - b.pixel.x).abs() < 1e-4);
            assert!((a.pixel.y - b.pixel.y).abs() < 1e-4);
            assert_eq!(a.mag, b.mag);
            assert!(b.sky.is_none());
        }
    }

    #[test]
    fn test_empty_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.xyls");
        write_star_table(&path, &[]).unwrap();
        assert!(read_star_table(&path).unwrap().is_empty());
    }

    // Writes a table whose columns appear in a foreign order with an extra
    // column, as another tool might produce.
    fn write_foreign_table(path: &Path, rows: &[(f32, f32, f32, f32)]) {
        let mut bytes = Vec::new();
        for (kw, val) in [("SIMPLE", "T"), ("BITPIX", "8"), ("NAXIS", "0"),
                          ("EXTEND", "T")] {
            bytes.extend_from_slice(&format_record(kw, Some(val)));
        }
        bytes.extend_from_slice(&format_record("END", None));
        bytes.extend(std::iter::repeat(b' ').take(block_padding(bytes.len())));

        let header_start = bytes.len();
        let records = [
            ("XTENSION", string_value("BINTABLE")),
            ("BITPIX", "8".to_string()),
            ("NAXIS", "2".to_string()),
            ("NAXIS1", "16".to_string()),
            ("NAXIS2", rows.len().to_string()),
            ("PCOUNT", "0".to_string()),
            ("GCOUNT", "1".to_string()),
            ("TFIELDS", "4".to_string()),
            ("TTYPE1", string_value("MAG_AUTO")),
            ("TFORM1", string_value("1E")),
            ("TTYPE2", string_value("FLUX_AUTO")),
            ("TFORM2", string_value("1E")),
            ("TTYPE3", string_value("X_IMAGE")),
            ("TFORM3", string_value("1E")),
            ("TTYPE4", string_value("Y_IMAGE")),
            ("TFORM4", string_value("1E")),
        ];
        for (kw, val) in &records {
            bytes.extend_from_slice(&format_record(kw, Some(val.as_str())));
        }
        bytes.extend_from_slice(&format_record("END", None));
        let header_len = bytes.len() - header_start;
        bytes.extend(std::iter::repeat(b' ').take(block_padding(header_len)));

        let data_start = bytes.len();
        for (mag, flux, x, y) in rows {
            for v in [mag, flux, x, y] {
                bytes.extend_from_slice(&v.to_be_bytes());
            }
        }
        let data_len = bytes.len() - data_start;
        bytes.extend(std::iter::repeat(0u8).take(block_padding(data_len)));
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_foreign_column_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("foreign.xyls");
        write_foreign_table(&path, &[(9.5, 1200.0, 33.25, 44.5),
                                     (10.0, 800.0, 101.0, 202.0)]);

        let stars = read_star_table(&path).unwrap();
        assert_eq!(stars.len(), 2);
        assert_eq!(stars[0].pixel.x, 33.25);
        assert_eq!(stars[0].pixel.y, 44.5);
        assert_eq!(stars[0].mag, 9.5);
        assert_eq!(stars[1].pixel.x, 101.0);
    }

    #[test]
    fn test_missing_column_is_codec_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stars.xyls");
        let stars = sample_stars(3);
        write_star_table(&path, &stars).unwrap();

        // Corrupt the Y_IMAGE column name.
        let mut bytes = std::fs::read(&path).unwrap();
        let needle = b"'Y_IMAGE ";
        let pos = bytes
            .windows(needle.len())
            .position(|w| w == needle)
            .unwrap();
        bytes[pos + 1..pos + 8].copy_from_slice(b"Y_OTHER");
        std::fs::write(&path, bytes).unwrap();

        match read_star_table(&path) {
            Err(SolverError::Codec(msg)) => assert!(msg.contains("Y_IMAGE")),
            other => panic!("expected Codec error, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_table_is_codec_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stars.xyls");
        write_star_table(&path, &sample_stars(40)).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        // Drop the final data block so rows run out early.
        std::fs::write(&path, &bytes[..bytes.len() - 2880]).unwrap();

        match read_star_table(&path) {
            Err(SolverError::Codec(msg)) => {
                assert!(msg.contains("truncated"));
            }
            other => panic!("expected Codec error, got {:?}", other),
        }
    }
}  // mod tests.
