// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Parses each backend's output artifact into the canonical `Solution`.
//! Whatever the backend's native units and sign conventions, the result
//! leaving this module is arcsec/pixel, degrees east of north, RA in
//! [0, 360), Dec in [-90, 90]. Degenerate solutions (zero scale or field)
//! are rejected here rather than propagated.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use log::{debug, info};
use serde::Deserialize;

use crate::error::SolverError;
use crate::fits;
use crate::settings::SolverBackend;
use crate::solution::{clamp_dec, normalize_ra, ImagePos, Parity, SkyCoord,
                      Solution};

/// Parses the result artifact the given backend produced. `width`/`height`
/// are the input image dimensions, used for field size when the artifact
/// does not declare its own.
pub fn parse_output(backend: SolverBackend, result_path: &Path, width: u32,
                    height: u32) -> Result<Solution, SolverError> {
    let solution = match backend {
        SolverBackend::AstrometryNet | SolverBackend::SextractorAstrometry => {
            parse_wcs_header_file(result_path, width, height)
        }
        SolverBackend::Astap => parse_astap_ini(result_path, width, height),
        SolverBackend::Watney => {
            parse_watney_json(result_path, width, height)
        }
    }?;
    info!("{} solution: ({:.4}, {:.4}) deg, {:.3} arcsec/px, \
           orientation {:.2} deg, {:?} parity",
          backend.name(), solution.ref_sky.ra, solution.ref_sky.dec,
          solution.pixel_scale, solution.orientation, solution.parity);
    Ok(solution)
}

/// Linear transform from pixel offsets to intermediate world coordinates
/// (degrees); the shared currency of the header-bearing backends.
#[derive(Clone, Copy, Debug)]
struct CdMatrix {
    cd11: f64,
    cd12: f64,
    cd21: f64,
    cd22: f64,
}

impl CdMatrix {
    fn det(&self) -> f64 {
        self.cd11 * self.cd22 - self.cd12 * self.cd21
    }

    /// Arcseconds per pixel: geometric mean of the two axis scales.
    fn pixel_scale(&self) -> f64 {
        self.det().abs().sqrt() * 3600.0
    }

    /// Position angle of the image +y axis, degrees east of north.
    fn orientation(&self) -> f64 {
        normalize_ra(self.cd12.atan2(self.cd22).to_degrees())
    }

    fn parity(&self) -> Parity {
        if self.det() < 0.0 {
            Parity::Normal
        } else {
            Parity::Flipped
        }
    }
}

fn solution_from_parts(ref_pixel: ImagePos, ra: f64, dec: f64, scale: f64,
                       orientation: f64, parity: Parity, width: u32,
                       height: u32) -> Result<Solution, SolverError> {
    if !scale.is_finite() || scale <= 0.0 {
        return Err(SolverError::parse(format!(
            "degenerate solution: pixel scale {}", scale)));
    }
    let field_width = width as f64 * scale / 3600.0;
    let field_height = height as f64 * scale / 3600.0;
    if field_width <= 0.0 || field_height <= 0.0 {
        return Err(SolverError::parse(format!(
            "degenerate solution: field {} x {} deg", field_width,
            field_height)));
    }
    Ok(Solution {
        ref_pixel,
        ref_sky: SkyCoord { ra: normalize_ra(ra), dec: clamp_dec(dec) },
        pixel_scale: scale,
        orientation: normalize_ra(orientation),
        parity,
        field_width,
        field_height,
    })
}

fn require_f64(header: &fits::HeaderMap, key: &str)
               -> Result<f64, SolverError> {
    header.get_f64(key).ok_or_else(|| {
        SolverError::parse(format!("WCS header missing {}", key))
    })
}

/// Extracts the linear transform, preferring the CD matrix and falling back
/// to the older CDELT + CROTA2 form.
fn cd_from_header(header: &fits::HeaderMap)
                  -> Result<CdMatrix, SolverError> {
    if header.contains("CD1_1") || header.contains("CD1_2")
        || header.contains("CD2_1") || header.contains("CD2_2")
    {
        return Ok(CdMatrix {
            cd11: header.get_f64("CD1_1").unwrap_or(1.0),
            cd12: header.get_f64("CD1_2").unwrap_or(0.0),
            cd21: header.get_f64("CD2_1").unwrap_or(0.0),
            cd22: header.get_f64("CD2_2").unwrap_or(1.0),
        });
    }
    if header.contains("CDELT1") && header.contains("CDELT2") {
        let cdelt1 = require_f64(header, "CDELT1")?;
        let cdelt2 = require_f64(header, "CDELT2")?;
        let crota2 = header.get_f64("CROTA2").unwrap_or(0.0).to_radians();
        return Ok(CdMatrix {
            cd11: cdelt1 * crota2.cos(),
            cd12: -cdelt2 * crota2.sin(),
            cd21: cdelt1 * crota2.sin(),
            cd22: cdelt2 * crota2.cos(),
        });
    }
    Err(SolverError::parse(
        "WCS header has neither a CD matrix nor CDELT values"))
}

/// Reads a WCS-bearing FITS header file as written by the reference solver.
pub fn parse_wcs_header_file(path: &Path, width: u32, height: u32)
                             -> Result<Solution, SolverError> {
    let file = File::open(path).map_err(|e| {
        SolverError::parse(format!("opening {}: {}", path.display(), e))
    })?;
    let header = fits::read_header(&mut BufReader::new(file))
        .map_err(|e| SolverError::parse(e.to_string()))?;

    let crpix1 = require_f64(&header, "CRPIX1")?;
    let crpix2 = require_f64(&header, "CRPIX2")?;
    let crval1 = require_f64(&header, "CRVAL1")?;
    let crval2 = require_f64(&header, "CRVAL2")?;
    let cd = cd_from_header(&header)?;
    debug!("WCS header {}: CRVAL ({}, {}), det {:e}", path.display(), crval1,
           crval2, cd.det());

    // The solver may record the solved image dimensions itself.
    let width = header.get_i64("IMAGEW").map_or(width, |w| w as u32);
    let height = header.get_i64("IMAGEH").map_or(height, |h| h as u32);

    solution_from_parts(ImagePos { x: crpix1, y: crpix2 }, crval1, crval2,
                        cd.pixel_scale(), cd.orientation(), cd.parity(),
                        width, height)
}

fn read_key_value_file(path: &Path)
                       -> Result<HashMap<String, String>, SolverError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SolverError::parse(format!("opening {}: {}", path.display(), e))
    })?;
    let mut map = HashMap::new();
    for line in content.lines() {
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    Ok(map)
}

const INI_REQUIRED: [&str; 11] = [
    "CRPIX1", "CRPIX2", "CRVAL1", "CRVAL2", "CDELT1", "CDELT2", "CROTA2",
    "CD1_1", "CD1_2", "CD2_1", "CD2_2",
];

/// Reads the flat key=value result file. The full field set must be
/// present; a partial solution is a failure, never a degraded success.
pub fn parse_astap_ini(path: &Path, width: u32, height: u32)
                       -> Result<Solution, SolverError> {
    let map = read_key_value_file(path)?;
    match map.get("PLTSOLVD").map(String::as_str) {
        Some("T") => (),
        Some(_) => {
            return Err(SolverError::ProcessFailure(format!(
                "solver reported no solution{}",
                map.get("WARNING")
                    .map(|w| format!(" ({})", w))
                    .unwrap_or_default())));
        }
        None => {
            return Err(SolverError::parse("result file missing PLTSOLVD"));
        }
    }

    let mut fields = HashMap::new();
    for key in INI_REQUIRED {
        let raw = map.get(key).ok_or_else(|| {
            SolverError::parse(format!("result file missing {}", key))
        })?;
        let value = raw.parse::<f64>().map_err(|_| {
            SolverError::parse(format!("unreadable {} value {:?}", key, raw))
        })?;
        fields.insert(key, value);
    }

    let cd = CdMatrix {
        cd11: fields["CD1_1"],
        cd12: fields["CD1_2"],
        cd21: fields["CD2_1"],
        cd22: fields["CD2_2"],
    };
    // Native scale is CDELT degrees/pixel; orientation and parity come from
    // the CD matrix, converting the tool's CROTA2 convention to ours.
    let scale =
        (fields["CDELT1"].abs() + fields["CDELT2"].abs()) / 2.0 * 3600.0;
    solution_from_parts(
        ImagePos { x: fields["CRPIX1"], y: fields["CRPIX2"] },
        fields["CRVAL1"], fields["CRVAL2"], scale, cd.orientation(),
        cd.parity(), width, height)
}

#[derive(Debug, Deserialize)]
struct WatneyPayload {
    success: bool,
    ra: Option<f64>,
    dec: Option<f64>,
    orientation: Option<f64>,
    #[serde(rename = "pixScale")]
    pix_scale: Option<f64>,
    #[serde(rename = "fieldRadius")]
    field_radius: Option<f64>,
    parity: Option<String>,
}

/// Reads the structured JSON result payload. The top-level success flag is
/// consulted before any numeric field is trusted.
pub fn parse_watney_json(path: &Path, width: u32, height: u32)
                         -> Result<Solution, SolverError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        SolverError::parse(format!("opening {}: {}", path.display(), e))
    })?;
    let payload: WatneyPayload =
        serde_json::from_str(&content).map_err(|e| {
            SolverError::parse(format!("unreadable JSON result: {}", e))
        })?;
    if !payload.success {
        return Err(SolverError::ProcessFailure(
            "solver reported no solution".to_string()));
    }

    let require = |field: Option<f64>, name: &str| {
        field.ok_or_else(|| {
            SolverError::parse(format!("JSON result missing {}", name))
        })
    };
    let ra = require(payload.ra, "ra")?;
    let dec = require(payload.dec, "dec")?;
    let orientation = require(payload.orientation, "orientation")?;
    let scale = require(payload.pix_scale, "pixScale")?;
    if let Some(radius) = payload.field_radius {
        if radius <= 0.0 {
            return Err(SolverError::parse(
                "degenerate solution: zero field radius"));
        }
    }
    let parity = match payload.parity.as_deref() {
        Some(p) if p.eq_ignore_ascii_case("flipped") => Parity::Flipped,
        _ => Parity::Normal,
    };

    // This backend reports no reference pixel; its solution is anchored at
    // the image center.
    let ref_pixel = ImagePos {
        x: width as f64 / 2.0,
        y: height as f64 / 2.0,
    };
    solution_from_parts(ref_pixel, ra, dec, scale, orientation, parity,
                        width, height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::path::PathBuf;
    use tempfile::TempDir;

    use crate::fits::{block_padding, format_record};

    fn write_header_file(dir: &TempDir, records: &[(&str, String)])
                         -> PathBuf {
        let mut bytes = Vec::new();
        for (kw, val) in records {
            bytes.extend_from_slice(&format_record(kw, Some(val.as_str())));
        }
        bytes.extend_from_slice(&format_record("END", None));
        bytes.extend(std::iter::repeat(b' ').take(block_padding(bytes.len())));
        let path = dir.path().join("result.wcs");
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn reference_wcs_records(scale_arcsec: f64) -> Vec<(&'static str, String)> {
        let s = scale_arcsec / 3600.0;
        vec![
            ("SIMPLE", "T".to_string()),
            ("BITPIX", "8".to_string()),
            ("NAXIS", "0".to_string()),
            ("CRPIX1", "500.0".to_string()),
            ("CRPIX2", "500.0".to_string()),
            ("CRVAL1", "180.0".to_string()),
            ("CRVAL2", "0.0".to_string()),
            ("CD1_1", format!("{:e}", -s)),
            ("CD1_2", "0.0".to_string()),
            ("CD2_1", "0.0".to_string()),
            ("CD2_2", format!("{:e}", s)),
            ("IMAGEW", "1000".to_string()),
            ("IMAGEH", "1000".to_string()),
        ]
    }

    #[test]
    fn test_parse_reference_wcs() {
        let dir = TempDir::new().unwrap();
        let path = write_header_file(&dir, &reference_wcs_records(1.5));
        let solution = parse_wcs_header_file(&path, 1000, 1000).unwrap();

        assert_abs_diff_eq!(solution.ref_pixel.x, 500.0);
        assert_abs_diff_eq!(solution.ref_sky.ra, 180.0);
        assert_abs_diff_eq!(solution.ref_sky.dec, 0.0);
        assert_abs_diff_eq!(solution.pixel_scale, 1.5, epsilon = 1e-9);
        assert_abs_diff_eq!(solution.orientation, 0.0, epsilon = 1e-9);
        assert_eq!(solution.parity, Parity::Normal);
        assert!(solution.field_width > 0.0);
        assert_abs_diff_eq!(solution.field_width, 1500.0 / 3600.0,
                            epsilon = 1e-9);
    }

    #[test]
    fn test_parse_wcs_cdelt_fallback() {
        let dir = TempDir::new().unwrap();
        let records = vec![
            ("CRPIX1", "320.0".to_string()),
            ("CRPIX2", "240.0".to_string()),
            ("CRVAL1", "-10.0".to_string()),  // Wraps to 350.
            ("CRVAL2", "45.0".to_string()),
            ("CDELT1", format!("{:e}", -2.0 / 3600.0)),
            ("CDELT2", format!("{:e}", 2.0 / 3600.0)),
            ("CROTA2", "30.0".to_string()),
        ];
        let path = write_header_file(&dir, &records);
        let solution = parse_wcs_header_file(&path, 640, 480).unwrap();

        assert_abs_diff_eq!(solution.ref_sky.ra, 350.0);
        assert_abs_diff_eq!(solution.pixel_scale, 2.0, epsilon = 1e-9);
        assert_eq!(solution.parity, Parity::Normal);
        // CDELT2 positive with rotation 30 puts +y 30 degrees west of
        // north in this parity; the canonical angle is 330.
        assert_abs_diff_eq!(solution.orientation, 330.0, epsilon = 1e-6);
    }

    #[test]
    fn test_zero_scale_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_header_file(&dir, &reference_wcs_records(0.0));
        match parse_wcs_header_file(&path, 1000, 1000) {
            Err(SolverError::Parse(msg)) => {
                assert!(msg.contains("degenerate"));
            }
            other => panic!("expected Parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_reference_coordinate() {
        let dir = TempDir::new().unwrap();
        let mut records = reference_wcs_records(1.5);
        records.retain(|(kw, _)| *kw != "CRVAL2");
        let path = write_header_file(&dir, &records);
        match parse_wcs_header_file(&path, 1000, 1000) {
            Err(SolverError::Parse(msg)) => assert!(msg.contains("CRVAL2")),
            other => panic!("expected Parse error, got {:?}", other),
        }
    }

    fn astap_ini_lines() -> Vec<String> {
        let s = 2.5 / 3600.0;
        vec![
            "PLTSOLVD=T".to_string(),
            "CRPIX1=960.5".to_string(),
            "CRPIX2=540.5".to_string(),
            "CRVAL1=83.25".to_string(),
            "CRVAL2=-5.5".to_string(),
            format!("CDELT1={:e}", -s),
            format!("CDELT2={:e}", s),
            "CROTA2=0.0".to_string(),
            format!("CD1_1={:e}", -s),
            "CD1_2=0.0".to_string(),
            "CD2_1=0.0".to_string(),
            format!("CD2_2={:e}", s),
        ]
    }

    fn write_ini(dir: &TempDir, lines: &[String]) -> PathBuf {
        let path = dir.path().join("result.ini");
        std::fs::write(&path, lines.join("\n")).unwrap();
        path
    }

    #[test]
    fn test_parse_astap_ini() {
        let dir = TempDir::new().unwrap();
        let path = write_ini(&dir, &astap_ini_lines());
        let solution = parse_astap_ini(&path, 1920, 1080).unwrap();

        assert_abs_diff_eq!(solution.ref_sky.ra, 83.25);
        assert_abs_diff_eq!(solution.ref_sky.dec, -5.5);
        assert_abs_diff_eq!(solution.pixel_scale, 2.5, epsilon = 1e-9);
        assert_eq!(solution.parity, Parity::Normal);
    }

    #[test]
    fn test_astap_declared_failure() {
        let dir = TempDir::new().unwrap();
        let path = write_ini(&dir, &[
            "PLTSOLVD=F".to_string(),
            "WARNING=Not enough stars".to_string(),
        ]);
        match parse_astap_ini(&path, 1920, 1080) {
            Err(SolverError::ProcessFailure(msg)) => {
                assert!(msg.contains("Not enough stars"));
            }
            other => panic!("expected ProcessFailure, got {:?}", other),
        }
    }

    #[test]
    fn test_astap_missing_orientation_field() {
        let dir = TempDir::new().unwrap();
        let mut lines = astap_ini_lines();
        lines.retain(|l| !l.starts_with("CROTA2"));
        let path = write_ini(&dir, &lines);
        // A partial field set is a parse failure, never a default-zero
        // orientation.
        match parse_astap_ini(&path, 1920, 1080) {
            Err(SolverError::Parse(msg)) => assert!(msg.contains("CROTA2")),
            other => panic!("expected Parse error, got {:?}", other),
        }
    }

    fn watney_json(success: bool) -> serde_json::Value {
        serde_json::json!({
            "success": success,
            "ra": 210.75,
            "dec": 54.25,
            "orientation": 12.5,
            "pixScale": 1.85,
            "fieldRadius": 0.75,
            "parity": "Normal",
        })
    }

    fn write_json(dir: &TempDir, value: &serde_json::Value) -> PathBuf {
        let path = dir.path().join("result.json");
        std::fs::write(&path, value.to_string()).unwrap();
        path
    }

    #[test]
    fn test_parse_watney_json() {
        let dir = TempDir::new().unwrap();
        let path = write_json(&dir, &watney_json(true));
        let solution = parse_watney_json(&path, 1200, 900).unwrap();

        assert_abs_diff_eq!(solution.ref_sky.ra, 210.75);
        assert_abs_diff_eq!(solution.pixel_scale, 1.85);
        assert_abs_diff_eq!(solution.orientation, 12.5);
        assert_eq!(solution.parity, Parity::Normal);
        // Anchored at the image center.
        assert_abs_diff_eq!(solution.ref_pixel.x, 600.0);
        assert_abs_diff_eq!(solution.ref_pixel.y, 450.0);
    }

    #[test]
    fn test_watney_declared_failure() {
        let dir = TempDir::new().unwrap();
        let path = write_json(&dir, &watney_json(false));
        assert!(matches!(parse_watney_json(&path, 1200, 900),
                         Err(SolverError::ProcessFailure(_))));
    }

    #[test]
    fn test_watney_missing_field() {
        let dir = TempDir::new().unwrap();
        let mut value = watney_json(true);
        value.as_object_mut().unwrap().remove("orientation");
        let path = write_json(&dir, &value);
        match parse_watney_json(&path, 1200, 900) {
            Err(SolverError::Parse(msg)) => {
                assert!(msg.contains("orientation"));
            }
            other => panic!("expected Parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_watney_flipped_parity() {
        let dir = TempDir::new().unwrap();
        let mut value = watney_json(true);
        value["parity"] = serde_json::json!("flipped");
        let path = write_json(&dir, &value);
        let solution = parse_watney_json(&path, 1200, 900).unwrap();
        assert_eq!(solution.parity, Parity::Flipped);
    }
}  // mod tests.
