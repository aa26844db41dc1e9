// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::solution::StarRecord;

/// The external solving engines we know how to drive. Exactly one is active
/// per solve attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SolverBackend {
    /// Astrometry.net `solve-field`, fed a pre-extracted star table.
    AstrometryNet,
    /// SExtractor producing a star table from an image file, followed by
    /// `solve-field` on that table.
    SextractorAstrometry,
    /// ASTAP command-line solver, fed the image file directly.
    Astap,
    /// Watney astrometry solver, fed the image file directly.
    Watney,
}

impl SolverBackend {
    pub fn name(&self) -> &'static str {
        match self {
            SolverBackend::AstrometryNet => "astrometry",
            SolverBackend::SextractorAstrometry => "sextractor-astrometry",
            SolverBackend::Astap => "astap",
            SolverBackend::Watney => "watney",
        }
    }

    /// Whether this backend consumes an astrometry.net style config file.
    pub fn uses_config_file(&self) -> bool {
        matches!(self,
                 SolverBackend::AstrometryNet |
                 SolverBackend::SextractorAstrometry)
    }
}

/// Units in which a field-scale hint is expressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleUnits {
    /// Field width, degrees.
    DegWidth,
    /// Field width, arcminutes.
    ArcMinWidth,
    /// Arcseconds per pixel.
    ArcSecPerPix,
}

impl ScaleUnits {
    /// The value `solve-field` expects for its --scale-units flag.
    pub fn flag_value(&self) -> &'static str {
        match self {
            ScaleUnits::DegWidth => "degwidth",
            ScaleUnits::ArcMinWidth => "arcminwidth",
            ScaleUnits::ArcSecPerPix => "arcsecperpix",
        }
    }

    /// Converts a value in these units to field width in degrees, for the
    /// given image width in pixels.
    pub fn to_deg_width(&self, value: f64, image_width: u32) -> f64 {
        match self {
            ScaleUnits::DegWidth => value,
            ScaleUnits::ArcMinWidth => value / 60.0,
            ScaleUnits::ArcSecPerPix => value * image_width as f64 / 3600.0,
        }
    }
}

/// Expected bounds on the image scale.
#[derive(Clone, Copy, Debug)]
pub struct ScaleHint {
    pub low: f64,
    pub high: f64,
    pub units: ScaleUnits,
}

/// Approximate sky position of the field center, with search radius.
/// All degrees.
#[derive(Clone, Copy, Debug)]
pub struct PositionHint {
    pub ra: f64,
    pub dec: f64,
    pub radius: f64,
}

/// File-system locations and behavior knobs for the external solvers.
/// Read-only during a solve; safe to share across concurrent attempts.
#[derive(Clone, Debug)]
pub struct SolverSettings {
    // Executable paths.
    pub solve_field_path: PathBuf,
    pub sextractor_path: PathBuf,
    pub astap_path: PathBuf,
    pub watney_path: PathBuf,

    /// Caller-supplied astrometry config file. Used verbatim when
    /// `auto_generate_config` is false.
    pub config_path: Option<PathBuf>,

    /// Directories holding astrometric index files.
    pub index_dirs: Vec<PathBuf>,

    // Search hints.
    pub scale_hint: Option<ScaleHint>,
    pub position_hint: Option<PositionHint>,

    /// Downsample factor applied by image-consuming backends. 1 disables.
    pub downsample: u32,

    /// Wall-clock bound per external process run.
    pub timeout: Option<Duration>,

    // Behavior flags.
    pub auto_generate_config: bool,
    pub cleanup_artifacts: bool,
    /// Suppress auxiliary solver output products, producing only the WCS
    /// artifact.
    pub minimal_transfer: bool,

    /// Directory for per-attempt temporary artifacts.
    pub temp_dir: PathBuf,
}

impl Default for SolverSettings {
    fn default() -> Self {
        SolverSettings::linux_default_paths()
    }
}

impl SolverSettings {
    fn with_paths(solve_field: &str, sextractor: &str, astap: &str,
                  watney: &str) -> Self {
        SolverSettings {
            solve_field_path: PathBuf::from(solve_field),
            sextractor_path: PathBuf::from(sextractor),
            astap_path: PathBuf::from(astap),
            watney_path: PathBuf::from(watney),
            config_path: None,
            index_dirs: Vec::new(),
            scale_hint: None,
            position_hint: None,
            downsample: 1,
            timeout: Some(Duration::from_secs(600)),
            auto_generate_config: true,
            cleanup_artifacts: true,
            minimal_transfer: true,
            temp_dir: std::env::temp_dir(),
        }
    }

    /// Stock distro install locations.
    pub fn linux_default_paths() -> Self {
        Self::with_paths("/usr/bin/solve-field",
                         "/usr/bin/sextractor",
                         "/usr/bin/astap",
                         "/usr/bin/watney-solve")
    }

    /// Locations used by a bundled (non-distro) install.
    pub fn linux_internal_paths() -> Self {
        Self::with_paths("/usr/local/astrometry/bin/solve-field",
                         "/usr/local/bin/sextractor",
                         "/opt/astap/astap",
                         "/opt/watney/watney-solve")
    }

    /// Homebrew locations on macOS.
    pub fn macos_homebrew_paths() -> Self {
        Self::with_paths("/usr/local/bin/solve-field",
                         "/usr/local/bin/sex",
                         "/usr/local/bin/astap",
                         "/usr/local/bin/watney-solve")
    }
}

/// What the caller hands us to solve: either an already-extracted star list,
/// or a raw image file for backends that do their own extraction.
#[derive(Clone, Debug)]
pub enum SolveInput {
    Stars {
        stars: Vec<StarRecord>,
        width: u32,
        height: u32,
    },
    Image {
        path: PathBuf,
        width: u32,
        height: u32,
    },
}

impl SolveInput {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            SolveInput::Stars { width, height, .. } => (*width, *height),
            SolveInput::Image { width, height, .. } => (*width, *height),
        }
    }

    pub fn image_path(&self) -> Option<&Path> {
        match self {
            SolveInput::Stars { .. } => None,
            SolveInput::Image { path, .. } => Some(path),
        }
    }
}

// mod tests.
