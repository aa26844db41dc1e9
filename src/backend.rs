// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! One adapter per external solver. Each adapter is stateless: it derives a
//! command plan (argument lists, input artifacts to materialize, expected
//! output artifacts) from the settings and the per-attempt inputs, and
//! nothing else. Capability mismatches are rejected here, before any
//! process is spawned.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::artifacts::AttemptPaths;
use crate::error::SolverError;
use crate::settings::{SolveInput, SolverBackend, SolverSettings};

/// One external process invocation.
#[derive(Clone, Debug)]
pub struct SolverCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Short name for log lines.
    pub label: &'static str,
}

impl SolverCommand {
    fn new(program: &Path, label: &'static str) -> Self {
        SolverCommand {
            program: program.to_path_buf(),
            args: Vec::new(),
            label,
        }
    }

    fn arg(&mut self, arg: impl Into<OsString>) -> &mut Self {
        self.args.push(arg.into());
        self
    }
}

/// Input artifacts the attempt must materialize before launch.
#[derive(Clone, Debug)]
pub enum InputArtifact {
    StarTable(PathBuf),
    AstrometryConfig(PathBuf),
    ExtractorParams(PathBuf),
    ExtractorFilter(PathBuf),
}

impl InputArtifact {
    pub fn path(&self) -> &Path {
        match self {
            InputArtifact::StarTable(p)
            | InputArtifact::AstrometryConfig(p)
            | InputArtifact::ExtractorParams(p)
            | InputArtifact::ExtractorFilter(p) => p,
        }
    }
}

/// Everything needed to run one backend: the process stages in order, the
/// artifacts to write first, and where the outputs will land.
#[derive(Clone, Debug)]
pub struct CommandPlan {
    pub stages: Vec<SolverCommand>,
    pub inputs: Vec<InputArtifact>,
    /// The artifact holding the solution, parsed after the last stage.
    pub result_path: PathBuf,
    /// Star table produced by the extractor stage, if any.
    pub extractor_table: Option<PathBuf>,
    /// Other files the backend may drop; tracked for cleanup only.
    pub extra_outputs: Vec<PathBuf>,
}

fn unsupported(backend: SolverBackend, reason: impl Into<String>)
               -> SolverError {
    SolverError::UnsupportedOption {
        backend: backend.name(),
        reason: reason.into(),
    }
}

/// Builds the command plan for one attempt.
pub fn build_command_plan(backend: SolverBackend, input: &SolveInput,
                          settings: &SolverSettings, paths: &AttemptPaths)
                          -> Result<CommandPlan, SolverError> {
    match backend {
        SolverBackend::AstrometryNet => {
            plan_astrometry(input, settings, paths)
        }
        SolverBackend::SextractorAstrometry => {
            plan_sextractor_astrometry(input, settings, paths)
        }
        SolverBackend::Astap => plan_astap(input, settings, paths),
        SolverBackend::Watney => plan_watney(input, settings, paths),
    }
}

/// The config file the astrometry-based backends will read: either one we
/// materialize per attempt, or the caller's, verbatim.
fn astrometry_config(settings: &SolverSettings, paths: &AttemptPaths,
                     inputs: &mut Vec<InputArtifact>)
                     -> Result<PathBuf, SolverError> {
    if settings.auto_generate_config {
        let cfg = paths.with_ext("cfg");
        inputs.push(InputArtifact::AstrometryConfig(cfg.clone()));
        Ok(cfg)
    } else {
        settings.config_path.clone().ok_or_else(|| {
            SolverError::Config(
                "config auto-generation disabled and no config path supplied"
                    .to_string(),
            )
        })
    }
}

fn solve_field_command(xyls: &Path, wcs: &Path, config: &Path,
                       width: u32, height: u32, settings: &SolverSettings)
                       -> SolverCommand {
    let mut cmd = SolverCommand::new(&settings.solve_field_path,
                                     "solve-field");
    cmd.arg("--overwrite").arg("--no-plots");
    cmd.arg("--x-column").arg(crate::star_table::X_COLUMN);
    cmd.arg("--y-column").arg(crate::star_table::Y_COLUMN);
    cmd.arg("--sort-column").arg(crate::star_table::MAG_COLUMN);
    cmd.arg("--sort-ascending");
    cmd.arg("--width").arg(width.to_string());
    cmd.arg("--height").arg(height.to_string());
    cmd.arg("--config").arg(config.as_os_str());
    cmd.arg("--wcs").arg(wcs.as_os_str());
    if let Some(scale) = &settings.scale_hint {
        cmd.arg("--scale-units").arg(scale.units.flag_value());
        cmd.arg("--scale-low").arg(scale.low.to_string());
        cmd.arg("--scale-high").arg(scale.high.to_string());
    }
    if let Some(pos) = &settings.position_hint {
        cmd.arg("--ra").arg(pos.ra.to_string());
        cmd.arg("--dec").arg(pos.dec.to_string());
        cmd.arg("--radius").arg(pos.radius.to_string());
    }
    if let Some(timeout) = settings.timeout {
        cmd.arg("--cpulimit").arg(timeout.as_secs().max(1).to_string());
    }
    if settings.minimal_transfer {
        // Suppress every output product except the WCS header.
        for flag in ["--new-fits", "--match", "--rdls", "--corr",
                     "--index-xyls"] {
            cmd.arg(flag).arg("none");
        }
    }
    cmd.arg(xyls.as_os_str());
    cmd
}

fn plan_astrometry(input: &SolveInput, settings: &SolverSettings,
                   paths: &AttemptPaths) -> Result<CommandPlan, SolverError> {
    if !matches!(input, SolveInput::Stars { .. }) {
        return Err(unsupported(
            SolverBackend::AstrometryNet,
            "takes a pre-extracted star table; use the extractor pair for \
             raw images",
        ));
    }
    let (width, height) = input.dimensions();
    let xyls = paths.with_ext("xyls");
    let wcs = paths.with_ext("wcs");
    let mut inputs = vec![InputArtifact::StarTable(xyls.clone())];
    let config = astrometry_config(settings, paths, &mut inputs)?;

    Ok(CommandPlan {
        stages: vec![solve_field_command(&xyls, &wcs, &config, width, height,
                                         settings)],
        inputs,
        result_path: wcs,
        extractor_table: None,
        extra_outputs: solve_field_droppings(paths),
    })
}

fn plan_sextractor_astrometry(input: &SolveInput, settings: &SolverSettings,
                              paths: &AttemptPaths)
                              -> Result<CommandPlan, SolverError> {
    let image = input.image_path().ok_or_else(|| {
        unsupported(SolverBackend::SextractorAstrometry,
                    "runs its own extraction and needs a raw image file")
    })?;
    let (width, height) = input.dimensions();
    let xyls = paths.with_ext("xyls");
    let wcs = paths.with_ext("wcs");
    let param = paths.with_ext("param");
    let conv = paths.with_ext("conv");
    let mut inputs = vec![
        InputArtifact::ExtractorParams(param.clone()),
        InputArtifact::ExtractorFilter(conv.clone()),
    ];
    let config = astrometry_config(settings, paths, &mut inputs)?;

    let mut extractor = SolverCommand::new(&settings.sextractor_path,
                                           "sextractor");
    extractor.arg(image.as_os_str());
    extractor.arg("-CATALOG_NAME").arg(xyls.as_os_str());
    extractor.arg("-CATALOG_TYPE").arg("FITS_1.0");
    extractor.arg("-PARAMETERS_NAME").arg(param.as_os_str());
    extractor.arg("-FILTER").arg("Y");
    extractor.arg("-FILTER_NAME").arg(conv.as_os_str());
    extractor.arg("-DETECT_THRESH").arg("2.0");
    extractor.arg("-ANALYSIS_THRESH").arg("2.0");
    extractor.arg("-MAG_ZEROPOINT").arg("20.0");

    Ok(CommandPlan {
        stages: vec![
            extractor,
            solve_field_command(&xyls, &wcs, &config, width, height,
                                settings),
        ],
        inputs,
        result_path: wcs,
        extractor_table: Some(xyls),
        extra_outputs: solve_field_droppings(paths),
    })
}

// solve-field drops these next to its output even when most products are
// suppressed; track them so cleanup catches whatever appeared.
fn solve_field_droppings(paths: &AttemptPaths) -> Vec<PathBuf> {
    ["axy", "solved", "match", "rdls", "corr"]
        .iter()
        .map(|ext| paths.with_ext(ext))
        .collect()
}

fn plan_astap(input: &SolveInput, settings: &SolverSettings,
              paths: &AttemptPaths) -> Result<CommandPlan, SolverError> {
    let image = input.image_path().ok_or_else(|| {
        unsupported(SolverBackend::Astap,
                    "solves from the image file; star-table input is not \
                     accepted")
    })?;
    let (width, height) = input.dimensions();
    let ini = paths.with_ext("ini");

    let mut cmd = SolverCommand::new(&settings.astap_path, "astap");
    cmd.arg("-f").arg(image.as_os_str());
    cmd.arg("-o").arg(paths.base().as_os_str());
    cmd.arg("-wcs").arg("-log");
    if settings.downsample > 1 {
        cmd.arg("-z").arg(settings.downsample.to_string());
    }
    match &settings.position_hint {
        Some(pos) => {
            // This tool wants RA in hours and Dec as south pole distance.
            cmd.arg("-ra").arg(format!("{:.6}", pos.ra / 15.0));
            cmd.arg("-spd").arg(format!("{:.6}", pos.dec + 90.0));
            cmd.arg("-r").arg(format!("{:.2}", pos.radius));
        }
        None => {
            cmd.arg("-r").arg("180");
        }
    }
    match &settings.scale_hint {
        Some(scale) => {
            let width_deg = scale.units.to_deg_width(scale.high, width);
            let fov_deg = width_deg * height as f64 / width as f64;
            cmd.arg("-fov").arg(format!("{:.4}", fov_deg));
        }
        None => {
            cmd.arg("-fov").arg("0");
        }
    }

    Ok(CommandPlan {
        stages: vec![cmd],
        inputs: Vec::new(),
        result_path: ini,
        extractor_table: None,
        extra_outputs: vec![paths.with_ext("wcs"), paths.with_ext("log")],
    })
}

fn plan_watney(input: &SolveInput, settings: &SolverSettings,
               paths: &AttemptPaths) -> Result<CommandPlan, SolverError> {
    let image = input.image_path().ok_or_else(|| {
        unsupported(SolverBackend::Watney,
                    "solves from the image file; star-table input is not \
                     accepted")
    })?;
    let (width, _height) = input.dimensions();
    let json = paths.with_ext("json");

    let mut cmd = SolverCommand::new(&settings.watney_path, "watney");
    match &settings.position_hint {
        Some(pos) => {
            cmd.arg("nearby").arg("--manual");
            cmd.arg("--ra").arg(pos.ra.to_string());
            cmd.arg("--dec").arg(pos.dec.to_string());
            cmd.arg("--field-radius").arg(pos.radius.to_string());
        }
        None => {
            cmd.arg("blind");
            let (min_radius, max_radius) = match &settings.scale_hint {
                Some(scale) => (
                    scale.units.to_deg_width(scale.low, width) / 2.0,
                    scale.units.to_deg_width(scale.high, width) / 2.0,
                ),
                None => (0.25, 8.0),
            };
            cmd.arg("--min-radius").arg(format!("{:.4}", min_radius));
            cmd.arg("--max-radius").arg(format!("{:.4}", max_radius));
        }
    }
    cmd.arg("--image").arg(image.as_os_str());
    cmd.arg("--out").arg(json.as_os_str());
    cmd.arg("--out-format").arg("json");
    cmd.arg("--extended");
    if settings.downsample > 1 {
        cmd.arg("--sampling").arg(settings.downsample.to_string());
    }

    Ok(CommandPlan {
        stages: vec![cmd],
        inputs: Vec::new(),
        result_path: json,
        extractor_table: None,
        extra_outputs: Vec::new(),
    })
}

// mod tests.
