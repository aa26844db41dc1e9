// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Materializes the backend config files we auto-generate: the astrometry
//! solver's index configuration, and the local extractor's parameter list
//! and convolution filter.

use std::fs;
use std::path::Path;

use log::{info, warn};

use crate::error::SolverError;
use crate::settings::SolverSettings;

/// Writes an astrometry.net style config file enumerating the configured
/// index directories. Refuses to emit a config with no index directories;
/// such a config would make every solve fail silently.
pub fn write_astrometry_config(path: &Path, settings: &SolverSettings)
                               -> Result<(), SolverError> {
    if settings.index_dirs.is_empty() {
        return Err(SolverError::Config(
            "no index directories configured".to_string()));
    }

    let mut content = String::new();
    content.push_str("inparallel\n");
    content.push_str("minwidth 0.1\n");
    content.push_str("maxwidth 180\n");
    if let Some(timeout) = settings.timeout {
        content.push_str(&format!("cpulimit {}\n", timeout.as_secs().max(1)));
    }
    content.push_str("autoindex\n");
    for dir in &settings.index_dirs {
        content.push_str(&format!("add_path {}\n", dir.display()));
        log_index_count(dir);
    }

    fs::write(path, content).map_err(|e| {
        SolverError::Config(format!("writing {}: {}", path.display(), e))
    })?;
    info!("generated solver config at {} with {} index path(s)",
          path.display(), settings.index_dirs.len());
    Ok(())
}

fn log_index_count(dir: &Path) {
    let pattern = dir.join("index-*.fit*");
    match glob::glob(&pattern.to_string_lossy()) {
        Ok(entries) => {
            let count = entries.filter_map(Result::ok).count();
            if count == 0 {
                warn!("index directory {} contains no index files",
                      dir.display());
            } else {
                info!("index directory {}: {} index file(s)", dir.display(),
                      count);
            }
        }
        Err(e) => warn!("cannot scan index directory {}: {}", dir.display(),
                        e),
    }
}

/// Writes the extractor's catalog parameter list. The columns here must
/// match what the star table codec reads back.
pub fn write_extractor_params(path: &Path) -> Result<(), SolverError> {
    let content = "X_IMAGE\nY_IMAGE\nMAG_AUTO\nFLUX_AUTO\n";
    fs::write(path, content).map_err(|e| {
        SolverError::Config(format!("writing {}: {}", path.display(), e))
    })
}

/// Writes the extractor's default detection convolution filter.
pub fn write_extractor_filter(path: &Path) -> Result<(), SolverError> {
    let content = "CONV NORM\n\
                   # 3x3 convolution mask with FWHM = 2 pixels.\n\
                   1 2 1\n\
                   2 4 2\n\
                   1 2 1\n";
    fs::write(path, content).map_err(|e| {
        SolverError::Config(format!("writing {}: {}", path.display(), e))
    })
}

// mod tests.
