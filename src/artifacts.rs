// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Per-attempt temporary artifact tracking. Every file created for one solve
//! attempt is tracked here and removed exactly once when the attempt reaches
//! its terminal state, whatever that state is.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::{debug, info, warn};

/// Collision-free base naming for one attempt's artifacts. Concurrent
/// attempts get disjoint sets.
#[derive(Clone, Debug)]
pub struct AttemptPaths {
    base: PathBuf,
}

impl AttemptPaths {
    pub fn new(temp_dir: &Path, backend_name: &str) -> Self {
        let token: u32 = rand::random();
        AttemptPaths {
            base: temp_dir.join(format!("astrosolve-{}-{:08x}", backend_name,
                                        token)),
        }
    }

    /// The attempt's base path with the given extension appended.
    pub fn with_ext(&self, ext: &str) -> PathBuf {
        let mut os = self.base.clone().into_os_string();
        os.push(".");
        os.push(ext);
        PathBuf::from(os)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }
}

/// The set of file paths created for one solve attempt.
pub struct ArtifactSet {
    tracked: Mutex<Vec<PathBuf>>,
    delete_on_release: bool,
    released: AtomicBool,
}

impl ArtifactSet {
    pub fn new(delete_on_release: bool) -> Self {
        ArtifactSet {
            tracked: Mutex::new(Vec::new()),
            delete_on_release,
            released: AtomicBool::new(false),
        }
    }

    pub fn track(&self, path: PathBuf) {
        debug!("tracking artifact {}", path.display());
        self.tracked.lock().unwrap().push(path);
    }

    pub fn tracked_paths(&self) -> Vec<PathBuf> {
        self.tracked.lock().unwrap().clone()
    }

    /// Removes all tracked files. Safe to call more than once; calls after
    /// the first are no-ops. Removal failures are logged, never escalated,
    /// so cleanup cannot mask the attempt's primary outcome.
    pub fn release_all(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let tracked = std::mem::take(&mut *self.tracked.lock().unwrap());
        if !self.delete_on_release {
            info!("cleanup disabled; keeping {} artifact(s)", tracked.len());
            return;
        }
        for path in tracked {
            if !path.exists() {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("removed artifact {}", path.display()),
                Err(e) => {
                    warn!("could not remove artifact {}: {}", path.display(),
                          e);
                }
            }
        }
    }
}

impl Drop for ArtifactSet {
    fn drop(&mut self) {
        self.release_all();
    }
}

// mod tests.
