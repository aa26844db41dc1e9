// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! One solve attempt, end to end: materialize input artifacts, run the
//! backend's process stages under supervision, parse the output into a
//! canonical solution, and release every artifact whatever the outcome.
//! Attempts share nothing, so several (e.g. racing candidate backends) can
//! run concurrently.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use crate::artifacts::{ArtifactSet, AttemptPaths};
use crate::backend::{build_command_plan, InputArtifact};
use crate::config_file::{write_astrometry_config, write_extractor_filter,
                         write_extractor_params};
use crate::error::SolverError;
use crate::parser::parse_output;
use crate::settings::{SolveInput, SolverBackend, SolverSettings};
use crate::solution::{Solution, StarRecord};
use crate::star_table::{read_star_table, write_star_table};
use crate::supervisor::{new_cancel_token, require_success, CancelToken,
                        Supervised};
use crate::wcs_transform::WcsTransform;

/// Attempt lifecycle. Every terminal outcome passes through `Cleaned`,
/// the only state in which the attempt's resources are released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptState {
    Idle,
    Launching,
    Running,
    Succeeded,
    Failed,
    Aborted,
    TimedOut,
    Cleaned,
}

/// What a successful attempt hands back.
pub struct SolveOutcome {
    pub solution: Solution,
    pub transform: WcsTransform,
    /// Sky-annotated star list: the caller's input stars, or the
    /// extractor's output when the backend did its own extraction.
    pub stars: Option<Vec<StarRecord>>,
}

/// Runs one solve attempt to completion on the calling thread.
pub fn solve(backend: SolverBackend, input: &SolveInput,
             settings: &SolverSettings)
             -> Result<SolveOutcome, SolverError> {
    solve_with_cancel(backend, input, settings, &new_cancel_token())
}

/// As `solve`, honoring an external cancel token. Setting the token at any
/// point aborts the attempt's process tree and still runs cleanup.
pub fn solve_with_cancel(backend: SolverBackend, input: &SolveInput,
                         settings: &SolverSettings, cancel: &CancelToken)
                         -> Result<SolveOutcome, SolverError> {
    let state = Mutex::new(AttemptState::Idle);
    run_attempt(backend, input, settings, cancel, &state)
}

fn set_state(state: &Mutex<AttemptState>, next: AttemptState) {
    let mut locked = state.lock().unwrap();
    debug!("attempt state {:?} -> {:?}", *locked, next);
    *locked = next;
}

fn run_attempt(backend: SolverBackend, input: &SolveInput,
               settings: &SolverSettings, cancel: &CancelToken,
               state: &Mutex<AttemptState>)
               -> Result<SolveOutcome, SolverError> {
    let paths = AttemptPaths::new(&settings.temp_dir, backend.name());
    let artifacts = ArtifactSet::new(settings.cleanup_artifacts);

    let result =
        execute(backend, input, settings, cancel, state, &paths, &artifacts);
    let terminal = match &result {
        Ok(_) => AttemptState::Succeeded,
        Err(SolverError::Aborted) => AttemptState::Aborted,
        Err(SolverError::Timeout(_)) => AttemptState::TimedOut,
        Err(_) => AttemptState::Failed,
    };
    if let Err(e) = &result {
        warn!("{} attempt failed: {}", backend.name(), e);
    }
    set_state(state, terminal);
    // Cleanup runs on every terminal path before the result is surfaced.
    artifacts.release_all();
    set_state(state, AttemptState::Cleaned);
    result
}

fn execute(backend: SolverBackend, input: &SolveInput,
           settings: &SolverSettings, cancel: &CancelToken,
           state: &Mutex<AttemptState>, paths: &AttemptPaths,
           artifacts: &ArtifactSet) -> Result<SolveOutcome, SolverError> {
    if cancel.load(std::sync::atomic::Ordering::Relaxed) {
        return Err(SolverError::Aborted);
    }
    let (width, height) = input.dimensions();
    let plan = build_command_plan(backend, input, settings, paths)?;

    // Input artifacts strictly precede launch.
    for artifact in &plan.inputs {
        artifacts.track(artifact.path().to_path_buf());
        match artifact {
            InputArtifact::StarTable(path) => {
                let SolveInput::Stars { stars, .. } = input else {
                    return Err(SolverError::codec(
                        "star table requested for image input"));
                };
                write_star_table(path, stars)?;
            }
            InputArtifact::AstrometryConfig(path) => {
                write_astrometry_config(path, settings)?;
            }
            InputArtifact::ExtractorParams(path) => {
                write_extractor_params(path)?;
            }
            InputArtifact::ExtractorFilter(path) => {
                write_extractor_filter(path)?;
            }
        }
    }
    // Track expected outputs up front so cleanup catches partial products.
    artifacts.track(plan.result_path.clone());
    if let Some(table) = &plan.extractor_table {
        artifacts.track(table.clone());
    }
    for extra in &plan.extra_outputs {
        artifacts.track(extra.clone());
    }

    let mut extracted: Option<Vec<StarRecord>> = None;
    let stage_count = plan.stages.len();
    for (index, stage) in plan.stages.iter().enumerate() {
        set_state(state, AttemptState::Launching);
        let process = Supervised::launch(stage)?;
        set_state(state, AttemptState::Running);
        let outcome = process.wait(Some(cancel), settings.timeout)?;
        require_success(&outcome, stage.label)?;

        // Between extractor and solver, read the extractor's table back so
        // the caller gets an annotatable star list.
        if index + 1 < stage_count {
            if let Some(table) = &plan.extractor_table {
                let stars = read_star_table(table)?;
                info!("{} extracted {} star(s)", stage.label, stars.len());
                extracted = Some(stars);
            }
        }
    }

    if !plan.result_path.exists() {
        return Err(SolverError::ProcessFailure(format!(
            "{} exited cleanly but produced no {}", backend.name(),
            plan.result_path.display())));
    }
    let solution = parse_output(backend, &plan.result_path, width, height)?;
    let transform = WcsTransform::new(&solution);

    let mut stars = match input {
        SolveInput::Stars { stars, .. } => Some(stars.clone()),
        SolveInput::Image { .. } => extracted,
    };
    if let Some(list) = &mut stars {
        transform.annotate_stars(list);
    }
    Ok(SolveOutcome { solution, transform, stars })
}

/// A solve attempt running on its own worker thread, so candidate backends
/// can be attempted concurrently and aborted independently.
pub struct SolveTask {
    cancel: CancelToken,
    state: Arc<Mutex<AttemptState>>,
    worker: Option<JoinHandle<Result<SolveOutcome, SolverError>>>,
}

impl SolveTask {
    pub fn spawn(backend: SolverBackend, input: SolveInput,
                 settings: Arc<SolverSettings>) -> Self {
        let cancel = new_cancel_token();
        let state = Arc::new(Mutex::new(AttemptState::Idle));
        let worker = {
            let cancel = cancel.clone();
            let state = state.clone();
            thread::spawn(move || {
                run_attempt(backend, &input, &settings, &cancel, &state)
            })
        };
        SolveTask { cancel, state, worker: Some(worker) }
    }

    /// Requests abort. Idempotent; a no-op after natural completion.
    pub fn abort(&self) {
        self.cancel.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn state(&self) -> AttemptState {
        *self.state.lock().unwrap()
    }

    /// Waits for the attempt to finish and returns its result.
    pub fn join(mut self) -> Result<SolveOutcome, SolverError> {
        let worker = self.worker.take().unwrap();
        worker.join().map_err(|_| {
            SolverError::ProcessFailure("solve worker panicked".to_string())
        })?
    }
}

impl Drop for SolveTask {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.cancel.store(true, std::sync::atomic::Ordering::Relaxed);
            let _ = worker.join();
        }
    }
}

/// Attempts several backends concurrently and returns the first success,
/// aborting the rest. Sibling aborts never affect the winner.
pub fn race(backends: &[SolverBackend], input: &SolveInput,
            settings: &SolverSettings)
            -> Result<(SolverBackend, SolveOutcome), SolverError> {
    if backends.is_empty() {
        return Err(SolverError::ProcessFailure(
            "no backends to race".to_string()));
    }
    let settings = Arc::new(settings.clone());
    let (tx, rx) = mpsc::channel();
    let mut cancels = Vec::new();
    let mut workers = Vec::new();
    for &backend in backends {
        let cancel = new_cancel_token();
        cancels.push(cancel.clone());
        let tx = tx.clone();
        let input = input.clone();
        let settings = settings.clone();
        workers.push(thread::spawn(move || {
            let state = Mutex::new(AttemptState::Idle);
            let result =
                run_attempt(backend, &input, &settings, &cancel, &state);
            let _ = tx.send((backend, result));
        }));
    }
    drop(tx);

    let mut winner = None;
    let mut last_error = None;
    for (backend, result) in rx {
        match result {
            Ok(outcome) => {
                info!("{} won the race", backend.name());
                for cancel in &cancels {
                    cancel.store(true, std::sync::atomic::Ordering::Relaxed);
                }
                winner = Some((backend, outcome));
                break;
            }
            Err(e) => {
                warn!("{} lost the race: {}", backend.name(), e);
                last_error = Some(e);
            }
        }
    }
    for worker in workers {
        let _ = worker.join();
    }
    match winner {
        Some(win) => Ok(win),
        None => Err(last_error.unwrap_or_else(|| {
            SolverError::ProcessFailure("all backends failed".to_string())
        })),
    }
}

// mod tests.
