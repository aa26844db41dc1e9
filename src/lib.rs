// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Dispatches astrometric plate solving to external solving engines and
//! normalizes their results into one canonical solution with a
//! bidirectional pixel/sky transform.

pub mod artifacts;
pub mod attempt;
pub mod backend;
pub mod config_file;
pub mod error;
pub mod fits;
pub mod parser;
pub mod settings;
pub mod solution;
pub mod star_table;
pub mod supervisor;
pub mod wcs_transform;

pub use attempt::{race, solve, solve_with_cancel, AttemptState,
                  SolveOutcome, SolveTask};
pub use error::SolverError;
pub use settings::{PositionHint, ScaleHint, ScaleUnits, SolveInput,
                   SolverBackend, SolverSettings};
pub use solution::{ImagePos, Parity, SkyCoord, Solution, StarRecord};
pub use supervisor::{new_cancel_token, CancelToken};
pub use wcs_transform::WcsTransform;
