//! SIRV compartmental epidemic model with vital dynamics and vaccination,
//! integrated by an adaptive stiff/non-stiff multistep solver.

pub mod config;
pub mod error;
pub mod grid;
pub mod manager;
pub mod model;
pub mod sink;
pub mod solver;
pub mod sweep;
pub mod trajectory;
