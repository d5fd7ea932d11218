//! Semester progression and validation engine.
//!
//! Students move through a fixed pipeline of ten semester cohorts per
//! academic year. Attendance and coursework feed a per-cohort progress
//! record; reviewers (or the auto-validation sweep) decide on it, and the
//! progression sweep moves validated students into their next cohort.

pub mod attendance;
pub mod config;
pub mod criteria;
pub mod db;
pub mod error;
pub mod models;
pub mod progress;
pub mod registry;
pub mod report;
pub mod risk;
pub mod semester;
pub mod store;
pub mod validation;

pub use error::{Error, Result};
