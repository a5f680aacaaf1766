//! Volume Data Source Validator
//!
//! A Kubernetes controller that checks the `dataSourceRef` of every PVC
//! against the registered VolumePopulators and raises a warning event when
//! nothing can populate it. It never blocks or mutates the PVC.

pub mod cache;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod queue;
pub mod reconcilers;

pub use error::{Error, Result};
