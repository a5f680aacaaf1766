//! Reconcilers for the Volume Data Source Validator
//!
//! This module contains the validation logic run for each PVC. Reconcilers
//! only read cached state; retry and side effect decisions belong to the
//! controller.

pub mod data_source;
