//! runtime-operator: Kubernetes operator for composite applications
//!
//! Reconciles user-authored ApplicationDefinition resources into
//! workload, networking, storage and identity resources, reporting a
//! lifecycle phase, per-component health and structured change-events.

pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod settings;
pub mod strategy;

pub use crate::error::{Error, Result};
