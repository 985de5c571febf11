//! Custom Resource Definitions for the runtime operator
//!
//! This module defines the ApplicationDefinition CRD and the recognized
//! component configuration schema.

mod application;
mod config;
mod types;

pub use application::{
    ApplicationComponent, ApplicationDefinition, ApplicationDefinitionSpec,
    ApplicationDefinitionStatus, ComponentStatusReference,
};
pub use config::*;
pub use types::*;
