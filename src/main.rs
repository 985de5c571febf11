//! runtime-operator entry point
//!
//! Starts the ApplicationDefinition controller.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kube::CustomResourceExt;
use runtime_operator::controller;
use runtime_operator::crd::ApplicationDefinition;
use runtime_operator::settings::Settings;
use runtime_operator::strategy::StrategyRegistry;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    let settings = Settings::parse();

    if settings.crdgen {
        let crd = serde_yaml::to_string(&ApplicationDefinition::crd())
            .context("failed to render the ApplicationDefinition CRD")?;
        println!("{crd}");
        return Ok(());
    }

    info!(
        "Starting runtime-operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Initialize Kubernetes client
    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    info!("Connected to Kubernetes cluster");

    // Strategies register before the reconciler is constructed.
    let registry = Arc::new(StrategyRegistry::builtin());

    let state = Arc::new(controller::ControllerState::new(
        client, settings, registry,
    ));

    controller::run_controller(state)
        .await
        .context("controller exited with an error")
}
