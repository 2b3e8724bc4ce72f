//! kubext - extension installation and multi-cluster rollout controller
//!
//! Reconciles `InstallPlan` resources: installs, upgrades and uninstalls an
//! extension's Helm chart on the host cluster and on selected member clusters.

pub mod config;
pub mod controller;
pub mod crd;
pub mod server;
