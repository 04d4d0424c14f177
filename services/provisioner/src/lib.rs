//! berth provisioner library.
//!
//! The crate ships a `provisioner` binary, but the decision engine lives
//! here so it can be driven from tests and from other transports.
//!
//! A provisioning request flows through:
//! - [`ledger::EntitlementLedger`] to reserve one activation of a purchased plan
//! - [`locations::LocationCapacityIndex`] to check the chosen location and pick a node
//! - [`allocations::NodeAllocationPicker`] to claim a free allocation on that node
//! - [`spec_builder::ProvisioningSpecBuilder`] to resolve the concrete server spec
//! - [`creation::CreationService`] to hand the spec to the panel
//!
//! [`orchestrator::Orchestrator`] sequences those steps and undoes every claim
//! when a later step fails.

pub mod allocations;
pub mod api;
pub mod config;
pub mod creation;
pub mod db;
pub mod error;
pub mod ledger;
pub mod locations;
pub mod model;
pub mod orchestrator;
pub mod random;
pub mod spec_builder;
pub mod state;
pub mod store;

pub use error::{ProvisionError, ProvisionResult};
pub use orchestrator::Orchestrator;
