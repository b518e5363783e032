//! Core provisioning logic
//!
//! Profiles, the ledger, the two device engines and the orchestrator that
//! sequences them. Host access goes through the traits in [`crate::infra`].
//!
//! # Submodules
//!
//! - [`profile`] - Product profiles and the profile registry
//! - [`matcher`] - Response matchers, value parsers and expected values
//! - [`template`] - `{variable}` substitution
//! - [`ledger`] - Traceability ledger and per-serial locks
//! - [`provisioning`] - Command/response provisioning engine
//! - [`verification`] - Post-provisioning verification engine
//! - [`session`] - Session context, states and reports
//! - [`orchestrator`] - Session state machine
//! - [`settings`] - Station settings

pub mod ledger;
pub mod matcher;
pub mod orchestrator;
pub mod profile;
pub mod provisioning;
pub mod session;
pub mod settings;
pub mod template;
pub mod verification;
