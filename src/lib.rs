//! autoforge: drives a multi-phase software build against a fixed set of
//! project contracts. Each phase is planned, generated file by file,
//! audited, checked by governance rules, verified and committed before the
//! next one starts.

pub mod blocks;
pub mod build;
pub mod commands;
pub mod config;
pub mod contracts;
pub mod errors;
pub mod events;
pub mod governance;
pub mod logging;
pub mod manifest;
pub mod orchestrator;
pub mod phase;
pub mod provider;
pub mod recovery;
pub mod registry;
pub mod service;
pub mod store;
pub mod syntax;
pub mod watchdog;
pub mod workspace;
