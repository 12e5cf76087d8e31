//! Confgate - reverse-proxy configuration orchestrator
//!
//! Hosts, upstreams and certificates live in SQLite. Changing one enqueues a
//! task on a single-worker queue which then:
//! - Renders the entity's nginx template and writes its config file
//! - Reloads nginx and records `ok` or `error` on the entity
//! - Issues certificates through acme.sh and records `provided` or `failed`
//! - Periodically re-discovers certificates still waiting to be requested

pub mod acme;
pub mod certificates;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod jobs;
pub mod models;
pub mod nginx;
pub mod process;
pub mod queue;
pub mod template;
