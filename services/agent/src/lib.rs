//! nodepool agent library
//!
//! The agent owns the resource pool of a testbed. Owners reserve resources
//! for a time window, configure them, and the reconciliation loop drives
//! every resource through the deploy, destroy and reboot processes declared
//! in the catalog.
//!
//! ## Modules
//!
//! - `allocator`: First-fit reservation of resources matching a filter
//! - `control`: User and admin operations (reserve, deploy, destroy, ...)
//! - `driver`: Registry of step implementations, plus the fake driver
//! - `reconciler`: One transactional tick over every action
//! - `state`: SQLite persistence for resources, reservations and actions
//! - `worker`: Periodic loop around the reconciler

pub mod allocator;
pub mod config;
pub mod control;
pub mod driver;
pub mod reconciler;
pub mod state;
pub mod worker;
