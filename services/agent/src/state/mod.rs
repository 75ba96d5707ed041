//! Durable state for the resource pool.
//!
//! This module provides SQLite-based storage for:
//! - Resources and their matchable properties
//! - Reservations (resource, owner, window)
//! - In-flight actions, one per resource
//! - Action properties shared between driver steps
//!
//! Every read and write goes through [`Store::transaction`], which serializes
//! callers so that allocation and reconciliation never interleave.

mod store;

pub use store::{
    Reservation, ReservationStatus, Resource, ResourceStatus, Store, StoreError, StoreTx,
};
