//! Hypervisor grant table engine
//!
//! Grant tables let a domain share frames with, or hand frames over to, another domain without
//! trusting it with direct memory access. Every domain owns a [`GrantTable`](grant_table::GrantTable)
//! made of the shared entries it writes, the active entries the hypervisor keeps while a grant is
//! in use, and the map-track table recording the mappings it holds of other domains' frames.
//!
//! Locks are always taken in the order: table lock, active entry lock, free-list lock. Operations
//! spanning two domains hold at most one table lock at a time.

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

extern crate alloc;

pub use {
    domain::{Domain, DomainRegistry},
    gnttab_sys,
    hypervisor::{Hypervisor, MapRequest, MapResult, UnmapRequest},
};

pub mod domain;
pub mod grant_table;
pub mod hypervisor;
pub mod memory;
pub mod platform;
pub mod sim;
