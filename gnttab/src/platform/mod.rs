//! Platform services consumed by the grant table engine

use {
    crate::{
        grant_table::{Error, MapFlags},
        memory::{MachineFrameNumber, VirtualAddress},
    },
    gnttab_sys::domid_t,
};

pub mod consts;

/// Page-table and memory reservation services provided by the rest of the hypervisor
///
/// Implementations are called with a table lock and an active entry lock held, so they must not
/// call back into the engine.
pub trait Platform: Send + Sync {
    /// Whether `domain` currently owns `frame`
    fn owns_frame(&self, domain: domid_t, frame: MachineFrameNumber) -> bool;

    /// Maps `frame` at `host_addr` in the address space of `domain`
    fn install_foreign_mapping(
        &self,
        domain: domid_t,
        host_addr: VirtualAddress,
        frame: MachineFrameNumber,
        flags: MapFlags,
    ) -> Result<(), Error>;

    /// Removes the mapping of `frame` at `host_addr` from the address space of `domain`
    fn remove_mapping(
        &self,
        domain: domid_t,
        host_addr: VirtualAddress,
        frame: MachineFrameNumber,
    ) -> Result<(), Error>;

    /// Adds `frame` to the reservation of `domain`, making it the owner
    fn increase_reservation(&self, domain: domid_t, frame: MachineFrameNumber)
        -> Result<(), Error>;

    /// Removes `frame` from the reservation of `domain`
    ///
    /// Must fail while anything else still references the frame, such as a foreign page-table
    /// mapping. Uses through the domain's own grants are checked by the engine after the frame
    /// has left the reservation.
    fn decrease_reservation(&self, domain: domid_t, frame: MachineFrameNumber)
        -> Result<(), Error>;
}
