//! In-memory platform
//!
//! Tracks frame ownership, per-domain reservations and foreign mappings in hash maps, standing in
//! for the page-table and memory reservation layers on a host.

use {
    crate::{
        grant_table::{Error, MapFlags},
        memory::{MachineFrameNumber, VirtualAddress},
        platform::Platform,
    },
    gnttab_sys::domid_t,
    hashbrown::HashMap,
    log::trace,
    spin::Mutex,
};

#[derive(Debug, Clone, Copy)]
struct Allocation {
    tot_pages: usize,
    max_pages: usize,
}

#[derive(Debug, Default)]
struct SimState {
    owners: HashMap<MachineFrameNumber, domid_t>,
    domains: HashMap<domid_t, Allocation>,
    mappings: HashMap<(domid_t, VirtualAddress), MachineFrameNumber>,
}

/// Platform backed by in-memory bookkeeping
#[derive(Debug, Default)]
pub struct SimPlatform {
    state: Mutex<SimState>,
}

impl SimPlatform {
    /// Creates a platform with no domains
    pub fn new() -> Self {
        Self::default()
    }

    /// Gives `domain` a memory reservation of at most `max_pages` frames
    pub fn add_domain(&self, domain: domid_t, max_pages: usize) {
        self.state.lock().domains.insert(
            domain,
            Allocation {
                tot_pages: 0,
                max_pages,
            },
        );
    }

    /// Hands `frames` to `domain`
    pub fn populate<I: IntoIterator<Item = MachineFrameNumber>>(
        &self,
        domain: domid_t,
        frames: I,
    ) -> Result<(), Error> {
        frames
            .into_iter()
            .try_for_each(|frame| self.increase_reservation(domain, frame))
    }

    /// Current owner of `frame`
    pub fn owner(&self, frame: MachineFrameNumber) -> Option<domid_t> {
        self.state.lock().owners.get(&frame).copied()
    }

    /// Frame mapped at `host_addr` in `domain`
    pub fn mapping(&self, domain: domid_t, host_addr: VirtualAddress) -> Option<MachineFrameNumber> {
        self.state.lock().mappings.get(&(domain, host_addr)).copied()
    }

    /// Number of foreign mappings installed in `domain`
    pub fn nr_mappings(&self, domain: domid_t) -> usize {
        self.state
            .lock()
            .mappings
            .keys()
            .filter(|(mapper, _)| *mapper == domain)
            .count()
    }

    /// Number of frames owned by `domain`
    pub fn tot_pages(&self, domain: domid_t) -> usize {
        self.state
            .lock()
            .domains
            .get(&domain)
            .map_or(0, |allocation| allocation.tot_pages)
    }

    /// Overwrites whatever `domain` maps at `host_addr`, as a guest page-table write would
    ///
    /// Returns the foreign frame that was mapped there, which the caller must hand to
    /// [`Hypervisor::release_mapping_by_frame`](crate::Hypervisor::release_mapping_by_frame).
    pub fn clobber_mapping(
        &self,
        domain: domid_t,
        host_addr: VirtualAddress,
    ) -> Option<MachineFrameNumber> {
        self.state.lock().mappings.remove(&(domain, host_addr))
    }
}

impl Platform for SimPlatform {
    fn owns_frame(&self, domain: domid_t, frame: MachineFrameNumber) -> bool {
        self.owner(frame) == Some(domain)
    }

    fn install_foreign_mapping(
        &self,
        domain: domid_t,
        host_addr: VirtualAddress,
        frame: MachineFrameNumber,
        flags: MapFlags,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();

        if state.mappings.contains_key(&(domain, host_addr)) {
            return Err(Error::PageTable);
        }
        state.mappings.insert((domain, host_addr), frame);

        trace!(
            "domain {} mapped frame {:#x} at {:#x} {:?}",
            domain,
            frame.0,
            host_addr.0,
            flags
        );

        Ok(())
    }

    fn remove_mapping(
        &self,
        domain: domid_t,
        host_addr: VirtualAddress,
        frame: MachineFrameNumber,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();

        match state.mappings.get(&(domain, host_addr)) {
            Some(mapped) if *mapped == frame => {
                state.mappings.remove(&(domain, host_addr));
                Ok(())
            }
            _ => Err(Error::PageTable),
        }
    }

    fn increase_reservation(&self, domain: domid_t, frame: MachineFrameNumber) -> Result<(), Error> {
        let mut state = self.state.lock();

        if state.owners.contains_key(&frame) {
            return Err(Error::TransferFailed);
        }

        let allocation = state
            .domains
            .get_mut(&domain)
            .ok_or(Error::BadDomain)?;
        if allocation.tot_pages >= allocation.max_pages {
            return Err(Error::TransferFailed);
        }
        allocation.tot_pages += 1;

        state.owners.insert(frame, domain);

        Ok(())
    }

    fn decrease_reservation(&self, domain: domid_t, frame: MachineFrameNumber) -> Result<(), Error> {
        let mut state = self.state.lock();

        if state.owners.get(&frame) != Some(&domain) {
            return Err(Error::BadPage);
        }
        if state.mappings.values().any(|mapped| *mapped == frame) {
            return Err(Error::StillInUse);
        }

        state.owners.remove(&frame);
        if let Some(allocation) = state.domains.get_mut(&domain) {
            allocation.tot_pages -= 1;
        }

        Ok(())
    }
}
