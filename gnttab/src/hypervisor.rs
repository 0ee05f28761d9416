//! Cross-domain grant operations
//!
//! [`Hypervisor`] resolves domain IDs through its registry and runs the operations that involve a
//! granting and a mapping domain. It never holds more than one domain's table lock at a time: a
//! mapping pins the granter's active entry under the granter's read lock and records the mapping
//! in the mapper's map-track table, which has its own lock.

use {
    crate::{
        domain::{Domain, DomainRegistry},
        grant_table::{Error, GrantTableConfig, MapFlags, Mapping},
        memory::{MachineAddress, MachineFrameNumber, PageFrameNumber, VirtualAddress},
        platform::Platform,
    },
    alloc::{sync::Arc, vec::Vec},
    core::sync::atomic::{fence, Ordering},
    gnttab_sys::{domid_t, grant_handle_t, grant_ref_t},
    log::{debug, trace, warn},
};

/// Request to map a grant of another domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    /// Where to map the frame, for host mappings
    pub host_addr: VirtualAddress,
    /// Mapping flags
    pub flags: MapFlags,
    /// Grant reference in the granting domain's table
    pub reference: grant_ref_t,
    /// Granting domain
    pub dom: domid_t,
}

/// Result of a successful mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapResult {
    /// Map-track handle naming the mapping
    pub handle: grant_handle_t,
    /// Bus address of the frame for device mappings, zero otherwise
    pub dev_bus_addr: MachineAddress,
}

/// Request to remove a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnmapRequest {
    /// Address the frame is mapped at, for host mappings
    pub host_addr: VirtualAddress,
    /// Bus address returned by the mapping, or zero
    pub dev_bus_addr: MachineAddress,
    /// Map-track handle returned by the mapping
    pub handle: grant_handle_t,
}

/// How a mapping is being removed
#[derive(Debug, Clone, Copy)]
enum Unmap<'a> {
    /// Guest unmap, checked against the request
    Explicit(&'a UnmapRequest),
    /// The page-table entry is already gone
    Implicit,
    /// The mapping domain is being destroyed
    Teardown,
}

/// Grant table engine over all domains
pub struct Hypervisor<P> {
    platform: P,
    domains: DomainRegistry,
    config: GrantTableConfig,
}

impl<P: Platform> Hypervisor<P> {
    /// Creates a hypervisor whose domains get grant tables sized by `config`
    pub fn new(platform: P, config: GrantTableConfig) -> Result<Self, Error> {
        config.validate()?;

        Ok(Self {
            platform,
            domains: DomainRegistry::new(),
            config,
        })
    }

    /// Platform services
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Registered domains
    pub fn domains(&self) -> &DomainRegistry {
        &self.domains
    }

    /// Creates a domain with an empty grant table
    pub fn create_domain(&self, domid: domid_t) -> Result<Arc<Domain>, Error> {
        let domain = self.domains.insert(Domain::new(domid, self.config)?)?;
        debug!("created domain {}", domid);
        Ok(domain)
    }

    /// Looks up a live domain
    pub fn domain(&self, domid: domid_t) -> Result<Arc<Domain>, Error> {
        let domain = self.domains.get(domid)?;
        if domain.is_dying() {
            return Err(Error::DomainDying);
        }
        Ok(domain)
    }

    /// Destroys a domain
    ///
    /// Removes every mapping the domain holds of other domains' grants and refuses any further
    /// mapping of its own grants. The domain stays registered until no other domain pins its
    /// grants.
    pub fn destroy_domain(&self, domid: domid_t) -> Result<(), Error> {
        let domain = self.domains.get(domid)?;
        if !domain.set_dying() {
            return Err(Error::DomainDying);
        }

        let maptrack = domain.grant_table().maptrack();
        let handles = maptrack.live_handles();
        debug!("destroying domain {}, releasing {} mappings", domid, handles.len());

        for handle in handles {
            if let Some(mapping) = maptrack.take(handle) {
                match self.release(domid, &mapping, Unmap::Teardown) {
                    Ok(()) => maptrack.free(handle),
                    Err(e) => {
                        warn!(
                            "domain {} failed to release mapping {} of {}: {}",
                            domid, handle, mapping.owner, e
                        );
                        maptrack.restore(handle, &mapping);
                    }
                }
            }
        }

        self.reap(&domain);

        Ok(())
    }

    /// Unregisters a dying domain once nothing pins its grants
    fn reap(&self, domain: &Domain) {
        fence(Ordering::SeqCst);

        if domain.is_dying()
            && domain.grant_table().nr_active() == 0
            && self.domains.remove(domain.domid()).is_some()
        {
            debug!("domain {} reaped", domain.domid());
        }
    }

    /// Maps a grant of `request.dom` for `caller`
    pub fn map_grant_ref(&self, caller: domid_t, request: &MapRequest) -> Result<MapResult, Error> {
        let flags = request.flags;

        if !flags.intersects(MapFlags::HOST_MAP | MapFlags::DEVICE_MAP) {
            return Err(Error::BadFlags);
        }
        if flags.contains(MapFlags::HOST_MAP) && !request.host_addr.is_page_aligned() {
            return Err(Error::BadVirtualAddress);
        }

        let mapper = self.domain(caller)?;
        let granter = self.domain(request.dom)?;

        let result = self.map_pinned(&mapper, &granter, request);

        // a concurrent teardown skips reaping while the failed attempt holds its pin
        if result.is_err() && granter.is_dying() {
            self.reap(&granter);
        }

        result
    }

    fn map_pinned(
        &self,
        mapper: &Domain,
        granter: &Domain,
        request: &MapRequest,
    ) -> Result<MapResult, Error> {
        let caller = mapper.domid();
        let flags = request.flags;

        let frames = granter.grant_table().frames();
        let active = frames.acquire(request.reference, caller, flags.access())?;

        // teardown may have started before the pin became visible
        fence(Ordering::SeqCst);
        if granter.is_dying() {
            return Err(Error::DomainDying);
        }

        let frame = active.frame();
        if !self.platform.owns_frame(granter.domid(), frame) {
            return Err(Error::BadPage);
        }

        if flags.contains(MapFlags::HOST_MAP) {
            self.platform
                .install_foreign_mapping(caller, request.host_addr, frame, flags)?;
        }

        let mapping = Mapping {
            owner: granter.domid(),
            grant_ref: request.reference,
            flags,
            frame,
            host_addr: request.host_addr,
        };

        let handle = match mapper.grant_table().maptrack().insert(&mapping) {
            Ok(handle) => handle,
            Err(e) => {
                if flags.contains(MapFlags::HOST_MAP) {
                    if let Err(e) = self.platform.remove_mapping(caller, request.host_addr, frame) {
                        warn!("failed to undo mapping at {:#x}: {}", request.host_addr.0, e);
                    }
                }
                return Err(e);
            }
        };

        active.keep();

        trace!(
            "domain {} mapped ref {} of domain {} as handle {}",
            caller,
            request.reference,
            request.dom,
            handle
        );

        Ok(MapResult {
            handle,
            dev_bus_addr: if flags.contains(MapFlags::DEVICE_MAP) {
                MachineAddress::from(frame)
            } else {
                MachineAddress(0)
            },
        })
    }

    /// Maps a batch of grants, attempting every element
    pub fn map_grant_refs(
        &self,
        caller: domid_t,
        requests: &[MapRequest],
    ) -> Vec<Result<MapResult, Error>> {
        requests
            .iter()
            .map(|request| self.map_grant_ref(caller, request))
            .collect()
    }

    /// Maps a batch of grants, or none of them
    ///
    /// On failure the mappings already made are removed and the index of the failing element is
    /// returned with its error.
    pub fn map_grant_refs_all(
        &self,
        caller: domid_t,
        requests: &[MapRequest],
    ) -> Result<Vec<MapResult>, (usize, Error)> {
        let mut results = Vec::with_capacity(requests.len());

        for (i, request) in requests.iter().enumerate() {
            match self.map_grant_ref(caller, request) {
                Ok(result) => results.push(result),
                Err(e) => {
                    for (request, result) in requests.iter().zip(results) {
                        let unmap = UnmapRequest {
                            host_addr: request.host_addr,
                            dev_bus_addr: result.dev_bus_addr,
                            handle: result.handle,
                        };
                        if let Err(e) = self.unmap_grant_ref(caller, &unmap) {
                            warn!("failed to roll back handle {}: {}", result.handle, e);
                        }
                    }
                    return Err((i, e));
                }
            }
        }

        Ok(results)
    }

    /// Removes a mapping `caller` holds
    pub fn unmap_grant_ref(&self, caller: domid_t, request: &UnmapRequest) -> Result<(), Error> {
        let mapper = self.domains.get(caller)?;
        let maptrack = mapper.grant_table().maptrack();

        let mapping = maptrack.take(request.handle).ok_or_else(|| {
            warn!("domain {} unmapping bad handle {}", caller, request.handle);
            Error::BadHandle
        })?;

        match self.release(caller, &mapping, Unmap::Explicit(request)) {
            Ok(()) => {
                maptrack.free(request.handle);
                Ok(())
            }
            Err(e) => {
                maptrack.restore(request.handle, &mapping);
                Err(e)
            }
        }
    }

    /// Removes a batch of mappings, attempting every element
    pub fn unmap_grant_refs(
        &self,
        caller: domid_t,
        requests: &[UnmapRequest],
    ) -> Vec<Result<(), Error>> {
        requests
            .iter()
            .map(|request| self.unmap_grant_ref(caller, request))
            .collect()
    }

    /// Drops the first mapping `caller` holds of `frame` after its page-table entry was replaced
    ///
    /// Returns the handle the mapping had.
    pub fn release_mapping_by_frame(
        &self,
        caller: domid_t,
        frame: MachineFrameNumber,
    ) -> Result<grant_handle_t, Error> {
        let mapper = self.domains.get(caller)?;
        let maptrack = mapper.grant_table().maptrack();

        let handle = maptrack.find_by_frame(frame).ok_or(Error::BadPage)?;
        let mapping = maptrack.take(handle).ok_or(Error::BadHandle)?;

        match self.release(caller, &mapping, Unmap::Implicit) {
            Ok(()) => {
                maptrack.free(handle);
                Ok(handle)
            }
            Err(e) => {
                maptrack.restore(handle, &mapping);
                Err(e)
            }
        }
    }

    /// Unpins the grant behind a mapping taken out of `caller`'s map-track table
    fn release(&self, caller: domid_t, mapping: &Mapping, kind: Unmap<'_>) -> Result<(), Error> {
        let host_map = mapping.flags.contains(MapFlags::HOST_MAP);

        if let Unmap::Explicit(request) = kind {
            if host_map && request.host_addr != mapping.host_addr {
                return Err(Error::BadVirtualAddress);
            }
            if request.dev_bus_addr.0 != 0
                && request.dev_bus_addr != MachineAddress::from(mapping.frame)
            {
                return Err(Error::BadDeviceAddress);
            }
        }

        let granter = self.domains.get(mapping.owner)?;

        {
            let frames = granter.grant_table().frames();
            let active = frames.active_entry(mapping.grant_ref);

            assert_eq!(
                active.frame(),
                mapping.frame,
                "mapping of grant {} disagrees with its active entry",
                mapping.grant_ref
            );

            if host_map {
                match kind {
                    Unmap::Explicit(_) => {
                        self.platform
                            .remove_mapping(caller, mapping.host_addr, mapping.frame)?
                    }
                    Unmap::Teardown => {
                        if let Err(e) =
                            self.platform
                                .remove_mapping(caller, mapping.host_addr, mapping.frame)
                        {
                            warn!(
                                "domain {} stale mapping at {:#x}: {}",
                                caller, mapping.host_addr.0, e
                            );
                        }
                    }
                    Unmap::Implicit => (),
                }
            }

            active.release(mapping.flags.access());
        }

        trace!(
            "domain {} unmapped ref {} of domain {}",
            caller,
            mapping.grant_ref,
            mapping.owner
        );

        if granter.is_dying() {
            self.reap(&granter);
        }

        Ok(())
    }

    /// Surrenders `caller`'s frame `pfn` and offers to receive a frame from `domid` in its place
    pub fn grant_foreign_transfer(
        &self,
        caller: domid_t,
        domid: domid_t,
        pfn: PageFrameNumber,
    ) -> Result<grant_ref_t, Error> {
        let domain = self.domain(caller)?;
        // guests are not translated, pseudo-physical and machine frames coincide
        let frame = MachineFrameNumber(pfn.0);

        self.surrender(&domain, frame)?;

        match domain.grant_table().grant_foreign_transfer(domid, pfn) {
            Ok(reference) => Ok(reference),
            Err(e) => {
                if self.platform.increase_reservation(caller, frame).is_err() {
                    warn!("domain {} lost frame {:#x}", caller, frame.0);
                }
                Err(e)
            }
        }
    }

    /// Transfers `sender`'s `frame` into the accept-transfer grant `reference` of `receiver`
    pub fn transfer(
        &self,
        sender: domid_t,
        frame: MachineFrameNumber,
        receiver: domid_t,
        reference: grant_ref_t,
    ) -> Result<(), Error> {
        let source = self.domain(sender)?;
        let target = self.domain(receiver)?;

        self.surrender(&source, frame)?;

        let result = target
            .grant_table()
            .receive_transfer(reference, sender, frame, || {
                self.platform
                    .increase_reservation(receiver, frame)
                    .map_err(|_| Error::TransferFailed)
            });

        if let Err(e) = result {
            if self.platform.increase_reservation(sender, frame).is_err() {
                warn!("domain {} lost frame {:#x}", sender, frame.0);
            }
            return Err(e);
        }

        debug!(
            "transferred frame {:#x} from domain {} to domain {}",
            frame.0, sender, receiver
        );

        Ok(())
    }

    /// Takes `frame` out of the reservation of `domain`
    ///
    /// Refused with [`Error::StillInUse`] while one of the domain's grants pins the frame. The
    /// frame leaves the reservation before the pins are checked, so a use pinned afterwards fails
    /// its ownership check instead.
    fn surrender(&self, domain: &Domain, frame: MachineFrameNumber) -> Result<(), Error> {
        let domid = domain.domid();

        self.platform
            .decrease_reservation(domid, frame)
            .map_err(|e| {
                warn!("domain {} cannot give up frame {:#x}: {}", domid, frame.0, e);
                Error::TransferFailed
            })?;

        if domain.grant_table().is_frame_pinned(frame) {
            warn!("domain {} giving up granted frame {:#x}", domid, frame.0);
            if self.platform.increase_reservation(domid, frame).is_err() {
                warn!("domain {} lost frame {:#x}", domid, frame.0);
            }
            return Err(Error::StillInUse);
        }

        Ok(())
    }

    /// Completes `caller`'s accept-transfer grant `reference`
    pub fn accept_transfer(
        &self,
        caller: domid_t,
        reference: grant_ref_t,
    ) -> Result<Option<MachineFrameNumber>, Error> {
        self.domain(caller)?.grant_table().accept_transfer(reference)
    }

    /// Grows the grant table of `domid` to `nr_frames` and returns the frames backing it
    pub fn setup_table(&self, domid: domid_t, nr_frames: usize) -> Result<Vec<MachineFrameNumber>, Error> {
        let domain = self.domain(domid)?;
        domain.grant_table().grow(nr_frames)?;
        Ok(domain.grant_table().frame_list(nr_frames))
    }

    /// Current and maximum number of grant frames of `domid`
    pub fn query_size(&self, domid: domid_t) -> Result<(usize, usize), Error> {
        Ok(self.domains.get(domid)?.grant_table().query_size())
    }

    /// Logs the grant table of `domid`
    pub fn dump_table(&self, domid: domid_t) -> Result<(), Error> {
        self.domains.get(domid)?.grant_table().dump();
        Ok(())
    }
}
