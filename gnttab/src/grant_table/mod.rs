//! Per-domain grant tables
//!
//! "The grant table mechanism [..] allows memory pages to be transferred or shared between virtual machines"
//!
//! A [`GrantTable`] holds the shared entries its domain writes to grant frames, the active
//! entries pinned while other domains use those grants, and the map-track table of the mappings
//! its domain holds of other domains' frames. The shared and active entries sit behind one
//! reader/writer lock; only growth takes it for writing.

use {
    crate::memory::{MachineFrameNumber, PageFrameNumber},
    core::{
        convert::{TryFrom, TryInto},
        sync::atomic::{AtomicUsize, Ordering},
    },
    gnttab_sys::{domid_t, grant_handle_t, grant_ref_t},
    log::{debug, trace, warn},
    spin::{Mutex, RwLock, RwLockReadGuard},
};

pub use {
    active::{Access, ACTIVE_ENTRIES_PER_FRAME},
    config::GrantTableConfig,
    error::{check_status, Error, GrantStatusError},
    free_list::{Reservation, GNTTAB_LIST_END, NUM_RESERVED_ENTRIES},
    maptrack::{MapFlags, Mapping, MAPTRACK_ENTRIES_PER_FRAME},
    shared::{GrantFlags, SharedStatus, SHARED_ENTRIES_PER_FRAME},
};

mod active;
mod config;
mod error;
mod free_list;
mod maptrack;
pub mod operations;
mod shared;

use {
    active::{ActiveEntryHandle, ActiveTable},
    free_list::RefFreeList,
    maptrack::MapTrack,
    shared::{SharedEntry, SharedStore},
};

/// Shared and active entries, resized together
pub(crate) struct GrantFrames {
    shared: SharedStore,
    active: ActiveTable,
}

impl GrantFrames {
    /// Pins the grant `reference` for a use by `domid`
    pub(crate) fn acquire(
        &self,
        reference: grant_ref_t,
        domid: domid_t,
        access: Access,
    ) -> Result<ActiveEntryHandle<'_>, Error> {
        let shared = self
            .shared
            .entry(reference)
            .ok_or(Error::InvalidReference)?;

        self.active.acquire(shared, reference, domid, access)
    }

    /// Locks the active entry of a grant the caller holds a pin on
    pub(crate) fn active_entry(&self, reference: grant_ref_t) -> ActiveEntryHandle<'_> {
        let shared = self
            .shared
            .entry(reference)
            .unwrap_or_else(|| panic!("pinned grant reference {} out of range", reference));

        self.active.lookup(shared, reference)
    }

    fn shared_entry(&self, reference: grant_ref_t) -> Result<&SharedEntry, Error> {
        self.shared.entry(reference).ok_or(Error::InvalidReference)
    }
}

/// Source of table instance numbers
static NEXT_TABLE: AtomicUsize = AtomicUsize::new(0);

/// Grant table of one domain
pub struct GrantTable {
    domid: domid_t,
    instance: usize,
    config: GrantTableConfig,
    frames: RwLock<GrantFrames>,
    free_refs: Mutex<RefFreeList>,
    maptrack: MapTrack,
}

impl GrantTable {
    /// Creates the grant table of `domid` with `config.initial_frames` grant frames
    pub fn new(domid: domid_t, config: GrantTableConfig) -> Result<Self, Error> {
        config.validate()?;

        let instance = NEXT_TABLE.fetch_add(1, Ordering::Relaxed);

        let table = Self {
            domid,
            instance,
            config,
            frames: RwLock::new(GrantFrames {
                shared: SharedStore::default(),
                active: ActiveTable::default(),
            }),
            free_refs: Mutex::new(RefFreeList::new(domid, instance)),
            maptrack: MapTrack::new(config.max_maptrack_frames),
        };

        table.grow(config.initial_frames)?;

        Ok(table)
    }

    /// Domain owning the table
    pub fn domid(&self) -> domid_t {
        self.domid
    }

    /// Limits the table was created with
    pub fn config(&self) -> GrantTableConfig {
        self.config
    }

    pub(crate) fn frames(&self) -> RwLockReadGuard<'_, GrantFrames> {
        self.frames.read()
    }

    pub(crate) fn maptrack(&self) -> &MapTrack {
        &self.maptrack
    }

    /// Whether the table is being grown
    pub fn is_growing(&self) -> bool {
        self.frames.writer_count() != 0
    }

    /// Current number of grant frames
    pub fn nr_frames(&self) -> usize {
        self.frames.read().shared.nr_frames()
    }

    /// Current and maximum number of grant frames
    pub fn query_size(&self) -> (usize, usize) {
        (self.nr_frames(), self.config.max_grant_frames)
    }

    /// Grows the table to `nr_frames` grant frames
    ///
    /// Does nothing if the table is already that large.
    pub fn grow(&self, nr_frames: usize) -> Result<(), Error> {
        if nr_frames > self.config.max_grant_frames {
            return Err(Error::ExhaustedPool);
        }

        let mut frames = self.frames.write();
        let old = frames.shared.nr_frames();
        if old >= nr_frames {
            return Ok(());
        }

        while frames.shared.nr_frames() < nr_frames {
            frames.shared.add_frame();
            frames.active.add_frame();
        }

        self.free_refs.lock().extend(frames.shared.nr_entries());

        debug!(
            "domain {} grant table grown from {} to {} frames",
            self.domid, old, nr_frames
        );

        Ok(())
    }

    fn get_free_entry(&self) -> Result<grant_ref_t, Error> {
        loop {
            let result = self.free_refs.lock().get_free_entry();
            match result {
                Err(Error::TableGrowthRequired) => self
                    .grow(self.nr_frames() + 1)
                    .map_err(|_| Error::ExhaustedPool)?,
                result => return result,
            }
        }
    }

    fn put_free_entry(&self, reference: grant_ref_t) -> Result<(), Error> {
        if reference < NUM_RESERVED_ENTRIES {
            return Ok(());
        }
        self.free_refs.lock().put_free_entry(reference)
    }

    fn write_entry(
        &self,
        reference: grant_ref_t,
        domid: domid_t,
        frame: usize,
        flags: GrantFlags,
    ) -> Result<(), Error> {
        let frame = u32::try_from(frame).map_err(|_| Error::BadPage)?;

        self.frames()
            .shared_entry(reference)?
            .write(domid, frame, flags)?;

        trace!(
            "domain {} granting {:?} {} {:#x} {}",
            self.domid,
            flags,
            domid,
            frame,
            reference
        );

        Ok(())
    }

    /// Grants `domid` access to `frame`, returning the new grant reference
    pub fn grant_foreign_access(
        &self,
        domid: domid_t,
        frame: MachineFrameNumber,
        readonly: bool,
    ) -> Result<grant_ref_t, Error> {
        let reference = self.get_free_entry()?;

        if let Err(e) = self.grant_foreign_access_ref(reference, domid, frame, readonly) {
            self.put_free_entry(reference)?;
            return Err(e);
        }

        Ok(reference)
    }

    /// Grants `domid` access to `frame` through an already allocated `reference`
    pub fn grant_foreign_access_ref(
        &self,
        reference: grant_ref_t,
        domid: domid_t,
        frame: MachineFrameNumber,
        readonly: bool,
    ) -> Result<(), Error> {
        let flags = if readonly {
            GrantFlags::PERMIT_ACCESS | GrantFlags::READONLY
        } else {
            GrantFlags::PERMIT_ACCESS
        };

        self.write_entry(reference, domid, frame.0, flags)
    }

    /// Offers to receive a frame from `domid` in place of `pfn`, returning the new grant reference
    pub fn grant_foreign_transfer(
        &self,
        domid: domid_t,
        pfn: PageFrameNumber,
    ) -> Result<grant_ref_t, Error> {
        let reference = self.get_free_entry()?;

        if let Err(e) = self.grant_foreign_transfer_ref(reference, domid, pfn) {
            self.put_free_entry(reference)?;
            return Err(e);
        }

        Ok(reference)
    }

    /// Offers to receive a frame from `domid` through an already allocated `reference`
    pub fn grant_foreign_transfer_ref(
        &self,
        reference: grant_ref_t,
        domid: domid_t,
        pfn: PageFrameNumber,
    ) -> Result<(), Error> {
        self.write_entry(reference, domid, pfn.0, GrantFlags::ACCEPT_TRANSFER)
    }

    /// Withdraws the grant `reference` and returns it to the free pool
    ///
    /// Fails with [`Error::StillInUse`] while any remote use is pinned; live mappings are never
    /// revoked. `readonly` only records how the grant was made.
    pub fn end_foreign_access(&self, reference: grant_ref_t, readonly: bool) -> Result<(), Error> {
        if let Err(e) = self.frames().shared_entry(reference)?.end_access() {
            warn!(
                "domain {} ending {} grant {} still in use",
                self.domid,
                if readonly { "read-only" } else { "writable" },
                reference
            );
            return Err(e);
        }

        self.put_free_entry(reference)
    }

    /// Whether a remote domain is using the grant `reference`
    pub fn query_foreign_access(&self, reference: grant_ref_t) -> Result<bool, Error> {
        Ok(self
            .frames()
            .shared_entry(reference)?
            .read_status()
            .flags
            .in_use())
    }

    /// Completes the accept-transfer grant `reference` and returns it to the free pool
    ///
    /// Returns the received frame, or `None` if nothing was transferred.
    pub fn accept_transfer(
        &self,
        reference: grant_ref_t,
    ) -> Result<Option<MachineFrameNumber>, Error> {
        let frame = self.frames().shared_entry(reference)?.accept_transfer()?;

        self.put_free_entry(reference)?;

        Ok(frame.map(|frame| {
            MachineFrameNumber(frame.try_into().expect("Failed to convert u32 to usize"))
        }))
    }

    /// Receives `frame` from `sender` into the accept-transfer grant `reference`
    ///
    /// `assign` hands ownership of the frame to this domain once the entry is committed; the
    /// entry is released again if it fails.
    pub(crate) fn receive_transfer<F>(
        &self,
        reference: grant_ref_t,
        sender: domid_t,
        frame: MachineFrameNumber,
        assign: F,
    ) -> Result<(), Error>
    where
        F: FnOnce() -> Result<(), Error>,
    {
        let value = u32::try_from(frame.0).map_err(|_| Error::BadPage)?;

        let frames = self.frames();
        let entry = frames.shared_entry(reference)?;

        entry.commit_transfer(sender)?;

        if let Err(e) = assign() {
            entry.abort_transfer();
            return Err(e);
        }

        entry.complete_transfer(value);

        trace!(
            "domain {} received frame {:#x} from {} in {}",
            self.domid,
            frame.0,
            sender,
            reference
        );

        Ok(())
    }

    /// Frames backing the first `nr_frames` grant frames
    pub fn frame_list(&self, nr_frames: usize) -> alloc::vec::Vec<MachineFrameNumber> {
        let mut list = self.frames().shared.frame_numbers();
        list.truncate(nr_frames);
        list
    }

    /// Withdraws `count` free references into a private reservation
    ///
    /// Grows the table if the pool is short, and fails with [`Error::ExhaustedPool`] if that is
    /// not possible.
    pub fn alloc_grant_references(&self, count: usize) -> Result<Reservation, Error> {
        loop {
            let result = self.free_refs.lock().reserve(count);
            match result {
                Err(Error::ExhaustedPool) => self.grow(self.nr_frames() + 1)?,
                result => return result,
            }
        }
    }

    fn check_reservation(&self, reservation: &Reservation) -> Result<(), Error> {
        if reservation.domid() != self.domid || reservation.table() != self.instance {
            return Err(Error::InvalidReference);
        }
        Ok(())
    }

    /// Takes one reference out of a reservation
    pub fn claim_grant_reference(&self, reservation: &mut Reservation) -> Result<grant_ref_t, Error> {
        self.check_reservation(reservation)?;
        self.free_refs.lock().claim(reservation)
    }

    /// Returns a claimed reference to its reservation
    pub fn release_grant_reference(
        &self,
        reservation: &mut Reservation,
        reference: grant_ref_t,
    ) -> Result<(), Error> {
        self.check_reservation(reservation)?;
        self.free_refs
            .lock()
            .release_to_reservation(reservation, reference)
    }

    /// Returns the unclaimed references of a reservation to the free pool
    pub fn free_grant_references(&self, count: usize, reservation: Reservation) -> Result<(), Error> {
        self.check_reservation(&reservation)?;
        self.free_refs.lock().free_reservation(count, reservation);
        Ok(())
    }

    /// Number of references in the free pool
    pub fn free_count(&self) -> usize {
        self.free_refs.lock().free_count()
    }

    /// Current contents of the shared entry `reference`
    pub fn read_status(&self, reference: grant_ref_t) -> Result<SharedStatus, Error> {
        Ok(self.frames().shared_entry(reference)?.read_status())
    }

    /// Number of remote uses pinning the grant `reference`
    pub fn pin_count(&self, reference: grant_ref_t) -> Result<u32, Error> {
        let frames = self.frames();
        let shared = frames.shared_entry(reference)?;
        Ok(frames.active.pin_count(shared, reference))
    }

    /// Whether a remote use pins a grant of `frame`
    pub fn is_frame_pinned(&self, frame: MachineFrameNumber) -> bool {
        self.frames().active.pins_frame(frame)
    }

    /// Number of grants with an active entry
    pub fn nr_active(&self) -> usize {
        self.frames().active.nr_active()
    }

    /// Mapping of another domain's grant held under `handle`
    pub fn mapping(&self, handle: grant_handle_t) -> Option<Mapping> {
        self.maptrack.lookup(handle)
    }

    /// Handles of all mappings this domain holds
    pub fn mappings(&self) -> alloc::vec::Vec<grant_handle_t> {
        self.maptrack.live_handles()
    }

    /// Number of map-track frames allocated
    pub fn nr_maptrack_frames(&self) -> usize {
        self.maptrack.nr_frames()
    }

    /// Logs the live entries of the table
    pub fn dump(&self) {
        let frames = self.frames();

        debug!(
            "domain {} grant table: {} frames, {} active entries",
            self.domid,
            frames.shared.nr_frames(),
            frames.active.nr_active()
        );

        for (reference, entry) in frames.shared.iter() {
            let status = entry.read_status();
            if status.flags.is_empty() {
                continue;
            }

            debug!(
                "  [{:4}] dom {:5} frame {:#x} flags {:?} pin {}",
                reference,
                status.domid,
                status.frame,
                status.flags,
                frames.active.pin_count(entry, reference)
            );
        }

        for handle in self.maptrack.live_handles() {
            if let Some(mapping) = self.maptrack.lookup(handle) {
                debug!(
                    "  maptrack {} dom {} ref {} frame {:#x} {:?}",
                    handle, mapping.owner, mapping.grant_ref, mapping.frame.0, mapping.flags
                );
            }
        }
    }
}
