//! Map-track table
//!
//! Every live mapping a domain holds of another domain's grant is recorded in the mapping
//! domain's map-track table, and the index of its entry is the handle returned to the guest.
//!
//! The state word of an entry packs a generation count above the map flags. An entry is filled in
//! first and published by a release store of its state, so readers that acquire-load a live state
//! see a complete entry. Removal first moves the entry to a taken state, which only the remover
//! may leave again, either by restoring the mapping or by returning the slot to the free list.

use {
    super::{active::Access, Error},
    crate::{
        memory::{MachineFrameNumber, VirtualAddress},
        platform::consts::PAGE_SIZE,
    },
    alloc::{boxed::Box, vec::Vec},
    bitflags::bitflags,
    core::{
        convert::TryFrom,
        mem::size_of,
        sync::atomic::{fence, AtomicU16, AtomicU32, AtomicUsize, Ordering},
    },
    gnttab_sys::{
        domid_t, grant_handle_t, grant_ref_t, GNTMAP_application_map, GNTMAP_contains_pte,
        GNTMAP_device_map, GNTMAP_host_map, GNTMAP_readonly,
    },
    log::trace,
    spin::{Mutex, Once},
};

/// Number of map-track entries in one map-track frame
pub const MAPTRACK_ENTRIES_PER_FRAME: usize = PAGE_SIZE / size_of::<MapTrackEntry>();

bitflags! {
    /// Flags of a grant mapping
    pub struct MapFlags: u32 {
        /// Map for device access, returning a bus address
        const DEVICE_MAP = GNTMAP_device_map;
        /// Map into the host virtual address space
        const HOST_MAP = GNTMAP_host_map;
        /// Map read-only
        const READONLY = GNTMAP_readonly;
        /// Mapping is accessible to applications
        const APPLICATION_MAP = GNTMAP_application_map;
        /// Host address names a page-table entry rather than a virtual address
        const CONTAINS_PTE = GNTMAP_contains_pte;
    }
}

impl MapFlags {
    /// Access mode the mapping needs
    pub fn access(self) -> Access {
        Access::from(self)
    }
}

/// Low bits of the state word holding the map flags
const FLAGS_MASK: u32 = 0x7f;

/// State of an entry that is being removed
const TAKEN: u32 = 0x80;

const GENERATION_SHIFT: u32 = 8;

fn is_live(state: u32) -> bool {
    state & FLAGS_MASK != 0
}

fn next_generation(state: u32) -> u32 {
    (state >> GENERATION_SHIFT).wrapping_add(1) << GENERATION_SHIFT
}

/// Live mapping recorded in a map-track entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Domain that granted the frame
    pub owner: domid_t,
    /// Grant reference in the owner's table
    pub grant_ref: grant_ref_t,
    /// Flags the mapping was made with
    pub flags: MapFlags,
    /// Mapped frame
    pub frame: MachineFrameNumber,
    /// Host virtual address of the mapping, zero for device-only mappings
    pub host_addr: VirtualAddress,
}

#[derive(Debug)]
struct MapTrackEntry {
    state: AtomicU32,
    owner: AtomicU16,
    grant_ref: AtomicU32,
    frame: AtomicUsize,
    host_addr: AtomicUsize,
}

impl MapTrackEntry {
    #[allow(clippy::declare_interior_mutable_const)]
    const EMPTY: Self = Self {
        state: AtomicU32::new(0),
        owner: AtomicU16::new(0),
        grant_ref: AtomicU32::new(0),
        frame: AtomicUsize::new(0),
        host_addr: AtomicUsize::new(0),
    };

    /// Fills the entry and publishes it
    fn publish(&self, state: u32, mapping: &Mapping) {
        self.owner.store(mapping.owner, Ordering::Relaxed);
        self.grant_ref.store(mapping.grant_ref, Ordering::Relaxed);
        self.frame.store(mapping.frame.0, Ordering::Relaxed);
        self.host_addr.store(mapping.host_addr.0, Ordering::Relaxed);

        self.state
            .store(next_generation(state) | mapping.flags.bits(), Ordering::Release);
    }

    fn read(&self, state: u32) -> Mapping {
        Mapping {
            owner: self.owner.load(Ordering::Relaxed),
            grant_ref: self.grant_ref.load(Ordering::Relaxed),
            flags: MapFlags::from_bits_truncate(state & FLAGS_MASK),
            frame: MachineFrameNumber(self.frame.load(Ordering::Relaxed)),
            host_addr: VirtualAddress(self.host_addr.load(Ordering::Relaxed)),
        }
    }
}

type MapTrackFrame = [MapTrackEntry; MAPTRACK_ENTRIES_PER_FRAME];

#[derive(Debug)]
struct FreeSlots {
    free: Vec<grant_handle_t>,
    nr_frames: usize,
}

/// Map-track table of one domain
pub(crate) struct MapTrack {
    frames: Box<[Once<Box<MapTrackFrame>>]>,
    free: Mutex<FreeSlots>,
}

fn split(handle: grant_handle_t) -> (usize, usize) {
    let index = usize::try_from(handle).expect("Failed to convert u32 to usize");
    (
        index / MAPTRACK_ENTRIES_PER_FRAME,
        index % MAPTRACK_ENTRIES_PER_FRAME,
    )
}

impl MapTrack {
    pub(crate) fn new(max_frames: usize) -> Self {
        Self {
            frames: (0..max_frames).map(|_| Once::new()).collect(),
            free: Mutex::new(FreeSlots {
                free: Vec::new(),
                nr_frames: 0,
            }),
        }
    }

    /// Number of map-track frames allocated so far
    pub(crate) fn nr_frames(&self) -> usize {
        self.free.lock().nr_frames
    }

    fn entry(&self, handle: grant_handle_t) -> Option<&MapTrackEntry> {
        let (frame, index) = split(handle);
        self.frames
            .get(frame)
            .and_then(|frame| frame.get())
            .map(|frame| &frame[index])
    }

    fn allocate(&self) -> Result<grant_handle_t, Error> {
        let mut slots = self.free.lock();

        if let Some(handle) = slots.free.pop() {
            return Ok(handle);
        }

        let frame = slots.nr_frames;
        if frame >= self.frames.len() {
            return Err(Error::MapTrackExhausted);
        }

        self.frames[frame]
            .call_once(|| Box::new([MapTrackEntry::EMPTY; MAPTRACK_ENTRIES_PER_FRAME]));
        slots.nr_frames += 1;

        let base = frame * MAPTRACK_ENTRIES_PER_FRAME;
        slots.free.extend(
            (base..base + MAPTRACK_ENTRIES_PER_FRAME)
                .rev()
                .map(|i| grant_handle_t::try_from(i).expect("Failed to convert usize to u32")),
        );

        trace!("map-track grew to {} frames", slots.nr_frames);

        slots
            .free
            .pop()
            .ok_or(Error::MapTrackExhausted)
    }

    /// Records a new mapping and returns its handle
    pub(crate) fn insert(&self, mapping: &Mapping) -> Result<grant_handle_t, Error> {
        let handle = self.allocate()?;
        let entry = self
            .entry(handle)
            .expect("allocated map-track handle has no entry");

        entry.publish(entry.state.load(Ordering::Relaxed), mapping);

        trace!(
            "map-track {} -> domain {} ref {}",
            handle,
            mapping.owner,
            mapping.grant_ref
        );

        Ok(handle)
    }

    /// Reads the mapping named by `handle`
    pub(crate) fn lookup(&self, handle: grant_handle_t) -> Option<Mapping> {
        let entry = self.entry(handle)?;
        loop {
            let state = entry.state.load(Ordering::Acquire);
            if !is_live(state) {
                return None;
            }

            let mapping = entry.read(state);
            fence(Ordering::Acquire);
            if entry.state.load(Ordering::Relaxed) == state {
                return Some(mapping);
            }
        }
    }

    /// Claims the mapping named by `handle` for removal
    ///
    /// The slot is neither live nor free afterwards; the caller must either [`restore`](Self::restore)
    /// or [`free`](Self::free) it.
    pub(crate) fn take(&self, handle: grant_handle_t) -> Option<Mapping> {
        let entry = self.entry(handle)?;
        let mut state = entry.state.load(Ordering::Acquire);
        loop {
            if !is_live(state) {
                return None;
            }

            let mapping = entry.read(state);
            let taken = (state & !(FLAGS_MASK | TAKEN)) | TAKEN;

            match entry
                .state
                .compare_exchange(state, taken, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(mapping),
                Err(actual) => state = actual,
            }
        }
    }

    /// Republishes a mapping claimed by [`take`](Self::take)
    pub(crate) fn restore(&self, handle: grant_handle_t, mapping: &Mapping) {
        let entry = self.taken_entry(handle);
        entry.publish(entry.state.load(Ordering::Relaxed), mapping);
    }

    /// Returns a slot claimed by [`take`](Self::take) to the free list
    pub(crate) fn free(&self, handle: grant_handle_t) {
        let entry = self.taken_entry(handle);
        let state = entry.state.load(Ordering::Relaxed);
        entry.state.store(state & !TAKEN, Ordering::Release);

        self.free.lock().free.push(handle);
    }

    fn taken_entry(&self, handle: grant_handle_t) -> &MapTrackEntry {
        match self.entry(handle) {
            Some(entry) if entry.state.load(Ordering::Acquire) & (FLAGS_MASK | TAKEN) == TAKEN => {
                entry
            }
            _ => panic!("map-track handle {} released without being taken", handle),
        }
    }

    /// Removes the mapping named by `handle`
    pub(crate) fn remove(&self, handle: grant_handle_t) -> Option<Mapping> {
        let mapping = self.take(handle)?;
        self.free(handle);
        Some(mapping)
    }

    fn handles(&self) -> impl Iterator<Item = (grant_handle_t, &MapTrackEntry)> {
        self.frames
            .iter()
            .filter_map(|frame| frame.get())
            .flat_map(|frame| frame.iter())
            .enumerate()
            .map(|(index, entry)| {
                (
                    grant_handle_t::try_from(index).expect("Failed to convert usize to u32"),
                    entry,
                )
            })
    }

    /// Handle of the first live mapping of `frame`
    pub(crate) fn find_by_frame(&self, frame: MachineFrameNumber) -> Option<grant_handle_t> {
        self.handles()
            .filter(|(_, entry)| is_live(entry.state.load(Ordering::Acquire)))
            .find(|(handle, _)| {
                self.lookup(*handle)
                    .map_or(false, |mapping| mapping.frame == frame)
            })
            .map(|(handle, _)| handle)
    }

    /// Handles of all live mappings
    pub(crate) fn live_handles(&self) -> Vec<grant_handle_t> {
        self.handles()
            .filter(|(_, entry)| is_live(entry.state.load(Ordering::Acquire)))
            .map(|(handle, _)| handle)
            .collect()
    }
}
