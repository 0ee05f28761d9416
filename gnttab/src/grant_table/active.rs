//! Active grant entries
//!
//! While a grant is in use the hypervisor keeps a private copy of the granted frame and remote
//! domain in an active entry, together with the pin count of current uses. Active entries come
//! from a per-table pool: a grant reference is bound to a pool slot on its first use and the slot
//! goes back to the pool once the last pin is dropped.
//!
//! Only one active entry is locked at a time outside table growth, and the pool free-list lock
//! may be taken while an entry is locked but never the other way around.

use {
    super::{
        shared::{GrantFlags, SharedEntry, SHARED_ENTRIES_PER_FRAME},
        Error, MapFlags,
    },
    crate::memory::MachineFrameNumber,
    alloc::{boxed::Box, vec::Vec},
    core::{
        convert::{TryFrom, TryInto},
        sync::atomic::{AtomicU32, Ordering},
    },
    gnttab_sys::{domid_t, grant_ref_t},
    log::trace,
    spin::{Mutex, MutexGuard},
};

/// Number of active entries added to the pool with each grant frame
pub const ACTIVE_ENTRIES_PER_FRAME: usize = SHARED_ENTRIES_PER_FRAME;

/// Binding of a reference without an active entry
const UNBOUND: u32 = u32::MAX;

/// Access mode of a single use of a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read-only use
    ReadOnly,
    /// Read-write use
    ReadWrite,
}

impl From<MapFlags> for Access {
    fn from(flags: MapFlags) -> Self {
        if flags.contains(MapFlags::READONLY) {
            Self::ReadOnly
        } else {
            Self::ReadWrite
        }
    }
}

#[derive(Debug)]
struct ActiveEntry {
    /// Reference currently using this slot
    bound: Option<grant_ref_t>,
    domid: domid_t,
    frame: MachineFrameNumber,
    pin: u32,
    writers: u32,
}

impl ActiveEntry {
    const EMPTY: Self = Self {
        bound: None,
        domid: 0,
        frame: MachineFrameNumber(0),
        pin: 0,
        writers: 0,
    };
}

struct ActiveFrame {
    /// Pool slot bound to each reference of the matching grant frame
    bindings: [AtomicU32; ACTIVE_ENTRIES_PER_FRAME],
    slots: [Mutex<ActiveEntry>; ACTIVE_ENTRIES_PER_FRAME],
}

impl ActiveFrame {
    #[allow(clippy::declare_interior_mutable_const)]
    const UNBOUND_BINDING: AtomicU32 = AtomicU32::new(UNBOUND);
    #[allow(clippy::declare_interior_mutable_const)]
    const EMPTY_SLOT: Mutex<ActiveEntry> = Mutex::new(ActiveEntry::EMPTY);

    fn new() -> Self {
        Self {
            bindings: [Self::UNBOUND_BINDING; ACTIVE_ENTRIES_PER_FRAME],
            slots: [Self::EMPTY_SLOT; ACTIVE_ENTRIES_PER_FRAME],
        }
    }
}

/// Pool of active entries of one grant table
#[derive(Default)]
pub(crate) struct ActiveTable {
    frames: Vec<Box<ActiveFrame>>,
    free: Mutex<Vec<u32>>,
}

fn split(index: u32) -> (usize, usize) {
    let index = usize::try_from(index).expect("Failed to convert u32 to usize");
    (
        index / ACTIVE_ENTRIES_PER_FRAME,
        index % ACTIVE_ENTRIES_PER_FRAME,
    )
}

impl ActiveTable {
    /// Adds one frame of references and pool slots, only done with the table write lock held
    pub(crate) fn add_frame(&mut self) {
        let base = self.frames.len() * ACTIVE_ENTRIES_PER_FRAME;
        self.frames.push(Box::new(ActiveFrame::new()));

        self.free.get_mut().extend(
            (base..base + ACTIVE_ENTRIES_PER_FRAME)
                .rev()
                .map(|slot| u32::try_from(slot).expect("Failed to convert usize to u32")),
        );
    }

    fn binding(&self, reference: grant_ref_t) -> Option<&AtomicU32> {
        let (frame, index) = split(reference);
        self.frames.get(frame).map(|frame| &frame.bindings[index])
    }

    fn slot(&self, slot: u32) -> &Mutex<ActiveEntry> {
        let (frame, index) = split(slot);
        &self.frames[frame].slots[index]
    }

    /// Number of references that currently have an active entry
    pub(crate) fn nr_active(&self) -> usize {
        self.frames
            .iter()
            .flat_map(|frame| frame.bindings.iter())
            .filter(|binding| binding.load(Ordering::Acquire) != UNBOUND)
            .count()
    }

    /// Whether a pinned entry refers to `frame`
    ///
    /// Locks every slot in turn, so a use pinned before the call returns is always seen.
    pub(crate) fn pins_frame(&self, frame: MachineFrameNumber) -> bool {
        self.frames
            .iter()
            .flat_map(|active| active.slots.iter())
            .any(|slot| {
                let entry = slot.lock();
                entry.pin > 0 && entry.frame == frame
            })
    }

    /// Pin count of `reference`, zero when it has no active entry
    pub(crate) fn pin_count(&self, shared: &SharedEntry, reference: grant_ref_t) -> u32 {
        self.binding(reference)
            .and_then(|binding| self.lock_bound(shared, binding, reference))
            .map_or(0, |handle| handle.pin_count())
    }

    /// Pins the active entry of `reference` for a use by `domid`, activating it on first use
    ///
    /// The pin is dropped again when the returned handle goes out of scope, unless the handle is
    /// consumed with [`ActiveEntryHandle::keep`].
    pub(crate) fn acquire<'a>(
        &'a self,
        shared: &'a SharedEntry,
        reference: grant_ref_t,
        domid: domid_t,
        access: Access,
    ) -> Result<ActiveEntryHandle<'a>, Error> {
        let binding = self.binding(reference).ok_or(Error::InvalidReference)?;

        let mut handle = loop {
            if let Some(handle) = self.lock_bound(shared, binding, reference) {
                break handle;
            }
            // None if another CPU bound the reference first
            if let Some(handle) = self.bind(shared, binding, reference)? {
                break handle;
            }
        };

        handle.pin(domid, access)?;
        Ok(handle)
    }

    /// Locks the active entry of a reference that is already in use
    ///
    /// # Panics
    ///
    /// Panics if the reference has no active entry, the caller must hold a pin on it.
    pub(crate) fn lookup<'a>(
        &'a self,
        shared: &'a SharedEntry,
        reference: grant_ref_t,
    ) -> ActiveEntryHandle<'a> {
        let handle = self
            .binding(reference)
            .and_then(|binding| self.lock_bound(shared, binding, reference));

        match handle {
            Some(handle) if handle.entry.pin > 0 => handle,
            _ => panic!("grant reference {} has no pinned active entry", reference),
        }
    }

    fn lock_bound<'a>(
        &'a self,
        shared: &'a SharedEntry,
        binding: &'a AtomicU32,
        reference: grant_ref_t,
    ) -> Option<ActiveEntryHandle<'a>> {
        loop {
            let slot = binding.load(Ordering::Acquire);
            if slot == UNBOUND {
                return None;
            }

            let entry = self.slot(slot).lock();

            // the slot may have been released, and possibly rebound, since the binding was read
            if entry.bound == Some(reference) {
                return Some(ActiveEntryHandle {
                    table: self,
                    shared,
                    binding,
                    entry,
                    slot,
                    reference,
                    held: None,
                });
            }
        }
    }

    fn bind<'a>(
        &'a self,
        shared: &'a SharedEntry,
        binding: &'a AtomicU32,
        reference: grant_ref_t,
    ) -> Result<Option<ActiveEntryHandle<'a>>, Error> {
        let slot = self.free.lock().pop().ok_or(Error::ExhaustedPool)?;

        let mut entry = self.slot(slot).lock();
        entry.bound = Some(reference);

        if binding
            .compare_exchange(UNBOUND, slot, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            entry.bound = None;
            drop(entry);
            self.free.lock().push(slot);
            return Ok(None);
        }

        Ok(Some(ActiveEntryHandle {
            table: self,
            shared,
            binding,
            entry,
            slot,
            reference,
            held: None,
        }))
    }
}

/// Locked active entry
///
/// Holds the entry lock for its whole lifetime. A handle returned by `acquire` also owns one pin,
/// which is released on drop unless it is kept for a mapping.
pub(crate) struct ActiveEntryHandle<'a> {
    table: &'a ActiveTable,
    shared: &'a SharedEntry,
    binding: &'a AtomicU32,
    entry: MutexGuard<'a, ActiveEntry>,
    slot: u32,
    reference: grant_ref_t,
    held: Option<Access>,
}

impl<'a> ActiveEntryHandle<'a> {
    /// Frame copied from the shared entry at activation
    pub(crate) fn frame(&self) -> MachineFrameNumber {
        self.entry.frame
    }

    /// Domain the entry was activated for
    pub(crate) fn domid(&self) -> domid_t {
        self.entry.domid
    }

    /// Current pin count
    pub(crate) fn pin_count(&self) -> u32 {
        self.entry.pin
    }

    /// Leaves the pin taken by `acquire` in place after the handle is unlocked
    pub(crate) fn keep(mut self) {
        self.held = None;
    }

    /// Drops one pin of the given access mode, freeing the entry when it was the last one
    pub(crate) fn release(mut self, access: Access) {
        self.held = Some(access);
    }

    fn pin(&mut self, domid: domid_t, access: Access) -> Result<(), Error> {
        let pin = self
            .entry
            .pin
            .checked_add(1)
            .ok_or(Error::ExhaustedPool)?;

        if self.entry.pin == 0 {
            let frame = self.shared.activate(domid, access)?;
            self.entry.domid = domid;
            self.entry.frame = frame;

            trace!(
                "activated grant {} for domain {} frame {:#x}",
                self.reference,
                domid,
                frame.0
            );
        } else {
            if self.entry.domid != domid {
                return Err(Error::PermissionDenied);
            }
            if access == Access::ReadWrite && self.entry.writers == 0 {
                self.shared.set_status(domid, access)?;
            }
        }

        self.entry.pin = pin;
        if access == Access::ReadWrite {
            self.entry.writers += 1;
        }
        self.held = Some(access);

        Ok(())
    }

    fn unpin(&mut self, access: Access) {
        let reference = self.reference;
        let entry = &mut *self.entry;

        entry.pin = entry
            .pin
            .checked_sub(1)
            .unwrap_or_else(|| panic!("pin underflow on grant reference {}", reference));

        if access == Access::ReadWrite {
            entry.writers = entry
                .writers
                .checked_sub(1)
                .unwrap_or_else(|| panic!("writer underflow on grant reference {}", reference));
            if entry.writers == 0 {
                self.shared.clear_status(GrantFlags::WRITING);
            }
        }

        if entry.pin == 0 {
            self.shared
                .clear_status(GrantFlags::READING | GrantFlags::WRITING);
        }
    }

    fn unbind(&mut self) {
        self.entry.bound = None;
        self.binding.store(UNBOUND, Ordering::Release);
        self.table.free.lock().push(self.slot);

        trace!("released active entry of grant {}", self.reference);
    }
}

impl Drop for ActiveEntryHandle<'_> {
    fn drop(&mut self) {
        if let Some(access) = self.held.take() {
            self.unpin(access);
        }

        if self.entry.pin == 0 && self.entry.bound == Some(self.reference) {
            self.unbind();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> (ActiveTable, Vec<SharedEntry>) {
        let mut table = ActiveTable::default();
        table.add_frame();

        let shared = (0..4)
            .map(|_| SharedEntry::EMPTY)
            .collect::<Vec<_>>();

        (table, shared)
    }

    #[test]
    fn pins_count_uses() {
        let (table, shared) = table();
        shared[1].write(2, 0x1000, GrantFlags::PERMIT_ACCESS).unwrap();

        table
            .acquire(&shared[1], 1, 2, Access::ReadOnly)
            .unwrap()
            .keep();
        table
            .acquire(&shared[1], 1, 2, Access::ReadWrite)
            .unwrap()
            .keep();

        let handle = table.lookup(&shared[1], 1);
        assert_eq!(handle.pin_count(), 2);
        assert_eq!(handle.frame(), MachineFrameNumber(0x1000));
        assert_eq!(handle.domid(), 2);
        drop(handle);

        assert!(shared[1].read_status().flags.contains(GrantFlags::WRITING));
        table.lookup(&shared[1], 1).release(Access::ReadWrite);
        let flags = shared[1].read_status().flags;
        assert!(flags.contains(GrantFlags::READING));
        assert!(!flags.contains(GrantFlags::WRITING));

        table.lookup(&shared[1], 1).release(Access::ReadOnly);
        assert!(!shared[1].read_status().flags.in_use());
        assert_eq!(table.nr_active(), 0);
    }

    #[test]
    fn dropped_handle_releases_pin() {
        let (table, shared) = table();
        shared[0].write(2, 0x1000, GrantFlags::PERMIT_ACCESS).unwrap();

        {
            let handle = table.acquire(&shared[0], 0, 2, Access::ReadWrite).unwrap();
            assert_eq!(handle.pin_count(), 1);
            assert_eq!(table.nr_active(), 1);
        }

        assert_eq!(table.nr_active(), 0);
        assert!(!shared[0].read_status().flags.in_use());
        assert_eq!(table.free.lock().len(), ACTIVE_ENTRIES_PER_FRAME);
    }

    #[test]
    fn failed_activation_leaves_reference_unbound() {
        let (table, shared) = table();
        shared[3]
            .write(2, 0x1000, GrantFlags::PERMIT_ACCESS | GrantFlags::READONLY)
            .unwrap();

        assert_eq!(
            table.acquire(&shared[3], 3, 2, Access::ReadWrite).err(),
            Some(Error::PermissionDenied)
        );
        assert_eq!(
            table.acquire(&shared[3], 3, 9, Access::ReadOnly).err(),
            Some(Error::PermissionDenied)
        );
        assert_eq!(table.nr_active(), 0);
    }

    #[test]
    fn remote_domain_is_fixed_while_active() {
        let (table, shared) = table();
        shared[2].write(2, 0x1000, GrantFlags::PERMIT_ACCESS).unwrap();

        table
            .acquire(&shared[2], 2, 2, Access::ReadOnly)
            .unwrap()
            .keep();
        assert_eq!(
            table.acquire(&shared[2], 2, 5, Access::ReadOnly).err(),
            Some(Error::PermissionDenied)
        );
        assert_eq!(table.lookup(&shared[2], 2).pin_count(), 1);
    }

    #[test]
    fn out_of_range_reference() {
        let (table, shared) = table();
        assert_eq!(
            table
                .acquire(&shared[0], ACTIVE_ENTRIES_PER_FRAME as u32, 2, Access::ReadOnly)
                .err(),
            Some(Error::InvalidReference)
        );
    }
}
