//! Shared grant entries
//!
//! The shared entries live in memory mapped by both the granting guest and the hypervisor. The
//! guest writes `domid`, `frame` and the type flags; the hypervisor only ever sets and clears the
//! status bits. `flags` and `domid` are adjacent 16-bit fields, so both sides update them together
//! through a single 32-bit compare-and-swap on the entry header.

use {
    super::{active::Access, Error},
    crate::{
        memory::MachineFrameNumber,
        platform::consts::{PAGE_SHIFT, PAGE_SIZE},
    },
    alloc::{boxed::Box, vec::Vec},
    bitflags::bitflags,
    core::{
        convert::{TryFrom, TryInto},
        hint,
        mem::size_of,
        sync::atomic::{fence, AtomicU32, Ordering},
    },
    gnttab_sys::{
        domid_t, grant_entry_v1_t, grant_ref_t, GTF_accept_transfer, GTF_permit_access,
        GTF_reading, GTF_readonly, GTF_transfer_committed, GTF_transfer_completed, GTF_type_mask,
        GTF_writing,
    },
};

/// Number of shared entries in one grant frame
pub const SHARED_ENTRIES_PER_FRAME: usize = PAGE_SIZE / size_of::<grant_entry_v1_t>();

bitflags! {
    /// Flags of a shared grant entry
    ///
    /// The transfer status bits reuse the bit positions of the access bits; which meaning applies
    /// depends on the entry type.
    pub struct GrantFlags: u16 {
        /// Entry permits mapping by the named domain
        const PERMIT_ACCESS = GTF_permit_access;
        /// Entry accepts a frame transferred by the named domain
        const ACCEPT_TRANSFER = GTF_accept_transfer;
        /// Mask of the entry type bits
        const TYPE_MASK = GTF_type_mask;
        /// Mappings must be read-only
        const READONLY = GTF_readonly;
        /// Frame is mapped by the named domain
        const READING = GTF_reading;
        /// Frame is mapped writable by the named domain
        const WRITING = GTF_writing;
        /// Transfer into the entry has started
        const TRANSFER_COMMITTED = GTF_transfer_committed;
        /// Transfer into the entry has finished and `frame` holds the new frame
        const TRANSFER_COMPLETED = GTF_transfer_completed;
    }
}

impl GrantFlags {
    /// Type bits of the entry
    pub fn kind(self) -> Self {
        self & Self::TYPE_MASK
    }

    /// Whether the hypervisor is currently using the entry
    pub fn in_use(self) -> bool {
        if self.kind() == Self::PERMIT_ACCESS {
            self.intersects(Self::READING | Self::WRITING)
        } else if self.kind() == Self::ACCEPT_TRANSFER {
            self.contains(Self::TRANSFER_COMMITTED)
        } else {
            false
        }
    }
}

/// Snapshot of a shared entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedStatus {
    /// Entry flags
    pub flags: GrantFlags,
    /// Domain named by the entry
    pub domid: domid_t,
    /// Frame named by the entry
    pub frame: u32,
}

/// Grant entry in shared memory, laid out as `grant_entry_v1`
#[repr(C)]
#[derive(Debug)]
pub struct SharedEntry {
    /// `flags` in the low half, `domid` in the high half
    header: AtomicU32,
    frame: AtomicU32,
}

const _: () = assert!(size_of::<SharedEntry>() == size_of::<grant_entry_v1_t>());

fn pack(flags: GrantFlags, domid: domid_t) -> u32 {
    u32::from(flags.bits()) | (u32::from(domid) << 16)
}

fn unpack(header: u32) -> (GrantFlags, domid_t) {
    (
        GrantFlags::from_bits_truncate(header as u16),
        (header >> 16) as domid_t,
    )
}

impl SharedEntry {
    #[allow(clippy::declare_interior_mutable_const)]
    pub(crate) const EMPTY: Self = Self {
        header: AtomicU32::new(0),
        frame: AtomicU32::new(0),
    };

    /// Reads the entry as currently published by the guest
    pub fn read_status(&self) -> SharedStatus {
        let (flags, domid) = unpack(self.header.load(Ordering::Acquire));
        SharedStatus {
            flags,
            domid,
            frame: self.frame.load(Ordering::Acquire),
        }
    }

    /// Guest side: publishes a grant of `frame` to `domid`
    ///
    /// Fails without modifying the entry while the hypervisor is using it.
    pub(crate) fn write(&self, domid: domid_t, frame: u32, flags: GrantFlags) -> Result<(), Error> {
        // withdraw the old grant so the entry cannot be activated half-written
        let owner = self.withdraw()?;
        self.publish(owner, domid, frame, flags)
    }

    /// Clears the type flags unless the hypervisor is using the entry, returning the domain the
    /// entry named
    fn withdraw(&self) -> Result<domid_t, Error> {
        let mut old = self.header.load(Ordering::Acquire);
        loop {
            let (flags, owner) = unpack(old);
            if flags.in_use() {
                return Err(Error::StillInUse);
            }
            match self.header.compare_exchange_weak(
                old,
                pack(GrantFlags::empty(), owner),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(owner),
                Err(actual) => old = actual,
            }
        }
    }

    /// Installs a new grant over an entry withdrawn by [`withdraw`](Self::withdraw)
    ///
    /// Fails if the entry changed since, as it does when a concurrent write of the same entry
    /// published first and the hypervisor started using it.
    fn publish(&self, owner: domid_t, domid: domid_t, frame: u32, flags: GrantFlags) -> Result<(), Error> {
        self.frame.store(frame, Ordering::Relaxed);

        fence(Ordering::SeqCst);

        self.header
            .compare_exchange(
                pack(GrantFlags::empty(), owner),
                pack(flags, domid),
                Ordering::Release,
                Ordering::Relaxed,
            )
            .map(|_| ())
            .map_err(|_| Error::StillInUse)
    }

    /// Guest side: withdraws the grant if the hypervisor is not using it
    pub(crate) fn end_access(&self) -> Result<(), Error> {
        self.withdraw().map(|_| ())
    }

    /// Hypervisor side: validates the grant for `domid` and marks it in use for `access`
    pub(crate) fn set_status(&self, domid: domid_t, access: Access) -> Result<(), Error> {
        let mut old = self.header.load(Ordering::Acquire);
        loop {
            let (flags, owner) = unpack(old);

            if flags.kind() != GrantFlags::PERMIT_ACCESS {
                return Err(Error::NotGranted);
            }
            if owner != domid {
                return Err(Error::PermissionDenied);
            }
            if access == Access::ReadWrite && flags.contains(GrantFlags::READONLY) {
                return Err(Error::PermissionDenied);
            }

            let mut status = flags | GrantFlags::READING;
            if access == Access::ReadWrite {
                status |= GrantFlags::WRITING;
            }

            match self.header.compare_exchange_weak(
                old,
                pack(status, owner),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => old = actual,
            }
        }
    }

    /// Hypervisor side: marks the grant in use and returns the frame it names
    ///
    /// The frame is read after the status is set, once the guest can no longer rewrite it.
    pub(crate) fn activate(&self, domid: domid_t, access: Access) -> Result<MachineFrameNumber, Error> {
        self.set_status(domid, access)?;

        Ok(MachineFrameNumber(
            self.frame
                .load(Ordering::Acquire)
                .try_into()
                .expect("Failed to convert u32 to usize"),
        ))
    }

    /// Hypervisor side: clears status bits
    pub(crate) fn clear_status(&self, bits: GrantFlags) {
        self.header
            .fetch_and(!u32::from(bits.bits()), Ordering::AcqRel);
    }

    /// Hypervisor side: claims an accept-transfer entry for a transfer from `sender`
    pub(crate) fn commit_transfer(&self, sender: domid_t) -> Result<(), Error> {
        let mut old = self.header.load(Ordering::Acquire);
        loop {
            let (flags, owner) = unpack(old);

            if flags.kind() != GrantFlags::ACCEPT_TRANSFER
                || flags.contains(GrantFlags::TRANSFER_COMMITTED)
            {
                return Err(Error::NotGranted);
            }
            if owner != sender {
                return Err(Error::PermissionDenied);
            }

            match self.header.compare_exchange_weak(
                old,
                pack(flags | GrantFlags::TRANSFER_COMMITTED, owner),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => old = actual,
            }
        }
    }

    /// Hypervisor side: publishes the transferred frame
    pub(crate) fn complete_transfer(&self, frame: u32) {
        self.frame.store(frame, Ordering::Relaxed);
        self.header.fetch_or(
            u32::from(GrantFlags::TRANSFER_COMPLETED.bits()),
            Ordering::Release,
        );
    }

    /// Hypervisor side: backs out of a committed transfer
    pub(crate) fn abort_transfer(&self) {
        self.clear_status(GrantFlags::TRANSFER_COMMITTED);
    }

    /// Guest side: finishes an accept-transfer grant
    ///
    /// Returns the received frame, or `None` if no transfer started, in which case the grant is
    /// withdrawn. Spins while a committed transfer is completing.
    pub(crate) fn accept_transfer(&self) -> Result<Option<u32>, Error> {
        let mut old = self.header.load(Ordering::Acquire);
        loop {
            let (flags, owner) = unpack(old);

            if flags.kind() != GrantFlags::ACCEPT_TRANSFER {
                return Err(Error::NotGranted);
            }

            if !flags.contains(GrantFlags::TRANSFER_COMMITTED) {
                match self.header.compare_exchange_weak(
                    old,
                    pack(GrantFlags::empty(), owner),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Ok(None),
                    Err(actual) => {
                        old = actual;
                        continue;
                    }
                }
            }

            if !flags.contains(GrantFlags::TRANSFER_COMPLETED) {
                hint::spin_loop();
                old = self.header.load(Ordering::Acquire);
                continue;
            }

            let frame = self.frame.load(Ordering::Acquire);
            self.header
                .store(pack(GrantFlags::empty(), owner), Ordering::Release);
            return Ok(Some(frame));
        }
    }
}

/// One page of shared entries
#[repr(C, align(4096))]
struct SharedFrame([SharedEntry; SHARED_ENTRIES_PER_FRAME]);

/// Shared entries of one domain, grown a frame at a time
#[derive(Default)]
pub(crate) struct SharedStore {
    frames: Vec<Box<SharedFrame>>,
}

impl SharedStore {
    pub(crate) fn nr_frames(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn nr_entries(&self) -> usize {
        self.frames.len() * SHARED_ENTRIES_PER_FRAME
    }

    pub(crate) fn add_frame(&mut self) {
        self.frames.push(Box::new(SharedFrame(
            [SharedEntry::EMPTY; SHARED_ENTRIES_PER_FRAME],
        )));
    }

    pub(crate) fn entry(&self, reference: grant_ref_t) -> Option<&SharedEntry> {
        let index: usize = reference.try_into().ok()?;
        self.frames
            .get(index / SHARED_ENTRIES_PER_FRAME)
            .map(|frame| &frame.0[index % SHARED_ENTRIES_PER_FRAME])
    }

    /// Host frame numbers of the grant frames, in table order
    pub(crate) fn frame_numbers(&self) -> Vec<MachineFrameNumber> {
        self.frames
            .iter()
            .map(|frame| MachineFrameNumber((&**frame as *const SharedFrame as usize) >> PAGE_SHIFT))
            .collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (grant_ref_t, &SharedEntry)> {
        self.frames
            .iter()
            .flat_map(|frame| frame.0.iter())
            .enumerate()
            .map(|(index, entry)| {
                (
                    grant_ref_t::try_from(index).expect("Failed to convert usize to grant_ref_t"),
                    entry,
                )
            })
    }
}
