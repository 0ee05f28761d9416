//! Free grant references of a guest's own table
//!
//! Free references form a singly linked list threaded through `list`, with `head` naming the
//! first free reference. Reservations detach a prefix of the list into a private chain ending in
//! [`GNTTAB_LIST_END`].

use {
    super::Error,
    alloc::vec::Vec,
    core::convert::TryFrom,
    gnttab_sys::{domid_t, grant_ref_t},
    log::{trace, warn},
};

/// References below this are never handed out
pub const NUM_RESERVED_ENTRIES: grant_ref_t = 8;

/// End of a free-reference chain
pub const GNTTAB_LIST_END: grant_ref_t = grant_ref_t::MAX;

/// Link value of a reference that is currently allocated
const ALLOCATED: grant_ref_t = grant_ref_t::MAX - 1;

fn index(reference: grant_ref_t) -> usize {
    usize::try_from(reference).expect("Failed to convert u32 to usize")
}

/// Private chain of references taken from the free list in one step
///
/// Handed back to [`free_grant_references`](super::GrantTable::free_grant_references) when no
/// longer needed.
#[derive(Debug, PartialEq, Eq)]
pub struct Reservation {
    domid: domid_t,
    table: usize,
    head: grant_ref_t,
}

impl Reservation {
    /// Domain whose table the references belong to
    pub fn domid(&self) -> domid_t {
        self.domid
    }

    /// Instance of the table the references were taken from
    pub(crate) fn table(&self) -> usize {
        self.table
    }

    /// First unclaimed reference, or [`GNTTAB_LIST_END`]
    pub fn head(&self) -> grant_ref_t {
        self.head
    }

    /// Whether every reference has been claimed
    pub fn is_empty(&self) -> bool {
        self.head == GNTTAB_LIST_END
    }
}

#[derive(Debug)]
pub(crate) struct RefFreeList {
    domid: domid_t,
    /// Distinguishes successive tables of a reused domain ID
    table: usize,
    list: Vec<grant_ref_t>,
    head: grant_ref_t,
    free_count: usize,
}

impl RefFreeList {
    pub(crate) fn new(domid: domid_t, table: usize) -> Self {
        Self {
            domid,
            table,
            list: Vec::new(),
            head: GNTTAB_LIST_END,
            free_count: 0,
        }
    }

    pub(crate) fn free_count(&self) -> usize {
        self.free_count
    }

    /// Adds the references of newly added grant frames, up to `nr_entries`
    pub(crate) fn extend(&mut self, nr_entries: usize) {
        let start = self.list.len();
        self.list.resize(nr_entries, ALLOCATED);

        for i in (start..nr_entries).rev() {
            let reference =
                grant_ref_t::try_from(i).expect("Failed to convert usize to grant_ref_t");
            if reference >= NUM_RESERVED_ENTRIES {
                self.push(reference);
            }
        }
    }

    fn push(&mut self, reference: grant_ref_t) {
        self.list[index(reference)] = self.head;
        self.head = reference;
        self.free_count += 1;
    }

    /// Takes one free reference
    pub(crate) fn get_free_entry(&mut self) -> Result<grant_ref_t, Error> {
        if self.head == GNTTAB_LIST_END {
            return Err(Error::TableGrowthRequired);
        }

        let reference = self.head;
        self.head = self.list[index(reference)];
        self.list[index(reference)] = ALLOCATED;
        self.free_count -= 1;

        trace!("domain {} allocated grant reference {}", self.domid, reference);

        Ok(reference)
    }

    /// Returns an allocated reference to the free list
    pub(crate) fn put_free_entry(&mut self, reference: grant_ref_t) -> Result<(), Error> {
        if reference < NUM_RESERVED_ENTRIES
            || self.list.get(index(reference)) != Some(&ALLOCATED)
        {
            return Err(Error::InvalidReference);
        }

        self.push(reference);
        Ok(())
    }

    /// Detaches a chain of `count` free references
    pub(crate) fn reserve(&mut self, count: usize) -> Result<Reservation, Error> {
        if count > self.free_count {
            return Err(Error::ExhaustedPool);
        }

        if count == 0 {
            return Ok(Reservation {
                domid: self.domid,
                table: self.table,
                head: GNTTAB_LIST_END,
            });
        }

        let head = self.head;
        let mut last = head;
        for _ in 1..count {
            last = self.list[index(last)];
        }

        self.head = self.list[index(last)];
        self.list[index(last)] = GNTTAB_LIST_END;
        self.free_count -= count;

        Ok(Reservation {
            domid: self.domid,
            table: self.table,
            head,
        })
    }

    /// Takes the next reference out of a reservation
    pub(crate) fn claim(&mut self, reservation: &mut Reservation) -> Result<grant_ref_t, Error> {
        if reservation.is_empty() {
            return Err(Error::ReservationEmpty);
        }

        let reference = reservation.head;
        reservation.head = self.list[index(reference)];
        self.list[index(reference)] = ALLOCATED;

        Ok(reference)
    }

    /// Puts an allocated reference back at the front of a reservation
    pub(crate) fn release_to_reservation(
        &mut self,
        reservation: &mut Reservation,
        reference: grant_ref_t,
    ) -> Result<(), Error> {
        if reference < NUM_RESERVED_ENTRIES
            || self.list.get(index(reference)) != Some(&ALLOCATED)
        {
            return Err(Error::InvalidReference);
        }

        self.list[index(reference)] = reservation.head;
        reservation.head = reference;

        Ok(())
    }

    /// Splices the unclaimed references of a reservation back into the free list
    pub(crate) fn free_reservation(&mut self, count: usize, reservation: Reservation) {
        if reservation.is_empty() {
            if count != 0 {
                warn!("freeing empty reservation, expected {} references", count);
            }
            return;
        }

        let mut last = reservation.head;
        let mut found = 1;
        while self.list[index(last)] != GNTTAB_LIST_END {
            last = self.list[index(last)];
            found += 1;
        }

        if found != count {
            warn!(
                "reservation holds {} references, caller freed {}",
                found, count
            );
        }

        self.list[index(last)] = self.head;
        self.head = reservation.head;
        self.free_count += found;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: usize) -> RefFreeList {
        let mut list = RefFreeList::new(1, 0);
        list.extend(entries);
        list
    }

    #[test]
    fn reserved_entries_are_never_handed_out() {
        let mut list = list(16);
        assert_eq!(list.free_count(), 8);

        let refs = (0..8)
            .map(|_| list.get_free_entry().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(refs, (8..16).collect::<Vec<_>>());
        assert_eq!(list.get_free_entry(), Err(Error::TableGrowthRequired));

        assert_eq!(list.put_free_entry(3), Err(Error::InvalidReference));
    }

    #[test]
    fn double_free_is_rejected() {
        let mut list = list(16);
        let reference = list.get_free_entry().unwrap();

        assert_eq!(list.put_free_entry(reference), Ok(()));
        assert_eq!(list.put_free_entry(reference), Err(Error::InvalidReference));
        assert_eq!(list.put_free_entry(16), Err(Error::InvalidReference));
        assert_eq!(list.free_count(), 8);
    }

    #[test]
    fn extend_appends_new_references() {
        let mut list = list(16);
        for _ in 0..8 {
            list.get_free_entry().unwrap();
        }

        list.extend(24);
        assert_eq!(list.free_count(), 8);
        assert_eq!(list.get_free_entry(), Ok(16));
    }

    #[test]
    fn reservation_claim_and_release() {
        let mut list = list(16);

        let mut reservation = list.reserve(3).unwrap();
        assert_eq!(list.free_count(), 5);
        assert_eq!(reservation.head(), 8);

        assert_eq!(list.claim(&mut reservation), Ok(8));
        assert_eq!(list.claim(&mut reservation), Ok(9));
        list.release_to_reservation(&mut reservation, 8).unwrap();
        assert_eq!(list.claim(&mut reservation), Ok(8));
        assert_eq!(list.claim(&mut reservation), Ok(10));
        assert_eq!(list.claim(&mut reservation), Err(Error::ReservationEmpty));
        assert_eq!(reservation.head(), GNTTAB_LIST_END);

        // the shared list is untouched by claims
        assert_eq!(list.get_free_entry(), Ok(11));
    }

    #[test]
    fn oversized_reservation_is_refused() {
        let mut list = list(16);
        assert_eq!(list.reserve(9), Err(Error::ExhaustedPool));
        assert_eq!(list.free_count(), 8);
    }

    #[test]
    fn freed_reservation_returns_unclaimed_references() {
        let mut list = list(16);

        let mut reservation = list.reserve(4).unwrap();
        list.claim(&mut reservation).unwrap();
        list.free_reservation(3, reservation);

        assert_eq!(list.free_count(), 7);
        let mut refs = (0..7)
            .map(|_| list.get_free_entry().unwrap())
            .collect::<Vec<_>>();
        refs.sort_unstable();
        assert_eq!(refs, (9..16).collect::<Vec<_>>());
    }

    #[test]
    fn whole_pool_reservation() {
        let mut list = list(16);
        let reservation = list.reserve(8).unwrap();
        assert_eq!(list.get_free_entry(), Err(Error::TableGrowthRequired));

        list.free_reservation(8, reservation);
        assert_eq!(list.free_count(), 8);
    }

    #[test]
    fn reservation_is_cut_from_free_list() {
        let mut list = list(16);
        let mut reservation = list.reserve(2).unwrap();

        // reallocating and releasing into the reservation does not leak the shared list
        let shared = list.get_free_entry().unwrap();
        assert_eq!(shared, 10);
        list.release_to_reservation(&mut reservation, shared).unwrap();

        assert_eq!(list.claim(&mut reservation), Ok(10));
        assert_eq!(list.claim(&mut reservation), Ok(8));
        assert_eq!(list.claim(&mut reservation), Ok(9));
        assert_eq!(list.claim(&mut reservation), Err(Error::ReservationEmpty));
        assert_eq!(list.free_count(), 5);
    }

    #[test]
    fn empty_reservation() {
        let mut list = list(16);
        let reservation = list.reserve(0).unwrap();
        assert!(reservation.is_empty());
        list.free_reservation(0, reservation);
        assert_eq!(list.free_count(), 8);
    }
}
