//! Raw grant table interface
//!
//! `#[repr(C)]` layouts and constants shared between guests and the grant table engine, following
//! the `grant_table.h` public interface (version 1 entries).

#![no_std]
#![allow(non_camel_case_types, non_upper_case_globals)]

use cty::{int16_t, uint16_t, uint32_t, uint64_t};

/// Domain identifier
pub type domid_t = uint16_t;

/// Index into a domain's grant table
pub type grant_ref_t = uint32_t;

/// Map-track handle returned by `GNTTABOP_map_grant_ref`
pub type grant_handle_t = uint32_t;

/// Machine frame number as seen by a guest
pub type xen_pfn_t = uint64_t;

/// Domain ID of the calling domain
pub const DOMID_SELF: domid_t = 0x7FF0;

/// First domain ID that does not name a real domain
pub const DOMID_FIRST_RESERVED: domid_t = 0x7FF0;

/// Grant entry as laid out in shared memory
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct grant_entry_v1 {
    /// `GTF_*` flags
    pub flags: uint16_t,
    /// Domain being granted privileges
    pub domid: domid_t,
    /// Frame being granted, or the frame received by a completed transfer
    pub frame: uint32_t,
}
/// Grant entry as laid out in shared memory
pub type grant_entry_v1_t = grant_entry_v1;

/// Entry is unused
pub const GTF_invalid: uint16_t = 0;
/// Allow the named domain to map or access the frame
pub const GTF_permit_access: uint16_t = 1;
/// Allow the named domain to transfer a frame into this entry
pub const GTF_accept_transfer: uint16_t = 2;
/// Transitive grant, not supported by version 1 tables
pub const GTF_transitive: uint16_t = 3;
/// Mask of the entry type bits
pub const GTF_type_mask: uint16_t = 3;
/// Restrict mappings to read-only
pub const GTF_readonly: uint16_t = 1 << 2;
/// Written by the hypervisor while the frame is mapped
pub const GTF_reading: uint16_t = 1 << 3;
/// Written by the hypervisor while the frame is mapped writable
pub const GTF_writing: uint16_t = 1 << 4;
/// Written by the hypervisor once a transfer into the entry has started
pub const GTF_transfer_committed: uint16_t = 1 << 2;
/// Written by the hypervisor once `frame` holds the transferred frame
pub const GTF_transfer_completed: uint16_t = 1 << 3;

/// Map for access by devices
pub const GNTMAP_device_map: uint32_t = 1 << 0;
/// Map for access by the host CPU
pub const GNTMAP_host_map: uint32_t = 1 << 1;
/// Map read-only
pub const GNTMAP_readonly: uint32_t = 1 << 2;
/// Map into the application's address space
pub const GNTMAP_application_map: uint32_t = 1 << 3;
/// `host_addr` names a page table entry rather than a virtual address
pub const GNTMAP_contains_pte: uint32_t = 1 << 4;

/// Handle value reported for failed mappings
pub const INVALID_GRANT_HANDLE: grant_handle_t = !0;

/// Map a grant reference
pub const GNTTABOP_map_grant_ref: uint32_t = 0;
/// Unmap a previously mapped grant reference
pub const GNTTABOP_unmap_grant_ref: uint32_t = 1;
/// Size the grant table of a domain
pub const GNTTABOP_setup_table: uint32_t = 2;
/// Dump the grant table to the hypervisor console
pub const GNTTABOP_dump_table: uint32_t = 3;
/// Transfer a frame into an accept-transfer grant
pub const GNTTABOP_transfer: uint32_t = 4;
/// Query the current and maximum size of a grant table
pub const GNTTABOP_query_size: uint32_t = 6;

/// Operation succeeded
pub const GNTST_okay: int16_t = 0;
/// Unspecified failure
pub const GNTST_general_error: int16_t = -1;
/// Unrecognised domain
pub const GNTST_bad_domain: int16_t = -2;
/// Unrecognised or inappropriate grant reference
pub const GNTST_bad_gntref: int16_t = -3;
/// Unrecognised or inappropriate handle
pub const GNTST_bad_handle: int16_t = -4;
/// Inappropriate virtual address to map
pub const GNTST_bad_virt_addr: int16_t = -5;
/// Inappropriate device address to unmap
pub const GNTST_bad_dev_addr: int16_t = -6;
/// Out of space in the I/O MMU or map-track table
pub const GNTST_no_device_space: int16_t = -7;
/// Not enough privilege for the operation
pub const GNTST_permission_denied: int16_t = -8;
/// Specified page was invalid for the operation
pub const GNTST_bad_page: int16_t = -9;
/// Copy arguments cross a page boundary
pub const GNTST_bad_copy_arg: int16_t = -10;
/// Transfer page address too large
pub const GNTST_address_too_big: int16_t = -11;
/// Operation not done, try again
pub const GNTST_eagain: int16_t = -12;
/// Out of space
pub const GNTST_no_space: int16_t = -13;

/// `GNTTABOP_map_grant_ref` argument
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct gnttab_map_grant_ref {
    /// IN: address to map the frame at
    pub host_addr: uint64_t,
    /// IN: `GNTMAP_*` flags
    pub flags: uint32_t,
    /// IN: grant reference in the granting domain's table
    pub ref_: grant_ref_t,
    /// IN: granting domain
    pub dom: domid_t,
    /// OUT: `GNTST_*` status
    pub status: int16_t,
    /// OUT: map-track handle
    pub handle: grant_handle_t,
    /// OUT: bus address for device mappings
    pub dev_bus_addr: uint64_t,
}
/// `GNTTABOP_map_grant_ref` argument
pub type gnttab_map_grant_ref_t = gnttab_map_grant_ref;

/// `GNTTABOP_unmap_grant_ref` argument
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct gnttab_unmap_grant_ref {
    /// IN: address the frame is mapped at
    pub host_addr: uint64_t,
    /// IN: bus address returned by the map, or zero
    pub dev_bus_addr: uint64_t,
    /// IN: map-track handle
    pub handle: grant_handle_t,
    /// OUT: `GNTST_*` status
    pub status: int16_t,
}
/// `GNTTABOP_unmap_grant_ref` argument
pub type gnttab_unmap_grant_ref_t = gnttab_unmap_grant_ref;

/// `GNTTABOP_setup_table` argument
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct gnttab_setup_table {
    /// IN: domain whose table is sized
    pub dom: domid_t,
    /// IN: number of frames the table should span
    pub nr_frames: uint32_t,
    /// OUT: `GNTST_*` status
    pub status: int16_t,
    /// OUT: frame numbers of the table, filled in by the page-table layer
    pub frame_list: *mut uint64_t,
}
/// `GNTTABOP_setup_table` argument
pub type gnttab_setup_table_t = gnttab_setup_table;

/// `GNTTABOP_dump_table` argument
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct gnttab_dump_table {
    /// IN: domain whose table is dumped
    pub dom: domid_t,
    /// OUT: `GNTST_*` status
    pub status: int16_t,
}
/// `GNTTABOP_dump_table` argument
pub type gnttab_dump_table_t = gnttab_dump_table;

/// `GNTTABOP_transfer` argument
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct gnttab_transfer {
    /// IN: frame surrendered by the calling domain
    pub mfn: xen_pfn_t,
    /// IN: receiving domain
    pub domid: domid_t,
    /// IN: accept-transfer reference in the receiver's table
    pub ref_: grant_ref_t,
    /// OUT: `GNTST_*` status
    pub status: int16_t,
}
/// `GNTTABOP_transfer` argument
pub type gnttab_transfer_t = gnttab_transfer;

/// `GNTTABOP_query_size` argument
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct gnttab_query_size {
    /// IN: domain whose table is queried
    pub dom: domid_t,
    /// OUT: current number of frames
    pub nr_frames: uint32_t,
    /// OUT: maximum number of frames
    pub max_nr_frames: uint32_t,
    /// OUT: `GNTST_*` status
    pub status: int16_t,
}
/// `GNTTABOP_query_size` argument
pub type gnttab_query_size_t = gnttab_query_size;
