//! Grant table errors and guest-visible status codes

use {
    displaydoc::Display,
    gnttab_sys::{
        GNTST_address_too_big, GNTST_bad_copy_arg, GNTST_bad_dev_addr, GNTST_bad_domain,
        GNTST_bad_gntref, GNTST_bad_handle, GNTST_bad_page, GNTST_bad_virt_addr, GNTST_eagain,
        GNTST_general_error, GNTST_no_device_space, GNTST_no_space, GNTST_okay,
        GNTST_permission_denied,
    },
};

/// Grant table error
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// grant reference is out of range or malformed
    InvalidReference,
    /// requested access exceeds what the grant permits
    PermissionDenied,
    /// grant entry does not permit the requested operation
    NotGranted,
    /// grant is still in use by a remote domain
    StillInUse,
    /// reservation has no references left
    ReservationEmpty,
    /// not enough free grant references
    ExhaustedPool,
    /// grant table must grow before a reference can be allocated
    TableGrowthRequired,
    /// memory reservation update rejected the transfer
    TransferFailed,
    /// handle does not name a live mapping
    BadHandle,
    /// domain does not exist
    BadDomain,
    /// domain is being destroyed
    DomainDying,
    /// invalid combination of mapping flags
    BadFlags,
    /// host virtual address is not valid for this mapping
    BadVirtualAddress,
    /// device bus address does not match the mapping
    BadDeviceAddress,
    /// frame is not owned by the granting domain
    BadPage,
    /// no map-track entries left in the mapping domain
    MapTrackExhausted,
    /// page table update failed
    PageTable,
    /// grant table configuration is invalid
    InvalidConfig,
}

impl Error {
    /// `GNTST_*` status reported to the guest for this error
    pub fn status(self) -> i16 {
        GrantStatusError::from(self).code()
    }
}

/// Status code returned to a guest by a grant table operation
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum GrantStatusError {
    /// general error
    GeneralError,
    /// unrecognised domain
    BadDomain,
    /// unrecognised or inappropriate grant reference
    BadGntref,
    /// unrecognised or inappropriate handle
    BadHandle,
    /// inappropriate virtual address to map
    BadVirtAddr,
    /// inappropriate device address to unmap
    BadDevAddr,
    /// out of space in I/O MMU
    NoDeviceSpace,
    /// not enough privilege for operation
    PermissionDenied,
    /// specified page was invalid for operation
    BadPage,
    /// copy arguments cross page boundary
    BadCopyArg,
    /// page address size too large
    AddressTooBig,
    /// operation not done; try again
    Eagain,
    /// out of space
    NoSpace,
    /// unknown status {0}
    Unknown(i16),
}

impl GrantStatusError {
    /// Raw `GNTST_*` code
    pub fn code(self) -> i16 {
        match self {
            Self::GeneralError => GNTST_general_error,
            Self::BadDomain => GNTST_bad_domain,
            Self::BadGntref => GNTST_bad_gntref,
            Self::BadHandle => GNTST_bad_handle,
            Self::BadVirtAddr => GNTST_bad_virt_addr,
            Self::BadDevAddr => GNTST_bad_dev_addr,
            Self::NoDeviceSpace => GNTST_no_device_space,
            Self::PermissionDenied => GNTST_permission_denied,
            Self::BadPage => GNTST_bad_page,
            Self::BadCopyArg => GNTST_bad_copy_arg,
            Self::AddressTooBig => GNTST_address_too_big,
            Self::Eagain => GNTST_eagain,
            Self::NoSpace => GNTST_no_space,
            Self::Unknown(code) => code,
        }
    }
}

impl From<i16> for GrantStatusError {
    fn from(code: i16) -> Self {
        match code {
            GNTST_general_error => Self::GeneralError,
            GNTST_bad_domain => Self::BadDomain,
            GNTST_bad_gntref => Self::BadGntref,
            GNTST_bad_handle => Self::BadHandle,
            GNTST_bad_virt_addr => Self::BadVirtAddr,
            GNTST_bad_dev_addr => Self::BadDevAddr,
            GNTST_no_device_space => Self::NoDeviceSpace,
            GNTST_permission_denied => Self::PermissionDenied,
            GNTST_bad_page => Self::BadPage,
            GNTST_bad_copy_arg => Self::BadCopyArg,
            GNTST_address_too_big => Self::AddressTooBig,
            GNTST_eagain => Self::Eagain,
            GNTST_no_space => Self::NoSpace,
            code => Self::Unknown(code),
        }
    }
}

impl From<Error> for GrantStatusError {
    fn from(error: Error) -> Self {
        match error {
            Error::InvalidReference => Self::BadGntref,
            Error::PermissionDenied => Self::PermissionDenied,
            Error::BadHandle => Self::BadHandle,
            Error::BadDomain | Error::DomainDying => Self::BadDomain,
            Error::BadVirtualAddress => Self::BadVirtAddr,
            Error::BadDeviceAddress => Self::BadDevAddr,
            Error::BadPage => Self::BadPage,
            Error::MapTrackExhausted => Self::NoDeviceSpace,
            Error::ReservationEmpty | Error::ExhaustedPool | Error::TableGrowthRequired => {
                Self::NoSpace
            }
            Error::NotGranted
            | Error::StillInUse
            | Error::TransferFailed
            | Error::BadFlags
            | Error::PageTable
            | Error::InvalidConfig => Self::GeneralError,
        }
    }
}

/// Decodes a per-element status into a result
pub fn check_status(status: i16) -> Result<(), GrantStatusError> {
    if status == GNTST_okay {
        Ok(())
    } else {
        Err(GrantStatusError::from(status))
    }
}
