//! Grant table operation dispatch
//!
//! Takes batches of `gnttab_*` argument structures that have already been copied out of guest
//! memory, runs each element through the [`Hypervisor`] and writes its `status` and outputs back
//! in place. Every element is attempted regardless of earlier failures.

use {
    super::{Error, MapFlags},
    crate::{
        hypervisor::{Hypervisor, MapRequest, UnmapRequest},
        memory::{MachineAddress, MachineFrameNumber, VirtualAddress},
        platform::Platform,
    },
    core::convert::TryInto,
    gnttab_sys::{
        domid_t, gnttab_dump_table_t, gnttab_map_grant_ref_t, gnttab_query_size_t,
        gnttab_setup_table_t, gnttab_transfer_t, gnttab_unmap_grant_ref_t, xen_pfn_t,
        GNTST_okay, GNTTABOP_dump_table, GNTTABOP_map_grant_ref, GNTTABOP_query_size,
        GNTTABOP_setup_table, GNTTABOP_transfer, GNTTABOP_unmap_grant_ref, DOMID_SELF,
        INVALID_GRANT_HANDLE,
    },
    log::trace,
};

/// Decoded grant table operation
#[derive(Debug)]
pub enum GrantTableOp<'a> {
    /// Map grants of other domains
    MapGrantRef(&'a mut [gnttab_map_grant_ref_t]),
    /// Remove mappings
    UnmapGrantRef(&'a mut [gnttab_unmap_grant_ref_t]),
    /// Grow a table and report its frames into the frame list
    SetupTable(&'a mut gnttab_setup_table_t, &'a mut [xen_pfn_t]),
    /// Log a table
    DumpTable(&'a mut gnttab_dump_table_t),
    /// Hand frames over to other domains
    Transfer(&'a mut [gnttab_transfer_t]),
    /// Report the size of a table
    QuerySize(&'a mut gnttab_query_size_t),
}

impl GrantTableOp<'_> {
    /// `GNTTABOP_*` command number
    pub fn cmd(&self) -> u32 {
        match self {
            Self::MapGrantRef(_) => GNTTABOP_map_grant_ref,
            Self::UnmapGrantRef(_) => GNTTABOP_unmap_grant_ref,
            Self::SetupTable(..) => GNTTABOP_setup_table,
            Self::DumpTable(_) => GNTTABOP_dump_table,
            Self::Transfer(_) => GNTTABOP_transfer,
            Self::QuerySize(_) => GNTTABOP_query_size,
        }
    }
}

/// Resolves the target domain of a table operation, which must be the caller itself
fn target(caller: domid_t, dom: domid_t) -> Result<domid_t, Error> {
    if dom == DOMID_SELF || dom == caller {
        Ok(caller)
    } else {
        Err(Error::PermissionDenied)
    }
}

fn status<T>(result: &Result<T, Error>) -> i16 {
    match result {
        Ok(_) => GNTST_okay,
        Err(e) => e.status(),
    }
}

/// Performs a grant table operation on behalf of `caller`
pub fn grant_table_op<P: Platform>(hv: &Hypervisor<P>, caller: domid_t, op: GrantTableOp<'_>) {
    trace!("domain {} grant table op {}", caller, op.cmd());

    match op {
        GrantTableOp::MapGrantRef(ops) => ops
            .iter_mut()
            .for_each(|op| map_grant_ref(hv, caller, op)),
        GrantTableOp::UnmapGrantRef(ops) => ops
            .iter_mut()
            .for_each(|op| op.status = status(&unmap_grant_ref(hv, caller, op))),
        GrantTableOp::SetupTable(op, frame_list) => {
            op.status = status(&setup_table(hv, caller, op, frame_list))
        }
        GrantTableOp::DumpTable(op) => {
            op.status = status(&target(caller, op.dom).and_then(|dom| hv.dump_table(dom)))
        }
        GrantTableOp::Transfer(ops) => ops
            .iter_mut()
            .for_each(|op| op.status = status(&transfer(hv, caller, op))),
        GrantTableOp::QuerySize(op) => op.status = status(&query_size(hv, caller, op)),
    }
}

fn map_grant_ref<P: Platform>(hv: &Hypervisor<P>, caller: domid_t, op: &mut gnttab_map_grant_ref_t) {
    let result = MapFlags::from_bits(op.flags)
        .ok_or(Error::BadFlags)
        .and_then(|flags| {
            let request = MapRequest {
                host_addr: VirtualAddress(
                    op.host_addr
                        .try_into()
                        .map_err(|_| Error::BadVirtualAddress)?,
                ),
                flags,
                reference: op.ref_,
                dom: op.dom,
            };
            hv.map_grant_ref(caller, &request)
        });

    op.status = status(&result);
    match result {
        Ok(result) => {
            op.handle = result.handle;
            op.dev_bus_addr = result
                .dev_bus_addr
                .0
                .try_into()
                .expect("Failed to convert usize to u64");
        }
        Err(_) => op.handle = INVALID_GRANT_HANDLE,
    }
}

fn unmap_grant_ref<P: Platform>(
    hv: &Hypervisor<P>,
    caller: domid_t,
    op: &gnttab_unmap_grant_ref_t,
) -> Result<(), Error> {
    let request = UnmapRequest {
        host_addr: VirtualAddress(
            op.host_addr
                .try_into()
                .map_err(|_| Error::BadVirtualAddress)?,
        ),
        dev_bus_addr: MachineAddress(
            op.dev_bus_addr
                .try_into()
                .map_err(|_| Error::BadDeviceAddress)?,
        ),
        handle: op.handle,
    };

    hv.unmap_grant_ref(caller, &request)
}

fn setup_table<P: Platform>(
    hv: &Hypervisor<P>,
    caller: domid_t,
    op: &gnttab_setup_table_t,
    frame_list: &mut [xen_pfn_t],
) -> Result<(), Error> {
    let dom = target(caller, op.dom)?;
    let nr_frames = op
        .nr_frames
        .try_into()
        .expect("Failed to convert u32 to usize");

    if frame_list.len() < nr_frames {
        return Err(Error::BadVirtualAddress);
    }

    let frames = hv.setup_table(dom, nr_frames)?;
    for (slot, frame) in frame_list.iter_mut().zip(frames) {
        *slot = frame.0.try_into().expect("Failed to convert usize to u64");
    }

    Ok(())
}

fn transfer<P: Platform>(
    hv: &Hypervisor<P>,
    caller: domid_t,
    op: &gnttab_transfer_t,
) -> Result<(), Error> {
    let frame = MachineFrameNumber(op.mfn.try_into().map_err(|_| Error::BadPage)?);
    hv.transfer(caller, frame, op.domid, op.ref_)
}

fn query_size<P: Platform>(
    hv: &Hypervisor<P>,
    caller: domid_t,
    op: &mut gnttab_query_size_t,
) -> Result<(), Error> {
    let (nr_frames, max_nr_frames) = hv.query_size(target(caller, op.dom)?)?;

    op.nr_frames = nr_frames
        .try_into()
        .expect("Failed to convert usize to u32");
    op.max_nr_frames = max_nr_frames
        .try_into()
        .expect("Failed to convert usize to u32");

    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            grant_table::{check_status, GrantStatusError, GrantTableConfig},
            memory::PageFrameNumber,
            sim::SimPlatform,
        },
        gnttab_sys::{GNTMAP_host_map, GNTMAP_readonly, GNTST_bad_gntref, GNTST_permission_denied},
    };

    fn hypervisor() -> Hypervisor<SimPlatform> {
        let hv = Hypervisor::new(SimPlatform::new(), GrantTableConfig::default()).unwrap();
        for domid in [1, 2] {
            hv.create_domain(domid).unwrap();
            hv.platform().add_domain(domid, 16);
        }
        hv.platform()
            .populate(1, [MachineFrameNumber(0x1000)])
            .unwrap();
        hv
    }

    #[test]
    fn map_and_unmap_batches_report_per_element() {
        let hv = hypervisor();
        let reference = hv
            .domain(1)
            .unwrap()
            .grant_table()
            .grant_foreign_access(2, MachineFrameNumber(0x1000), true)
            .unwrap();

        let mut maps = [
            gnttab_map_grant_ref_t {
                host_addr: 0x10_0000,
                flags: GNTMAP_host_map | GNTMAP_readonly,
                ref_: reference,
                dom: 1,
                ..Default::default()
            },
            gnttab_map_grant_ref_t {
                host_addr: 0x20_0000,
                flags: GNTMAP_host_map,
                ref_: reference,
                dom: 1,
                ..Default::default()
            },
            gnttab_map_grant_ref_t {
                host_addr: 0x30_0000,
                flags: GNTMAP_host_map | GNTMAP_readonly,
                ref_: 9999,
                dom: 1,
                ..Default::default()
            },
        ];
        grant_table_op(&hv, 2, GrantTableOp::MapGrantRef(&mut maps));

        assert_eq!(maps[0].status, GNTST_okay);
        assert_eq!(maps[1].status, GNTST_permission_denied);
        assert_eq!(maps[1].handle, INVALID_GRANT_HANDLE);
        assert_eq!(maps[2].status, GNTST_bad_gntref);
        assert_eq!(
            check_status(maps[2].status),
            Err(GrantStatusError::BadGntref)
        );

        let mut unmaps = [
            gnttab_unmap_grant_ref_t {
                host_addr: 0x10_0000,
                handle: maps[0].handle,
                ..Default::default()
            },
            gnttab_unmap_grant_ref_t {
                host_addr: 0x10_0000,
                handle: maps[0].handle,
                ..Default::default()
            },
        ];
        grant_table_op(&hv, 2, GrantTableOp::UnmapGrantRef(&mut unmaps));

        assert_eq!(unmaps[0].status, GNTST_okay);
        assert_eq!(check_status(unmaps[1].status), Err(GrantStatusError::BadHandle));
    }

    #[test]
    fn setup_and_query_own_table() {
        let hv = hypervisor();

        let mut frame_list = [0; 4];
        let mut setup = gnttab_setup_table_t {
            dom: DOMID_SELF,
            nr_frames: 4,
            status: 0,
            frame_list: core::ptr::null_mut(),
        };
        grant_table_op(&hv, 1, GrantTableOp::SetupTable(&mut setup, &mut frame_list));
        assert_eq!(setup.status, GNTST_okay);
        assert!(frame_list.iter().all(|frame| *frame != 0));

        let mut query = gnttab_query_size_t {
            dom: DOMID_SELF,
            ..Default::default()
        };
        grant_table_op(&hv, 1, GrantTableOp::QuerySize(&mut query));
        assert_eq!(query.status, GNTST_okay);
        assert_eq!((query.nr_frames, query.max_nr_frames), (4, 32));

        let mut query = gnttab_query_size_t {
            dom: 2,
            ..Default::default()
        };
        grant_table_op(&hv, 1, GrantTableOp::QuerySize(&mut query));
        assert_eq!(query.status, GNTST_permission_denied);

        let mut dump = gnttab_dump_table_t {
            dom: DOMID_SELF,
            ..Default::default()
        };
        let op = GrantTableOp::DumpTable(&mut dump);
        assert_eq!(op.cmd(), GNTTABOP_dump_table);
        grant_table_op(&hv, 1, op);
        assert_eq!(dump.status, GNTST_okay);
    }

    #[test]
    fn short_frame_list_is_rejected() {
        let hv = hypervisor();

        let mut frame_list = [0; 1];
        let mut setup = gnttab_setup_table_t {
            dom: DOMID_SELF,
            nr_frames: 2,
            status: 0,
            frame_list: core::ptr::null_mut(),
        };
        grant_table_op(&hv, 1, GrantTableOp::SetupTable(&mut setup, &mut frame_list));
        assert_eq!(
            check_status(setup.status),
            Err(GrantStatusError::BadVirtAddr)
        );
        assert_eq!(hv.query_size(1), Ok((1, 32)));
    }

    #[test]
    fn transfer_batch() {
        let hv = hypervisor();
        // domain 2 cannot offer a frame it does not own
        assert_eq!(
            hv.grant_foreign_transfer(2, 1, PageFrameNumber(0x1000)),
            Err(Error::TransferFailed)
        );

        hv.platform()
            .populate(2, [MachineFrameNumber(0x2000)])
            .unwrap();
        let reference = hv
            .grant_foreign_transfer(2, 1, PageFrameNumber(0x2000))
            .unwrap();

        let mut transfers = [
            gnttab_transfer_t {
                mfn: 0x1000,
                domid: 2,
                ref_: reference,
                ..Default::default()
            },
            gnttab_transfer_t {
                mfn: 0x1000,
                domid: 2,
                ref_: reference,
                ..Default::default()
            },
        ];
        grant_table_op(&hv, 1, GrantTableOp::Transfer(&mut transfers));

        assert_eq!(transfers[0].status, GNTST_okay);
        assert_ne!(transfers[1].status, GNTST_okay);
        assert_eq!(hv.platform().owner(MachineFrameNumber(0x1000)), Some(2));
        assert_eq!(
            hv.accept_transfer(2, reference),
            Ok(Some(MachineFrameNumber(0x1000)))
        );
    }
}
