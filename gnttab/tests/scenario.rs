mod common;

use {
    common::*,
    gnttab::{grant_table::Error, memory::MachineFrameNumber},
};

#[test]
fn read_only_grant_lifecycle() {
    let hv = hypervisor();
    let dom_a = hv.domain(DOM_A).unwrap();
    let table = dom_a.grant_table();

    let reference = grant(&hv, DOM_A, DOM_B, MachineFrameNumber(0x1000), true);

    assert_eq!(
        hv.map_grant_ref(DOM_B, &host_map(DOM_A, reference, 0x40_0000, false)),
        Err(Error::PermissionDenied)
    );
    assert_eq!(table.query_foreign_access(reference), Ok(false));

    let handle = hv
        .map_grant_ref(DOM_B, &host_map(DOM_A, reference, 0x40_0000, true))
        .unwrap()
        .handle;
    assert_eq!(table.query_foreign_access(reference), Ok(true));

    hv.unmap_grant_ref(DOM_B, &host_unmap(0x40_0000, handle))
        .unwrap();
    assert_eq!(table.query_foreign_access(reference), Ok(false));

    assert_eq!(table.end_foreign_access(reference, true), Ok(()));
}

#[test]
fn isolation_between_domains() {
    let hv = hypervisor();
    let reference = grant(&hv, DOM_A, DOM_B, MachineFrameNumber(0x1000), false);

    // C was not named by the grant
    assert_eq!(
        hv.map_grant_ref(DOM_C, &host_map(DOM_A, reference, 0x40_0000, true)),
        Err(Error::PermissionDenied)
    );

    // B cannot map a reference A never granted
    assert_eq!(
        hv.map_grant_ref(DOM_B, &host_map(DOM_A, reference + 1, 0x40_0000, true)),
        Err(Error::NotGranted)
    );

    // nor name a domain that does not exist
    assert_eq!(
        hv.map_grant_ref(DOM_B, &host_map(42, reference, 0x40_0000, true)),
        Err(Error::BadDomain)
    );

    // A cannot grant B a frame it does not own
    let stolen = grant(&hv, DOM_A, DOM_B, MachineFrameNumber(0x9999), false);
    assert_eq!(
        hv.map_grant_ref(DOM_B, &host_map(DOM_A, stolen, 0x40_0000, false)),
        Err(Error::BadPage)
    );

    assert_eq!(hv.platform().nr_mappings(DOM_B), 0);
    assert_eq!(hv.platform().nr_mappings(DOM_C), 0);
    assert_eq!(pin_count(&hv, DOM_A, reference), 0);
}

#[test]
fn pins_follow_maps_and_unmaps() {
    let hv = hypervisor();
    let dom_a = hv.domain(DOM_A).unwrap();
    let table = dom_a.grant_table();
    let reference = grant(&hv, DOM_A, DOM_B, MachineFrameNumber(0x1001), false);

    let addrs = [0x40_0000, 0x40_1000, 0x40_2000];
    let handles = addrs
        .iter()
        .enumerate()
        .map(|(i, addr)| {
            hv.map_grant_ref(DOM_B, &host_map(DOM_A, reference, *addr, i % 2 == 0))
                .unwrap()
                .handle
        })
        .collect::<Vec<_>>();
    assert_eq!(pin_count(&hv, DOM_A, reference), 3);

    for (i, (addr, handle)) in addrs.iter().zip(&handles).enumerate() {
        assert_eq!(
            table.end_foreign_access(reference, false),
            Err(Error::StillInUse)
        );
        hv.unmap_grant_ref(DOM_B, &host_unmap(*addr, *handle))
            .unwrap();
        assert_eq!(pin_count(&hv, DOM_A, reference) as usize, 2 - i);
    }

    assert_eq!(table.nr_active(), 0);
    assert_eq!(table.end_foreign_access(reference, false), Ok(()));
}

#[test]
fn end_access_never_revokes_mapping() {
    let hv = hypervisor();
    let dom_a = hv.domain(DOM_A).unwrap();
    let table = dom_a.grant_table();
    let reference = grant(&hv, DOM_A, DOM_B, MachineFrameNumber(0x1002), false);

    let handle = hv
        .map_grant_ref(DOM_B, &host_map(DOM_A, reference, 0x40_0000, false))
        .unwrap()
        .handle;

    assert_eq!(
        table.end_foreign_access(reference, false),
        Err(Error::StillInUse)
    );
    // nor can the entry be rewritten under the mapping
    assert_eq!(
        table.grant_foreign_access_ref(reference, DOM_C, MachineFrameNumber(0x1003), false),
        Err(Error::StillInUse)
    );

    let status = table.read_status(reference).unwrap();
    assert_eq!(status.domid, DOM_B);
    assert_eq!(status.frame, 0x1002);
    assert_eq!(
        hv.platform()
            .mapping(DOM_B, gnttab::memory::VirtualAddress(0x40_0000)),
        Some(MachineFrameNumber(0x1002))
    );

    hv.unmap_grant_ref(DOM_B, &host_unmap(0x40_0000, handle))
        .unwrap();
    assert_eq!(table.end_foreign_access(reference, false), Ok(()));
}

#[test]
fn regrant_after_end_is_revalidated() {
    let hv = hypervisor();
    let dom_a = hv.domain(DOM_A).unwrap();
    let table = dom_a.grant_table();
    let reference = grant(&hv, DOM_A, DOM_B, MachineFrameNumber(0x1000), false);

    let handle = hv
        .map_grant_ref(DOM_B, &host_map(DOM_A, reference, 0x40_0000, false))
        .unwrap()
        .handle;
    hv.unmap_grant_ref(DOM_B, &host_unmap(0x40_0000, handle))
        .unwrap();
    table.end_foreign_access(reference, false).unwrap();

    // the freed reference is handed out again, now to C and read-only
    let again = grant(&hv, DOM_A, DOM_C, MachineFrameNumber(0x1003), true);
    assert_eq!(again, reference);

    assert_eq!(
        hv.map_grant_ref(DOM_B, &host_map(DOM_A, reference, 0x40_0000, true)),
        Err(Error::PermissionDenied)
    );
    assert_eq!(
        hv.map_grant_ref(DOM_C, &host_map(DOM_A, reference, 0x40_0000, false)),
        Err(Error::PermissionDenied)
    );

    let handle = hv
        .map_grant_ref(DOM_C, &host_map(DOM_A, reference, 0x40_0000, true))
        .unwrap()
        .handle;
    assert_eq!(
        hv.domain(DOM_C).unwrap().grant_table().mapping(handle).unwrap().frame,
        MachineFrameNumber(0x1003)
    );
}
