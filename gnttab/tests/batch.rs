mod common;

use {
    common::*,
    gnttab::{
        grant_table::{
            operations::{grant_table_op, GrantTableOp},
            Error, GrantStatusError,
        },
        gnttab_sys::{gnttab_map_grant_ref_t, GNTMAP_host_map, GNTST_okay, INVALID_GRANT_HANDLE},
        memory::VirtualAddress,
    },
};

#[test]
fn partial_failure_attempts_every_element() {
    let hv = hypervisor();
    let refs = DOM_A_FRAMES
        .iter()
        .map(|frame| grant(&hv, DOM_A, DOM_B, *frame, false))
        .collect::<Vec<_>>();

    let mut requests = refs
        .iter()
        .enumerate()
        .map(|(i, reference)| host_map(DOM_A, *reference, 0x40_0000 + i * 0x1000, false))
        .collect::<Vec<_>>();
    requests[2].reference = 0xffff;

    let results = hv.map_grant_refs(DOM_B, &requests);
    assert_eq!(results.len(), 4);
    assert!(results[0].is_ok());
    assert!(results[1].is_ok());
    assert_eq!(results[2], Err(Error::InvalidReference));
    assert!(results[3].is_ok());

    // the failing element left nothing behind
    assert_eq!(hv.platform().mapping(DOM_B, VirtualAddress(0x40_2000)), None);
    assert_eq!(hv.platform().nr_mappings(DOM_B), 3);
    assert_eq!(pin_count(&hv, DOM_A, refs[2]), 0);
    for i in [0, 1, 3] {
        assert_eq!(pin_count(&hv, DOM_A, refs[i]), 1);
    }
}

#[test]
fn abi_batch_reports_status_per_element() {
    let hv = hypervisor();
    let refs = DOM_A_FRAMES
        .iter()
        .map(|frame| grant(&hv, DOM_A, DOM_B, *frame, false))
        .collect::<Vec<_>>();

    let mut ops = refs
        .iter()
        .enumerate()
        .map(|(i, reference)| gnttab_map_grant_ref_t {
            host_addr: 0x40_0000 + i as u64 * 0x1000,
            flags: GNTMAP_host_map,
            ref_: *reference,
            dom: DOM_A,
            ..Default::default()
        })
        .collect::<Vec<_>>();
    ops[2].ref_ = 0xffff;

    grant_table_op(&hv, DOM_B, GrantTableOp::MapGrantRef(&mut ops));

    assert_eq!(ops[0].status, GNTST_okay);
    assert_eq!(ops[1].status, GNTST_okay);
    assert_eq!(
        GrantStatusError::from(ops[2].status),
        GrantStatusError::BadGntref
    );
    assert_eq!(ops[2].handle, INVALID_GRANT_HANDLE);
    assert_eq!(ops[3].status, GNTST_okay);

    let handles = [ops[0].handle, ops[1].handle, ops[3].handle];
    assert!(handles.iter().all(|handle| *handle != INVALID_GRANT_HANDLE));
    assert_eq!(
        hv.domain(DOM_B).unwrap().grant_table().mappings().len(),
        3
    );
}

#[test]
fn all_or_nothing_batch_rolls_back() {
    let hv = hypervisor();
    let refs = DOM_A_FRAMES
        .iter()
        .map(|frame| grant(&hv, DOM_A, DOM_B, *frame, false))
        .collect::<Vec<_>>();

    let mut requests = refs
        .iter()
        .enumerate()
        .map(|(i, reference)| host_map(DOM_A, *reference, 0x40_0000 + i * 0x1000, false))
        .collect::<Vec<_>>();
    requests[2].reference = 0xffff;

    assert_eq!(
        hv.map_grant_refs_all(DOM_B, &requests),
        Err((2, Error::InvalidReference))
    );

    assert_eq!(hv.platform().nr_mappings(DOM_B), 0);
    assert!(hv.domain(DOM_B).unwrap().grant_table().mappings().is_empty());
    for reference in &refs {
        assert_eq!(pin_count(&hv, DOM_A, *reference), 0);
    }

    requests[2].reference = refs[2];
    let results = hv.map_grant_refs_all(DOM_B, &requests).unwrap();
    assert_eq!(results.len(), 4);

    let unmaps = requests
        .iter()
        .zip(&results)
        .map(|(request, result)| host_unmap(request.host_addr.0, result.handle))
        .collect::<Vec<_>>();
    assert!(hv
        .unmap_grant_refs(DOM_B, &unmaps)
        .iter()
        .all(Result::is_ok));
    assert_eq!(hv.platform().nr_mappings(DOM_B), 0);
}
