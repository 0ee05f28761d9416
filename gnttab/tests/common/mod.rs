#![allow(dead_code)]

use gnttab::{
    grant_table::{GrantTableConfig, MapFlags},
    gnttab_sys::{domid_t, grant_handle_t, grant_ref_t},
    memory::{MachineAddress, MachineFrameNumber, VirtualAddress},
    sim::SimPlatform,
    Hypervisor, MapRequest, UnmapRequest,
};

pub const DOM_A: domid_t = 1;
pub const DOM_B: domid_t = 2;
pub const DOM_C: domid_t = 3;

/// Frames owned by domain A at boot
pub const DOM_A_FRAMES: [MachineFrameNumber; 4] = [
    MachineFrameNumber(0x1000),
    MachineFrameNumber(0x1001),
    MachineFrameNumber(0x1002),
    MachineFrameNumber(0x1003),
];

/// Hypervisor with domains A, B and C, where A owns `DOM_A_FRAMES`
pub fn hypervisor_with(config: GrantTableConfig) -> Hypervisor<SimPlatform> {
    let hv = Hypervisor::new(SimPlatform::new(), config).unwrap();

    for domid in [DOM_A, DOM_B, DOM_C] {
        hv.create_domain(domid).unwrap();
        hv.platform().add_domain(domid, 64);
    }
    hv.platform().populate(DOM_A, DOM_A_FRAMES).unwrap();

    hv
}

pub fn hypervisor() -> Hypervisor<SimPlatform> {
    hypervisor_with(GrantTableConfig::default())
}

pub fn grant(
    hv: &Hypervisor<SimPlatform>,
    granter: domid_t,
    grantee: domid_t,
    frame: MachineFrameNumber,
    readonly: bool,
) -> grant_ref_t {
    hv.domain(granter)
        .unwrap()
        .grant_table()
        .grant_foreign_access(grantee, frame, readonly)
        .unwrap()
}

pub fn host_map(
    granter: domid_t,
    reference: grant_ref_t,
    host_addr: usize,
    readonly: bool,
) -> MapRequest {
    let mut flags = MapFlags::HOST_MAP;
    if readonly {
        flags |= MapFlags::READONLY;
    }

    MapRequest {
        host_addr: VirtualAddress(host_addr),
        flags,
        reference,
        dom: granter,
    }
}

pub fn host_unmap(host_addr: usize, handle: grant_handle_t) -> UnmapRequest {
    UnmapRequest {
        host_addr: VirtualAddress(host_addr),
        dev_bus_addr: MachineAddress(0),
        handle,
    }
}

pub fn pin_count(hv: &Hypervisor<SimPlatform>, granter: domid_t, reference: grant_ref_t) -> u32 {
    hv.domains()
        .get(granter)
        .unwrap()
        .grant_table()
        .pin_count(reference)
        .unwrap()
}
