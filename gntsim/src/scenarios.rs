//! Guest scenarios run against a simulated hypervisor

use {
    crate::config::Config,
    displaydoc::Display,
    gnttab::{
        gnttab_sys::{
            domid_t, gnttab_map_grant_ref_t, grant_handle_t, grant_ref_t, GNTMAP_host_map,
            GNTST_okay,
        },
        grant_table::{
            operations::{grant_table_op, GrantTableOp},
            Error, MapFlags,
        },
        memory::{MachineAddress, MachineFrameNumber, PageFrameNumber, VirtualAddress},
        sim::SimPlatform,
        Hypervisor, MapRequest, UnmapRequest,
    },
    log::{debug, error, info},
};

const FRONTEND: domid_t = 1;
const BACKEND: domid_t = 2;
const BYSTANDER: domid_t = 3;

/// Frames owned by the frontend at boot
const FRONTEND_FRAMES: [MachineFrameNumber; 4] = [
    MachineFrameNumber(0x1000),
    MachineFrameNumber(0x1001),
    MachineFrameNumber(0x1002),
    MachineFrameNumber(0x1003),
];

/// Frames owned by the backend at boot
const BACKEND_FRAMES: [MachineFrameNumber; 2] =
    [MachineFrameNumber(0x2000), MachineFrameNumber(0x2001)];

/// Scenario failure
#[derive(Debug, Display, PartialEq, Eq)]
pub enum Failure {
    /// {step} failed: {error}
    Operation {
        /// What the scenario was doing
        step: &'static str,
        /// Error returned by the hypervisor
        error: Error,
    },
    /// {0}
    Check(&'static str),
}

type Scenario = fn(&Config) -> Result<(), Failure>;

const SCENARIOS: [(&str, Scenario); 4] = [
    ("grant access", grant_access),
    ("batched mapping", batched_mapping),
    ("page transfer", page_transfer),
    ("domain teardown", domain_teardown),
];

/// Runs every scenario and returns how many failed
pub fn run(config: &Config) -> usize {
    info!("RUNNING {} SCENARIOS", SCENARIOS.len());

    let mut failed = 0;
    for (name, scenario) in SCENARIOS {
        match scenario(config) {
            Ok(()) => info!("{}: ok", name),
            Err(failure) => {
                error!("{}: {}", name, failure);
                failed += 1;
            }
        }
    }
    failed
}

trait Step<T> {
    fn step(self, step: &'static str) -> Result<T, Failure>;
}

impl<T> Step<T> for Result<T, Error> {
    fn step(self, step: &'static str) -> Result<T, Failure> {
        self.map_err(|error| Failure::Operation { step, error })
    }
}

fn check(condition: bool, failure: &'static str) -> Result<(), Failure> {
    if condition {
        Ok(())
    } else {
        Err(Failure::Check(failure))
    }
}

fn boot(config: &Config) -> Result<Hypervisor<SimPlatform>, Failure> {
    let hv = Hypervisor::new(SimPlatform::new(), config.grant_table).step("boot")?;

    for domid in [FRONTEND, BACKEND, BYSTANDER] {
        hv.create_domain(domid).step("create domain")?;
        hv.platform().add_domain(domid, 64);
    }
    hv.platform()
        .populate(FRONTEND, FRONTEND_FRAMES)
        .step("populate frontend")?;
    hv.platform()
        .populate(BACKEND, BACKEND_FRAMES)
        .step("populate backend")?;

    Ok(hv)
}

fn host_map(reference: grant_ref_t, host_addr: usize, readonly: bool) -> MapRequest {
    MapRequest {
        host_addr: VirtualAddress(host_addr),
        flags: if readonly {
            MapFlags::HOST_MAP | MapFlags::READONLY
        } else {
            MapFlags::HOST_MAP
        },
        reference,
        dom: FRONTEND,
    }
}

fn host_unmap(host_addr: usize, handle: grant_handle_t) -> UnmapRequest {
    UnmapRequest {
        host_addr: VirtualAddress(host_addr),
        dev_bus_addr: MachineAddress(0),
        handle,
    }
}

/// Frontend shares a ring read-only with the backend
fn grant_access(config: &Config) -> Result<(), Failure> {
    let hv = boot(config)?;
    let frontend = hv.domain(FRONTEND).step("lookup frontend")?;
    let table = frontend.grant_table();

    let reference = table
        .grant_foreign_access(BACKEND, FRONTEND_FRAMES[0], true)
        .step("grant access")?;
    debug!("granted reference {}", reference);

    check(
        hv.map_grant_ref(BACKEND, &host_map(reference, 0x40_0000, false))
            == Err(Error::PermissionDenied),
        "writable mapping of a read-only grant succeeded",
    )?;
    check(
        hv.map_grant_ref(BYSTANDER, &host_map(reference, 0x40_0000, true))
            == Err(Error::PermissionDenied),
        "domain not named by the grant mapped it",
    )?;

    let mapped = hv
        .map_grant_ref(BACKEND, &host_map(reference, 0x40_0000, true))
        .step("map grant")?;
    check(
        hv.platform().mapping(BACKEND, VirtualAddress(0x40_0000)) == Some(FRONTEND_FRAMES[0]),
        "mapping does not point at the granted frame",
    )?;
    check(
        table.query_foreign_access(reference) == Ok(true),
        "mapped grant not reported in use",
    )?;
    check(
        table.end_foreign_access(reference, true) == Err(Error::StillInUse),
        "grant ended while mapped",
    )?;

    hv.unmap_grant_ref(BACKEND, &host_unmap(0x40_0000, mapped.handle))
        .step("unmap grant")?;
    table
        .end_foreign_access(reference, true)
        .step("end access")?;

    hv.dump_table(FRONTEND).step("dump table")
}

/// Backend maps a batch of grants through the guest interface, one of them bogus
fn batched_mapping(config: &Config) -> Result<(), Failure> {
    let hv = boot(config)?;
    let frontend = hv.domain(FRONTEND).step("lookup frontend")?;

    let mut ops = Vec::with_capacity(FRONTEND_FRAMES.len());
    for (i, frame) in FRONTEND_FRAMES.iter().enumerate() {
        let reference = frontend
            .grant_table()
            .grant_foreign_access(BACKEND, *frame, false)
            .step("grant access")?;
        ops.push(gnttab_map_grant_ref_t {
            host_addr: 0x40_0000 + i as u64 * 0x1000,
            flags: GNTMAP_host_map,
            ref_: reference,
            dom: FRONTEND,
            ..Default::default()
        });
    }
    ops[2].ref_ = 0xffff;

    grant_table_op(&hv, BACKEND, GrantTableOp::MapGrantRef(&mut ops));

    for (i, op) in ops.iter().enumerate() {
        debug!("map {} status {} handle {}", i, op.status, op.handle);
    }
    check(
        ops.iter()
            .enumerate()
            .all(|(i, op)| (op.status == GNTST_okay) == (i != 2)),
        "batch statuses do not match the valid elements",
    )?;
    check(
        hv.platform().nr_mappings(BACKEND) == 3,
        "failed element left a mapping behind",
    )?;

    let requests = ops
        .iter()
        .map(|op| host_map(op.ref_, op.host_addr as usize, false))
        .collect::<Vec<_>>();
    check(
        hv.map_grant_refs_all(BYSTANDER, &requests).err() == Some((0, Error::PermissionDenied)),
        "all-or-nothing batch did not stop at the first element",
    )?;
    check(
        hv.platform().nr_mappings(BYSTANDER) == 0,
        "all-or-nothing batch left mappings behind",
    )
}

/// Backend hands a frame over to the frontend through an accept-transfer grant
fn page_transfer(config: &Config) -> Result<(), Failure> {
    let hv = boot(config)?;

    let reference = hv
        .grant_foreign_transfer(FRONTEND, BACKEND, PageFrameNumber(FRONTEND_FRAMES[3].0))
        .step("offer transfer")?;
    check(
        hv.platform().owner(FRONTEND_FRAMES[3]).is_none(),
        "frontend kept the frame it surrendered",
    )?;

    hv.transfer(BACKEND, BACKEND_FRAMES[0], FRONTEND, reference)
        .step("transfer")?;
    check(
        hv.platform().owner(BACKEND_FRAMES[0]) == Some(FRONTEND),
        "transferred frame did not change owner",
    )?;
    check(
        hv.transfer(BACKEND, BACKEND_FRAMES[1], FRONTEND, reference) == Err(Error::NotGranted),
        "grant accepted a second transfer",
    )?;
    check(
        hv.platform().owner(BACKEND_FRAMES[1]) == Some(BACKEND),
        "refused transfer lost the sender's frame",
    )?;

    let received = hv
        .accept_transfer(FRONTEND, reference)
        .step("accept transfer")?;
    check(
        received == Some(BACKEND_FRAMES[0]),
        "accepted frame differs from the transferred one",
    )
}

/// Frontend is destroyed while the backend still maps one of its grants
fn domain_teardown(config: &Config) -> Result<(), Failure> {
    let hv = boot(config)?;

    let reference = hv
        .domain(FRONTEND)
        .step("lookup frontend")?
        .grant_table()
        .grant_foreign_access(BACKEND, FRONTEND_FRAMES[1], false)
        .step("grant access")?;
    let mapped = hv
        .map_grant_ref(BACKEND, &host_map(reference, 0x40_0000, false))
        .step("map grant")?;

    hv.destroy_domain(FRONTEND).step("destroy frontend")?;
    check(
        hv.domain(FRONTEND).err() == Some(Error::DomainDying),
        "destroyed domain still live",
    )?;
    check(
        hv.domains().get(FRONTEND).is_ok(),
        "domain reaped while its grant is mapped",
    )?;

    hv.unmap_grant_ref(BACKEND, &host_unmap(0x40_0000, mapped.handle))
        .step("unmap grant")?;
    check(
        hv.domains().domids() == [BACKEND, BYSTANDER],
        "domain not reaped after its last pin dropped",
    )?;

    hv.destroy_domain(BACKEND).step("destroy backend")?;
    check(
        hv.platform().nr_mappings(BACKEND) == 0,
        "destroyed domain kept mappings",
    )
}
