//! Domains and the domain registry

use {
    crate::grant_table::{Error, GrantTable, GrantTableConfig},
    alloc::{sync::Arc, vec::Vec},
    core::sync::atomic::{AtomicBool, Ordering},
    gnttab_sys::{domid_t, DOMID_FIRST_RESERVED},
    hashbrown::HashMap,
    log::debug,
    spin::RwLock,
};

/// Domain known to the grant table engine
pub struct Domain {
    domid: domid_t,
    grant_table: GrantTable,
    dying: AtomicBool,
}

impl Domain {
    /// Creates a domain with an empty grant table
    pub fn new(domid: domid_t, config: GrantTableConfig) -> Result<Self, Error> {
        Ok(Self {
            domid,
            grant_table: GrantTable::new(domid, config)?,
            dying: AtomicBool::new(false),
        })
    }

    /// Domain ID
    pub fn domid(&self) -> domid_t {
        self.domid
    }

    /// Grant table of the domain
    pub fn grant_table(&self) -> &GrantTable {
        &self.grant_table
    }

    /// Whether the domain is being destroyed
    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Acquire)
    }

    /// Marks the domain as being destroyed, returns false if it already was
    pub(crate) fn set_dying(&self) -> bool {
        !self.dying.swap(true, Ordering::SeqCst)
    }
}

/// Live domains by ID
///
/// The registry lock is only held long enough to clone a domain handle, never across grant table
/// operations.
#[derive(Default)]
pub struct DomainRegistry {
    domains: RwLock<HashMap<domid_t, Arc<Domain>>>,
}

impl DomainRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a domain
    pub fn insert(&self, domain: Domain) -> Result<Arc<Domain>, Error> {
        let domid = domain.domid();
        if domid >= DOMID_FIRST_RESERVED {
            return Err(Error::BadDomain);
        }

        let mut domains = self.domains.write();
        if domains.contains_key(&domid) {
            return Err(Error::BadDomain);
        }

        let domain = Arc::new(domain);
        domains.insert(domid, domain.clone());

        debug!("registered domain {}", domid);

        Ok(domain)
    }

    /// Looks up a domain
    pub fn get(&self, domid: domid_t) -> Result<Arc<Domain>, Error> {
        self.domains
            .read()
            .get(&domid)
            .cloned()
            .ok_or(Error::BadDomain)
    }

    /// Unregisters a domain
    pub fn remove(&self, domid: domid_t) -> Option<Arc<Domain>> {
        let domain = self.domains.write().remove(&domid);
        if domain.is_some() {
            debug!("unregistered domain {}", domid);
        }
        domain
    }

    /// IDs of all registered domains
    pub fn domids(&self) -> Vec<domid_t> {
        let mut domids = self.domains.read().keys().copied().collect::<Vec<_>>();
        domids.sort_unstable();
        domids
    }
}
