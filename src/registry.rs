use ahash::AHashMap as HashMap;
use log::{info, warn};
use parking_lot::RwLock;
use std::sync::Arc;

use crate::association::ThreadAssociations;
use crate::config::DomainConfig;
use crate::domain::TransactionDomain;
use crate::errors::{Result, TxError};
use crate::journal::{Journal, MemoryJournal};

/// Maat Prelude
pub mod prelude {
    pub use crate::association::*;
    pub use crate::config::*;
    pub use crate::coordinator::*;
    pub use crate::domain::*;
    pub use crate::enlistment::*;
    pub use crate::errors::*;
    pub use crate::heuristic::*;
    pub use crate::journal::*;
    pub use crate::resource::*;
    pub use crate::stats::*;
    pub use crate::transaction::*;
    pub use crate::xid::*;
    pub use crate::*;
}

/// Process-wide set of named transaction domains.
///
/// Every domain created through the registry shares the registry's thread
/// association table, so a thread has at most one current transaction
/// across all of them. The registry owns its domains; dropping it or
/// calling [`DomainRegistry::shutdown`] stops them.
pub struct DomainRegistry {
    domains: RwLock<HashMap<String, Arc<TransactionDomain>>>,
    associations: Arc<ThreadAssociations>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self {
            domains: RwLock::new(HashMap::new()),
            associations: Arc::new(ThreadAssociations::new()),
        }
    }

    pub fn associations(&self) -> &Arc<ThreadAssociations> {
        &self.associations
    }

    /// Creates a domain journaling to `journal`.
    pub fn create_domain(
        &self,
        config: DomainConfig,
        journal: Arc<dyn Journal>,
    ) -> Result<Arc<TransactionDomain>> {
        let mut domains = self.domains.write();
        if domains.contains_key(&config.name) {
            return Err(TxError::DomainExists(config.name));
        }
        let name = config.name.clone();
        let domain = TransactionDomain::new(config, journal, Arc::clone(&self.associations))?;
        domains.insert(name.clone(), Arc::clone(&domain));
        info!("Created transaction domain {}", name);
        Ok(domain)
    }

    /// Creates a domain with an in-memory journal.
    pub fn create_memory_domain(&self, config: DomainConfig) -> Result<Arc<TransactionDomain>> {
        self.create_domain(config, Arc::new(MemoryJournal::new()))
    }

    pub fn domain(&self, name: &str) -> Result<Arc<TransactionDomain>> {
        self.domains
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| TxError::UnknownDomain(name.to_string()))
    }

    /// Removes a domain from the registry and shuts it down.
    pub fn remove_domain(&self, name: &str) -> Result<Arc<TransactionDomain>> {
        let domain = self
            .domains
            .write()
            .remove(name)
            .ok_or_else(|| TxError::UnknownDomain(name.to_string()))?;
        domain.shutdown()?;
        Ok(domain)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.domains.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Shuts down and removes every domain.
    pub fn shutdown(&self) {
        let domains: Vec<Arc<TransactionDomain>> =
            self.domains.write().drain().map(|(_, domain)| domain).collect();
        for domain in domains {
            if let Err(err) = domain.shutdown() {
                warn!("Failed to shut down domain {}: {}", domain.name(), err);
            }
        }
    }
}

impl Default for DomainRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DomainRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
