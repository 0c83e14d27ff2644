use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use switchboard_core::{CoordinatorError, ParticipantId, TenantId};
use switchboard_store::{StoreError, TenantStore};
use tracing::info;

#[derive(Clone, Debug)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub participants: HashSet<ParticipantId>,
}

/// In-memory tenant directory, seeded from and persisted to a `TenantStore`.
pub struct TenantManager {
    store: Arc<dyn TenantStore>,
    tenants: Mutex<HashMap<TenantId, Tenant>>,
}

impl TenantManager {
    pub fn new(store: Arc<dyn TenantStore>) -> Self {
        Self {
            store,
            tenants: Mutex::new(HashMap::new()),
        }
    }

    /// Load every stored tenant into the directory.
    pub fn load_from_store(&self) -> Result<usize, StoreError> {
        let rows = self.store.load_all()?;
        let mut tenants = self.tenants.lock();
        for row in rows {
            tenants.insert(
                row.id.clone(),
                Tenant {
                    id: row.id,
                    name: row.name,
                    participants: HashSet::new(),
                },
            );
        }
        info!(count = tenants.len(), "tenants loaded");
        Ok(tenants.len())
    }

    /// Create (and persist) the tenant if it is not known yet.
    pub fn ensure_tenant(&self, id: &TenantId, name: &str) -> Result<(), StoreError> {
        if self.tenants.lock().contains_key(id) {
            return Ok(());
        }
        self.store.save(id, name)?;
        self.tenants.lock().entry(id.clone()).or_insert_with(|| Tenant {
            id: id.clone(),
            name: name.to_string(),
            participants: HashSet::new(),
        });
        info!(tenant_id = %id, name, "tenant created");
        Ok(())
    }

    pub fn contains(&self, id: &TenantId) -> bool {
        self.tenants.lock().contains_key(id)
    }

    pub fn get(&self, id: &TenantId) -> Option<Tenant> {
        self.tenants.lock().get(id).cloned()
    }

    pub fn add_participant(&self, id: &TenantId, participant_id: ParticipantId) -> Result<(), CoordinatorError> {
        let mut tenants = self.tenants.lock();
        let tenant = tenants
            .get_mut(id)
            .ok_or_else(|| CoordinatorError::TenantNotFound(id.to_string()))?;
        tenant.participants.insert(participant_id);
        Ok(())
    }

    pub fn remove_participant(&self, id: &TenantId, participant_id: &ParticipantId) {
        if let Some(tenant) = self.tenants.lock().get_mut(id) {
            tenant.participants.remove(participant_id);
        }
    }

    pub fn participant_count(&self, id: &TenantId) -> usize {
        self.tenants
            .lock()
            .get(id)
            .map_or(0, |t| t.participants.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_store::{Database, TenantRepo};

    fn manager() -> (Arc<TenantRepo>, TenantManager) {
        let repo = Arc::new(TenantRepo::new(Database::in_memory().unwrap()));
        let manager = TenantManager::new(repo.clone());
        (repo, manager)
    }

    #[test]
    fn load_from_store_seeds_directory() {
        let (repo, manager) = manager();
        repo.save(&TenantId::from_raw("acme"), "Acme").unwrap();
        assert_eq!(manager.load_from_store().unwrap(), 1);
        assert_eq!(manager.get(&TenantId::from_raw("acme")).unwrap().name, "Acme");
    }

    #[test]
    fn ensure_tenant_persists_once() {
        let (repo, manager) = manager();
        let id = TenantId::from_raw("defaultTenant");
        manager.ensure_tenant(&id, "Default Tenant").unwrap();
        manager.ensure_tenant(&id, "Renamed").unwrap();

        assert!(manager.contains(&id));
        assert_eq!(repo.get(&id).unwrap().name, "Default Tenant");
    }

    #[test]
    fn membership_requires_known_tenant() {
        let (_repo, manager) = manager();
        let err = manager
            .add_participant(&TenantId::from_raw("nope"), ParticipantId::new())
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::TenantNotFound(_)));

        let id = TenantId::from_raw("t");
        manager.ensure_tenant(&id, "T").unwrap();
        let pid = ParticipantId::new();
        manager.add_participant(&id, pid.clone()).unwrap();
        assert_eq!(manager.participant_count(&id), 1);
        manager.remove_participant(&id, &pid);
        assert_eq!(manager.participant_count(&id), 0);
    }
}
