use chrono::Utc;
use tracing::instrument;

use switchboard_core::ids::TenantId;

use crate::database::Database;
use crate::error::StoreError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantRow {
    pub id: TenantId,
    pub name: String,
}

/// Persistent tenant storage as the coordinator sees it.
pub trait TenantStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<TenantRow>, StoreError>;
    /// Insert or overwrite the tenant's name.
    fn save(&self, id: &TenantId, name: &str) -> Result<(), StoreError>;
}

pub struct TenantRepo {
    db: Database,
}

impl TenantRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(tenant_id = %id))]
    pub fn get(&self, id: &TenantId) -> Result<TenantRow, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, name FROM tenants WHERE id = ?1",
                [id.as_str()],
                |row| {
                    Ok(TenantRow {
                        id: TenantId::from_raw(row.get::<_, String>(0)?),
                        name: row.get(1)?,
                    })
                },
            )
            .map_err(|_| StoreError::NotFound(format!("tenant {id}")))
        })
    }
}

impl TenantStore for TenantRepo {
    #[instrument(skip(self))]
    fn load_all(&self) -> Result<Vec<TenantRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, name FROM tenants ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(TenantRow {
                        id: TenantId::from_raw(row.get::<_, String>(0)?),
                        name: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    #[instrument(skip(self), fields(tenant_id = %id))]
    fn save(&self, id: &TenantId, name: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tenants (id, name, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name",
                rusqlite::params![id.as_str(), name, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> TenantRepo {
        TenantRepo::new(Database::in_memory().unwrap())
    }

    #[test]
    fn empty_store_loads_nothing() {
        assert!(repo().load_all().unwrap().is_empty());
    }

    #[test]
    fn save_then_load_all() {
        let repo = repo();
        repo.save(&TenantId::from_raw("b"), "Beta").unwrap();
        repo.save(&TenantId::from_raw("a"), "Alpha").unwrap();

        let all = repo.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id.as_str(), "a");
        assert_eq!(all[1].name, "Beta");
    }

    #[test]
    fn save_overwrites_name() {
        let repo = repo();
        let id = TenantId::from_raw("defaultTenant");
        repo.save(&id, "Old").unwrap();
        repo.save(&id, "Default Tenant").unwrap();

        assert_eq!(repo.load_all().unwrap().len(), 1);
        assert_eq!(repo.get(&id).unwrap().name, "Default Tenant");
    }

    #[test]
    fn get_missing_is_not_found() {
        let err = repo().get(&TenantId::from_raw("nope")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn usable_as_trait_object() {
        let store: Box<dyn TenantStore> = Box::new(repo());
        store.save(&TenantId::from_raw("t"), "T").unwrap();
        assert_eq!(store.load_all().unwrap()[0].name, "T");
    }
}
