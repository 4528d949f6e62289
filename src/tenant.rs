use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::config::TenantConfig;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;

/// Manages per-tenant engines. Each tenant gets its own Engine + WAL + compactor.
/// Tenant = the `tenant` field of each request.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    defaults: TenantConfig,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, defaults: TenantConfig) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            defaults,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        let file_name = wal_file_name(tenant)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Two first requests for one tenant must not open the WAL twice.
        let entry = self.engines.entry(tenant.to_string());
        if let Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(file_name);
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(wal_path, notify, self.defaults.clone())?);

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        entry.insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        info!("opened tenant {tenant}");
        Ok(engine)
    }
}

/// WAL file for a tenant. Names are restricted to `[a-z0-9_-]` so that each
/// tenant maps to its own file, case-insensitive filesystems included.
fn wal_file_name(tenant: &str) -> std::io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "tenant name too long",
        ));
    }
    if tenant.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty tenant name",
        ));
    }
    let valid = tenant
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-');
    if !valid {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid tenant name {tenant:?}: use lowercase letters, digits, '_' and '-'"),
        ));
    }
    Ok(format!("{tenant}.wal"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{AccessContext, BookingRequest};
    use crate::model::*;
    use chrono::{NaiveDate, Weekday};
    use std::fs;
    use ulid::Ulid;

    /// 2030-01-07T00:00:00Z, a Monday.
    const MON: Ms = 1_893_974_400_000;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotwise_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, TenantConfig::default())
    }

    async fn seed(engine: &Engine, resource: Ulid, service: Ulid, customer: Ulid) {
        engine
            .create_branch(Branch { id: Ulid::new(), name: "Main".into(), primary: true })
            .await
            .unwrap();
        engine
            .create_resource(ResourceInfo { id: resource, branch_id: None, name: None, active: true })
            .await
            .unwrap();
        engine
            .set_working_hours(resource, WeeklySchedule::new().with_day(Weekday::Mon, 9 * 60, 17 * 60))
            .await
            .unwrap();
        engine
            .create_service(Service {
                id: service,
                name: "Cut".into(),
                duration_minutes: 60,
                price_cents: 0,
                deposit_percent: 0,
            })
            .await
            .unwrap();
        engine
            .create_customer(Customer {
                id: customer,
                name: "Ana".into(),
                phone: "+1 555 0100".into(),
                deposit_exempt: false,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = manager(dir);

        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();

        // Same ids in both tenants
        let (rid, sid, cid) = (Ulid::new(), Ulid::new(), Ulid::new());
        seed(&eng_a, rid, sid, cid).await;
        seed(&eng_b, rid, sid, cid).await;

        let ctx = AccessContext::system("tenant_a");
        let req = BookingRequest {
            resource_id: rid,
            service_id: sid,
            customer_id: cid,
            start: MON + 10 * 3_600_000,
            end: None,
            branch_id: None,
        };
        eng_a.book_single(&ctx, req.clone()).await.unwrap();

        // Tenant B's calendar is untouched
        let date = NaiveDate::from_ymd_opt(2030, 1, 7).unwrap();
        let free_b = eng_b.compute_availability(rid, date, None).await.unwrap();
        assert_eq!(free_b, vec![Span::new(MON + 9 * 3_600_000, MON + 17 * 3_600_000)]);
        let free_a = eng_a.compute_availability(rid, date, None).await.unwrap();
        assert_eq!(free_a.len(), 2);

        eng_b.book_single(&AccessContext::system("tenant_b"), req).await.unwrap();
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        // No WAL files should exist yet
        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = manager(dir);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_defaults_seed_config() {
        let dir = test_data_dir("defaults");
        let defaults = TenantConfig { buffer_minutes: 10, ..TenantConfig::default() };
        let tm = TenantManager::new(dir, 1000, defaults);

        let engine = tm.get_or_create("salon").unwrap();
        assert_eq!(engine.config().buffer_minutes, 10);
    }

    #[tokio::test]
    async fn tenant_names_that_alias_a_file_rejected() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        for name in ["../evil", "acme.salon", "acme/salon", "Acme", "", "caf\u{e9}"] {
            let err = tm.get_or_create(name).err().unwrap();
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput, "{name:?}");
        }
        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        tm.get_or_create("acme-salon").unwrap();
        tm.get_or_create("acme_salon").unwrap();
        assert!(dir.join("acme-salon.wal").exists());
        assert!(dir.join("acme_salon.wal").exists());
    }

    #[tokio::test]
    async fn similar_tenant_names_keep_separate_logs() {
        let dir = test_data_dir("similar_names");
        {
            let tm = manager(dir.clone());
            let engine = tm.get_or_create("acme-salon").unwrap();
            engine
                .create_customer(Customer {
                    id: Ulid::new(),
                    name: "Ana".into(),
                    phone: "+111".into(),
                    deposit_exempt: false,
                })
                .await
                .unwrap();
            assert!(engine.customer_by_phone("+111").is_some());
        }

        // A fresh manager replays from disk.
        let tm = manager(dir);
        let other = tm.get_or_create("acmesalon").unwrap();
        assert_eq!(other.customer_by_phone("+111"), None);
        let same = tm.get_or_create("acme-salon").unwrap();
        assert!(same.customer_by_phone("+111").is_some());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = manager(dir);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = manager(dir);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
