use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::{self, GuestNotifier, LogNotifier, NotifyHub};

/// Per-tenant engines. A tenant is the database name of the pgwire connection
/// and owns one engine, one WAL file, a compactor and a notification dispatcher.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    notifier: Arc<dyn GuestNotifier>,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self::with_notifier(data_dir, compact_threshold, Arc::new(LogNotifier))
    }

    pub fn with_notifier(
        data_dir: PathBuf,
        compact_threshold: u64,
        notifier: Arc<dyn GuestNotifier>,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            notifier,
        }
    }

    /// Get or lazily open the engine for `tenant`.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        check_tenant_name(tenant)?;
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        let wal_path = self.data_dir.join(format!("{}.wal", wal_file_stem(tenant)));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::new(wal_path, notify.clone())?);

        // Two first connections may race to here; the map keeps one engine and
        // the other is dropped before it starts any background work.
        let winner = self
            .engines
            .entry(tenant.to_string())
            .or_insert(engine.clone())
            .value()
            .clone();
        if !Arc::ptr_eq(&winner, &engine) {
            return Ok(winner);
        }

        tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));
        tokio::spawn(notify::run_dispatcher(notify.subscribe(), self.notifier.clone()));

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!(tenant, "tenant opened");
        Ok(engine)
    }
}

/// Tenant for connections that name no database.
pub const DEFAULT_TENANT: &str = "default";

/// Names a tenant may never take, whatever the tenant count.
pub fn check_tenant_name(tenant: &str) -> std::io::Result<()> {
    if tenant.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "empty tenant name",
        ));
    }
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "tenant name too long",
        ));
    }
    Ok(())
}

/// File name for a tenant's WAL. ASCII letters, digits, `_` and `-` are kept;
/// every other byte becomes `%XX`, so distinct tenants never share a file and
/// the name cannot leave `data_dir`.
fn wal_file_stem(tenant: &str) -> String {
    let mut stem = String::with_capacity(tenant.len());
    for b in tenant.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
            stem.push(char::from(b));
        } else {
            stem.push_str(&format!("%{b:02X}"));
        }
    }
    stem
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use std::fs;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotkeeper_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = TenantManager::new(dir, 1000);

        let eng_a = tm.get_or_create("tenant_a").unwrap();
        let eng_b = tm.get_or_create("tenant_b").unwrap();

        for engine in [&eng_a, &eng_b] {
            engine
                .register_resource("R1".into(), None, 10_000, None)
                .await
                .unwrap();
        }
        eng_a
            .set_schedule("R1".into(), 6, "08:00".parse().unwrap(), "12:00".parse().unwrap())
            .await
            .unwrap();

        assert_eq!(eng_a.get_availability("R1", "2024-06-01").await.unwrap().len(), 4);
        assert!(eng_b.get_availability("R1", "2024-06-01").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), 1000);

        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = TenantManager::new(dir, 1000);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_escaped() {
        let dir = test_data_dir("escape");
        let tm = TenantManager::new(dir.clone(), 1000);

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("%2E%2E%2Fevil.wal").exists());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);
        assert!(tm.get_or_create("").is_err());
    }

    #[test]
    fn wal_file_stems_are_distinct() {
        let names = ["club.a", "cluba", "a b", "ab", "a%20b", "a%2Eb", "a.b", "ü", "%C3%BC"];
        let stems: std::collections::HashSet<_> = names.iter().map(|n| wal_file_stem(n)).collect();
        assert_eq!(stems.len(), names.len());
        assert_eq!(wal_file_stem("my_db-2"), "my_db-2");
    }

    #[tokio::test]
    async fn similar_names_keep_separate_journals() {
        let dir = test_data_dir("similar_names");
        {
            let tm = TenantManager::new(dir.clone(), 1000);
            let dotted = tm.get_or_create("club.a").unwrap();
            tm.get_or_create("cluba").unwrap();
            dotted
                .register_resource("R1".into(), None, 10_000, None)
                .await
                .unwrap();
        }

        let tm = TenantManager::new(dir.clone(), 1000);
        let plain = tm.get_or_create("cluba").unwrap();
        assert!(plain.directory().resource("R1").is_none());
        let dotted = tm.get_or_create("club.a").unwrap();
        assert!(dotted.directory().resource("R1").is_some());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_first_connections_share_one_engine() {
        let dir = test_data_dir("race");
        let tm = Arc::new(TenantManager::new(dir, 1000));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let tm = tm.clone();
                tokio::spawn(async move { tm.get_or_create("club").unwrap() })
            })
            .collect();
        let mut engines = Vec::new();
        for task in tasks {
            engines.push(task.await.unwrap());
        }
        assert!(engines.iter().all(|e| Arc::ptr_eq(e, &engines[0])));
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = TenantManager::new(dir, 1000);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let dir = test_data_dir("count_limit");
        let tm = TenantManager::new(dir, 1000);

        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }

    #[tokio::test]
    async fn reopened_tenant_keeps_reservations() {
        let dir = test_data_dir("reopen");
        let id = {
            let tm = TenantManager::new(dir.clone(), 1000);
            let engine = tm.get_or_create("club").unwrap();
            engine
                .register_resource("R1".into(), None, 10_000, None)
                .await
                .unwrap();
            engine
                .set_schedule("R1".into(), 6, "08:00".parse().unwrap(), "12:00".parse().unwrap())
                .await
                .unwrap();
            let r = engine
                .create_reservation(crate::engine::BookingRequest {
                    resource_id: "R1".into(),
                    date: "2024-06-01".into(),
                    start: "09:00".parse().unwrap(),
                    guest: crate::engine::GuestDetails {
                        first_name: "Awa".into(),
                        last_name: "Diop".into(),
                        phone: None,
                        email: Some("awa@example.com".into()),
                    },
                    expected_price: None,
                })
                .await
                .unwrap();
            r.id
        };

        let tm = TenantManager::new(dir, 1000);
        let engine = tm.get_or_create("club").unwrap();
        let r = engine.get_reservation(id).await.unwrap();
        assert_eq!(r.status, ReservationStatus::Pending);
        assert_eq!(r.guest.contact, Contact::Email("awa@example.com".into()));
    }
}
