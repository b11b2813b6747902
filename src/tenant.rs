use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::engine::{Engine, EngineError, EngineSettings};
use crate::limits::*;
use crate::model::Ms;
use crate::notify::NotifyHub;
use crate::reaper;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// How every studio engine is set up.
#[derive(Debug, Clone)]
pub struct TenantConfig {
    pub data_dir: PathBuf,
    pub compact_threshold: u64,
    pub settings: EngineSettings,
    /// In-process expiry ticker; `None` leaves sweeping to the external scheduler.
    pub sweep_every: Option<Duration>,
}

/// Manages per-studio engines. Each studio gets its own Engine + WAL + background tasks.
/// Studio = the `x-studio` request header.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    config: TenantConfig,
}

/// Reduce a studio name to the characters allowed in a journal file name.
fn sanitize(tenant: &str) -> io::Result<String> {
    if tenant.len() > MAX_TENANT_NAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "studio name too long",
        ));
    }
    let safe_name: String = tenant
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe_name.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty studio name",
        ));
    }
    Ok(safe_name)
}

impl TenantManager {
    pub fn new(config: TenantConfig) -> Self {
        Self {
            engines: DashMap::new(),
            config,
        }
    }

    /// Get or lazily create an engine for the given studio.
    pub fn get_or_create(&self, tenant: &str) -> io::Result<Arc<Engine>> {
        let safe_name = sanitize(tenant)?;
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(io::Error::other("too many studios"));
        }

        // The entry lock makes concurrent first requests share one engine.
        let entry = self.engines.entry(safe_name.clone());
        let engine = match entry {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                std::fs::create_dir_all(&self.config.data_dir)?;
                let wal_path = self.config.data_dir.join(format!("{safe_name}.wal"));
                let notify = Arc::new(NotifyHub::new());
                let engine = Arc::new(Engine::new(wal_path, notify, self.config.settings)?);
                slot.insert(engine.clone());
                engine
            }
        };

        let compactor_engine = engine.clone();
        let threshold = self.config.compact_threshold;
        tokio::spawn(async move {
            reaper::run_compactor(compactor_engine, threshold, COMPACT_CHECK_INTERVAL).await;
        });
        if let Some(every) = self.config.sweep_every {
            let sweeper_engine = engine.clone();
            tokio::spawn(async move {
                reaper::run_sweeper(sweeper_engine, every).await;
            });
        }

        tracing::info!(studio = %safe_name, "studio engine loaded");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    /// Open every studio that already has a journal in the data directory.
    pub fn load_existing(&self) -> io::Result<usize> {
        std::fs::create_dir_all(&self.config.data_dir)?;
        let mut loaded = 0;
        for entry in std::fs::read_dir(&self.config.data_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("wal") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.get_or_create(stem) {
                Ok(_) => loaded += 1,
                Err(e) => tracing::warn!(path = %path.display(), "skipping journal: {e}"),
            }
        }
        Ok(loaded)
    }

    /// Loaded studios, sorted by name.
    pub fn studios(&self) -> Vec<String> {
        let mut names: Vec<String> = self.engines.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Expire stale pending requests in every loaded studio. Keeps going past a
    /// failing studio and reports the first error alongside the total.
    pub async fn sweep_all(&self, now: Ms) -> (usize, Option<EngineError>) {
        let engines: Vec<(String, Arc<Engine>)> = self
            .engines
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut total = 0;
        let mut first_error = None;
        for (studio, engine) in engines {
            match engine.expire_stale_bookings(now).await {
                Ok(n) => total += n,
                Err(e) => {
                    tracing::error!(%studio, "sweep failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        (total, first_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NewWindow;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("lessond_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(TenantConfig {
            data_dir: dir,
            compact_threshold: 1000,
            settings: EngineSettings::default(),
            sweep_every: None,
        })
    }

    fn monday(instructor_id: Ulid) -> NewWindow {
        NewWindow {
            instructor_id,
            day_of_week: 1,
            start: CivilTime::hm(9, 0),
            end: CivilTime::hm(11, 0),
            slot_minutes: 30,
            is_active: true,
            effective_from: None,
            effective_until: None,
        }
    }

    #[tokio::test]
    async fn studio_isolation() {
        let tm = manager(test_data_dir("isolation"));
        let eng_a = tm.get_or_create("studio_a").unwrap();
        let eng_b = tm.get_or_create("studio_b").unwrap();

        let tutor = Caller::new(Ulid::new(), Role::Instructor);
        eng_a.add_window(&tutor, monday(tutor.id)).await.unwrap();

        assert_eq!(eng_a.list_windows(&tutor.id).await.len(), 1);
        assert!(eng_b.list_windows(&tutor.id).await.is_empty());
    }

    #[tokio::test]
    async fn studio_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("salsa_club").unwrap();
        assert!(dir.join("salsa_club.wal").exists());
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let tm = manager(test_data_dir("same_eng"));
        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn studio_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let evil = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        // Both spellings land on the same journal, so they must share an engine.
        let plain = tm.get_or_create("evil").unwrap();
        assert!(Arc::ptr_eq(&evil, &plain));

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn studio_name_too_long() {
        let tm = manager(test_data_dir("name_too_long"));
        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("studio name too long"));
    }

    #[tokio::test]
    async fn studio_count_limit() {
        let tm = manager(test_data_dir("count_limit"));
        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("s{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many studios"));
    }

    #[tokio::test]
    async fn existing_journals_are_loaded() {
        let dir = test_data_dir("load_existing");
        let tutor = Caller::new(Ulid::new(), Role::Instructor);
        {
            let tm = manager(dir.clone());
            let eng = tm.get_or_create("tango").unwrap();
            eng.add_window(&tutor, monday(tutor.id)).await.unwrap();
            tm.get_or_create("swing").unwrap();
        }
        fs::write(dir.join("notes.txt"), b"not a journal").unwrap();

        let tm = manager(dir);
        assert_eq!(tm.load_existing().unwrap(), 2);
        assert_eq!(tm.studios(), vec!["swing".to_string(), "tango".to_string()]);
        let tango = tm.get_or_create("tango").unwrap();
        assert_eq!(tango.list_windows(&tutor.id).await.len(), 1);
    }

    #[tokio::test]
    async fn sweep_all_with_nothing_stale() {
        let tm = manager(test_data_dir("sweep_all"));
        tm.get_or_create("a").unwrap();
        tm.get_or_create("b").unwrap();
        let (expired, error) = tm.sweep_all(crate::engine::now_ms()).await;
        assert_eq!(expired, 0);
        assert!(error.is_none());
    }
}
