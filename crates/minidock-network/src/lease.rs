//! IP lease allocation for the container subnet.
//!
//! Leases live in `network/leases.json`, an ip → container-id map. Every
//! mutation happens under an exclusive `flock` on `network/.lock` so two
//! concurrent launches never hand out the same address.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::PathBuf;

use minidock_common::{MinidockError, MinidockResult};
use rustix::fs::{flock, FlockOperation};

/// First and last host octets handed out on the /24.
const FIRST_HOST: u8 = 2;
const LAST_HOST: u8 = 254;

/// The flock-guarded lease map.
pub struct LeaseStore {
    leases_path: PathBuf,
    lock_path: PathBuf,
}

impl LeaseStore {
    /// Open a lease store under the given network directory files.
    #[must_use]
    pub fn new(leases_path: PathBuf, lock_path: PathBuf) -> Self {
        Self {
            leases_path,
            lock_path,
        }
    }

    /// Allocate the first free address for `container_id`.
    pub fn allocate(&self, container_id: &str) -> MinidockResult<String> {
        self.with_locked(|leases| {
            for host in FIRST_HOST..=LAST_HOST {
                let ip = format!("10.0.0.{host}");
                if !leases.contains_key(&ip) {
                    leases.insert(ip.clone(), container_id.to_string());
                    return Ok(ip);
                }
            }
            Err(MinidockError::BridgeUnavailable {
                message: "no free addresses in 10.0.0.0/24".to_string(),
            })
        })
    }

    /// Release every lease held by `container_id`.
    pub fn release(&self, container_id: &str) -> MinidockResult<()> {
        self.with_locked(|leases| {
            leases.retain(|_, owner| owner != container_id);
            Ok(())
        })
    }

    /// Number of active leases. Reads without mutating (still locked, the
    /// read must not observe a half-written map).
    pub fn active(&self) -> MinidockResult<usize> {
        self.with_locked(|leases| Ok(leases.len()))
    }

    /// The lease held by `container_id`, if any.
    pub fn lookup(&self, container_id: &str) -> MinidockResult<Option<String>> {
        self.with_locked(|leases| {
            Ok(leases
                .iter()
                .find(|(_, owner)| owner.as_str() == container_id)
                .map(|(ip, _)| ip.clone()))
        })
    }

    /// Run `f` with the lease map loaded under an exclusive lock, persisting
    /// the map afterwards when `f` succeeds.
    fn with_locked<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, String>) -> MinidockResult<T>,
    ) -> MinidockResult<T> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        flock(&lock_file, FlockOperation::LockExclusive)
            .map_err(|e| MinidockError::kernel("flock", &e.into()))?;

        let mut leases: BTreeMap<String, String> = if self.leases_path.exists() {
            let json = std::fs::read_to_string(&self.leases_path)?;
            serde_json::from_str(&json).unwrap_or_default()
        } else {
            BTreeMap::new()
        };

        let result = f(&mut leases);

        if result.is_ok() {
            let json = serde_json::to_string_pretty(&leases)?;
            let tmp = self.leases_path.with_extension("json.tmp");
            std::fs::write(&tmp, json)?;
            std::fs::rename(&tmp, &self.leases_path)?;
        }

        flock(&lock_file, FlockOperation::Unlock)
            .map_err(|e| MinidockError::kernel("flock", &e.into()))?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(temp: &tempfile::TempDir) -> LeaseStore {
        LeaseStore::new(
            temp.path().join("leases.json"),
            temp.path().join(".lock"),
        )
    }

    #[test]
    fn allocates_first_free() {
        let temp = tempfile::tempdir().unwrap();
        let store = store(&temp);
        assert_eq!(store.allocate("aaa111aaa111").unwrap(), "10.0.0.2");
        assert_eq!(store.allocate("bbb222bbb222").unwrap(), "10.0.0.3");
    }

    #[test]
    fn release_frees_address() {
        let temp = tempfile::tempdir().unwrap();
        let store = store(&temp);
        store.allocate("aaa111aaa111").unwrap();
        store.allocate("bbb222bbb222").unwrap();
        store.release("aaa111aaa111").unwrap();
        // The freed address is handed out again.
        assert_eq!(store.allocate("ccc333ccc333").unwrap(), "10.0.0.2");
        assert_eq!(store.active().unwrap(), 2);
    }

    #[test]
    fn lookup_by_owner() {
        let temp = tempfile::tempdir().unwrap();
        let store = store(&temp);
        let ip = store.allocate("aaa111aaa111").unwrap();
        assert_eq!(store.lookup("aaa111aaa111").unwrap(), Some(ip));
        assert_eq!(store.lookup("bbb222bbb222").unwrap(), None);
    }

    #[test]
    fn concurrent_allocations_never_collide() {
        let temp = tempfile::tempdir().unwrap();
        let leases = temp.path().join("leases.json");
        let lock = temp.path().join(".lock");

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let leases = leases.clone();
                let lock = lock.clone();
                std::thread::spawn(move || {
                    let store = LeaseStore::new(leases, lock);
                    store.allocate(&format!("{i:012}")).unwrap()
                })
            })
            .collect();

        let mut ips: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ips.sort();
        ips.dedup();
        assert_eq!(ips.len(), 8);
    }
}
