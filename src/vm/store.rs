//! VM and volume tables, persisted as JSON objects keyed by id.
//!
//! The files on disk are the source of truth: a long-running service and
//! one-shot CLI invocations share them. Every access reloads both tables
//! under an advisory `flock` on `registry.lock` next to them, shared for
//! reads and exclusive for load-modify-persist cycles. Mutations run
//! against a copy, and a failed closure or a failed write leaves the files
//! unchanged.

use crate::config::schema::{VmRecord, Volume};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = "registry.lock";

#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub vms: BTreeMap<String, VmRecord>,
    pub volumes: BTreeMap<String, Volume>,
}

impl Tables {
    pub fn vm(&self, id: &str) -> Result<&VmRecord> {
        self.vms.get(id).ok_or_else(|| Error::vm_not_found(id))
    }

    pub fn vm_mut(&mut self, id: &str) -> Result<&mut VmRecord> {
        self.vms.get_mut(id).ok_or_else(|| Error::vm_not_found(id))
    }

    pub fn volume(&self, id: &str) -> Result<&Volume> {
        self.volumes.get(id).ok_or_else(|| Error::volume_not_found(id))
    }

    pub fn volume_mut(&mut self, id: &str) -> Result<&mut Volume> {
        self.volumes
            .get_mut(id)
            .ok_or_else(|| Error::volume_not_found(id))
    }
}

pub struct Store {
    vms_path: PathBuf,
    volumes_path: PathBuf,
    lock_path: PathBuf,
    /// Tables as last loaded; serves reads when a reload fails.
    tables: Mutex<Tables>,
}

impl Store {
    /// Load both tables; missing files start empty.
    pub fn open(vms_path: PathBuf, volumes_path: PathBuf) -> Result<Self> {
        let lock_path = vms_path.with_file_name(LOCK_FILE);
        let store = Self {
            vms_path,
            volumes_path,
            lock_path,
            tables: Mutex::new(Tables::default()),
        };
        let tables = {
            let _flock = FileLock::acquire(&store.lock_path, libc::LOCK_SH)?;
            store.load()?
        };
        tracing::debug!(
            vms = tables.vms.len(),
            volumes = tables.volumes.len(),
            "loaded registry"
        );
        *store.tables.lock() = tables;
        Ok(store)
    }

    fn load(&self) -> Result<Tables> {
        Ok(Tables {
            vms: load_table(&self.vms_path)?,
            volumes: load_table(&self.volumes_path)?,
        })
    }

    /// Read-only access to freshly loaded tables. The shared lock is held
    /// while `f` runs, so no other process commits a change in between.
    pub fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        let mut tables = self.tables.lock();
        let _flock = match FileLock::acquire(&self.lock_path, libc::LOCK_SH) {
            Ok(flock) => {
                match self.load() {
                    Ok(fresh) => *tables = fresh,
                    Err(e) => tracing::warn!(error = %e, "registry reload failed, using last loaded tables"),
                }
                Some(flock)
            }
            Err(e) => {
                tracing::warn!(error = %e, "registry lock unavailable, using last loaded tables");
                None
            }
        };
        f(&tables)
    }

    /// Load-modify-persist cycle under the exclusive lock. Not re-entrant:
    /// `f` must not call back into the store.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut Tables) -> Result<R>) -> Result<R> {
        let mut tables = self.tables.lock();
        let _flock = FileLock::acquire(&self.lock_path, libc::LOCK_EX)?;
        *tables = self.load()?;
        let mut next = tables.clone();
        let out = f(&mut next)?;
        write_table(&self.vms_path, &next.vms)?;
        write_table(&self.volumes_path, &next.volumes)?;
        *tables = next;
        Ok(out)
    }
}

/// Advisory lock on a file, released when dropped.
struct FileLock {
    _file: File,
}

impl FileLock {
    fn acquire(path: &Path, op: libc::c_int) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::io_at(path, e))?;
        loop {
            if unsafe { libc::flock(file.as_raw_fd(), op) } == 0 {
                return Ok(Self { _file: file });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(Error::io_at(path, err));
            }
        }
    }
}

fn load_table<T: DeserializeOwned>(path: &Path) -> Result<BTreeMap<String, T>> {
    match fs::read(path) {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(BTreeMap::new()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(Error::io_at(path, e)),
    }
}

fn write_table<T: Serialize>(path: &Path, table: &BTreeMap<String, T>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(table)?;
    fs::write(&tmp, data).map_err(|e| Error::io_at(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| Error::io_at(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::DiskFormat;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn volume(id: &str) -> Volume {
        Volume {
            id: id.into(),
            name: format!("vol-{id}"),
            size: 1,
            format: DiskFormat::Qcow2,
            path: PathBuf::from(format!("/vols/{id}.qcow2")),
            attached_to: None,
            created_at: "2024-01-01T00:00:00Z".into(),
        }
    }

    fn open(tmp: &TempDir) -> Store {
        Store::open(
            tmp.path().join("vms.json"),
            tmp.path().join("volumes.json"),
        )
        .unwrap()
    }

    #[test]
    fn test_mutate_persists_and_reloads() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        store
            .mutate(|t| {
                t.volumes.insert("a".into(), volume("a"));
                Ok(())
            })
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(tmp.path().join("volumes.json")).unwrap()).unwrap();
        assert_eq!(raw["a"]["name"], "vol-a");

        let reopened = open(&tmp);
        assert_eq!(reopened.read(|t| t.volumes.len()), 1);
        assert!(reopened.read(|t| t.vms.is_empty()));
    }

    #[test]
    fn test_failed_mutation_leaves_tables_untouched() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp);
        let err = store
            .mutate(|t| {
                t.volumes.insert("a".into(), volume("a"));
                t.vm("missing").map(|_| ())
            })
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "vm", .. }));
        assert_eq!(store.read(|t| t.volumes.len()), 0);
        assert!(!tmp.path().join("volumes.json").exists());
    }

    #[test]
    fn test_stores_on_one_root_see_each_other() {
        let tmp = TempDir::new().unwrap();
        let service = open(&tmp);
        let cli = open(&tmp);

        cli.mutate(|t| {
            t.volumes.insert("a".into(), volume("a"));
            Ok(())
        })
        .unwrap();
        assert!(service.read(|t| t.volume("a").is_ok()));

        service
            .mutate(|t| {
                t.volumes.insert("b".into(), volume("b"));
                Ok(())
            })
            .unwrap();
        let reopened = open(&tmp);
        let ids: Vec<String> = reopened.read(|t| t.volumes.keys().cloned().collect());
        assert_eq!(ids, ["a", "b"]);
        assert!(tmp.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn test_concurrent_mutations_from_two_stores_all_land() {
        let tmp = TempDir::new().unwrap();
        let stores = [Arc::new(open(&tmp)), Arc::new(open(&tmp))];
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = Arc::clone(&stores[i % 2]);
                std::thread::spawn(move || {
                    store
                        .mutate(|t| {
                            let id = format!("v{i}");
                            t.volumes.insert(id.clone(), volume(&id));
                            Ok(())
                        })
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(open(&tmp).read(|t| t.volumes.len()), 8);
    }

    #[test]
    fn test_corrupt_table_is_an_error() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("vms.json"), "{not json").unwrap();
        assert!(Store::open(
            tmp.path().join("vms.json"),
            tmp.path().join("volumes.json")
        )
        .is_err());
    }
}
