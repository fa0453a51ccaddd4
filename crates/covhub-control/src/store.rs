//! Legacy service store
//!
//! Maps a service name to the addresses registered under it. The file backed
//! store keeps an append-only log of `name&address` lines next to the
//! in-memory map so registrations survive a restart.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use tracing::{debug, info, warn};

use crate::error::StoreError;

const FIELD_SEPARATOR: char = '&';

/// Storage of registered services
pub trait ServiceStore: Send + Sync {
    /// Register `address` under `name`; `Ok(false)` if the pair already exists
    fn add(&self, name: &str, address: &str) -> Result<bool, StoreError>;

    /// Addresses registered under `name`
    fn get(&self, name: &str) -> Vec<String>;

    /// Every service with its addresses
    fn get_all(&self) -> BTreeMap<String, Vec<String>>;

    /// Forget every registration
    fn init(&self) -> Result<(), StoreError>;

    /// Replace the whole content
    fn set(&self, services: BTreeMap<String, Vec<String>>) -> Result<(), StoreError>;

    /// Drop `address` from every service; `Ok(false)` if it was not registered
    fn remove(&self, address: &str) -> Result<bool, StoreError>;
}

/// In-memory service store
#[derive(Debug, Default)]
pub struct MemoryStore {
    services: RwLock<BTreeMap<String, Vec<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, name: &str, address: &str) -> bool {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        let addresses = services.entry(name.to_string()).or_default();
        if addresses.iter().any(|a| a == address) {
            return false;
        }
        addresses.push(address.to_string());
        true
    }

    fn clear(&self) {
        self.services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn replace(&self, services: BTreeMap<String, Vec<String>>) {
        *self.services.write().unwrap_or_else(|e| e.into_inner()) = services;
    }

    fn drop_address(&self, address: &str) -> bool {
        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = false;
        services.retain(|_, addresses| {
            let before = addresses.len();
            addresses.retain(|a| a != address);
            removed |= addresses.len() != before;
            !addresses.is_empty()
        });
        removed
    }
}

impl ServiceStore for MemoryStore {
    fn add(&self, name: &str, address: &str) -> Result<bool, StoreError> {
        Ok(self.insert(name, address))
    }

    fn get(&self, name: &str) -> Vec<String> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    fn get_all(&self) -> BTreeMap<String, Vec<String>> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn init(&self) -> Result<(), StoreError> {
        self.clear();
        Ok(())
    }

    fn set(&self, services: BTreeMap<String, Vec<String>>) -> Result<(), StoreError> {
        self.replace(services);
        Ok(())
    }

    fn remove(&self, address: &str) -> Result<bool, StoreError> {
        Ok(self.drop_address(address))
    }
}

/// Service store persisted to an append-only log
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    memory: MemoryStore,
    /// Serializes writers of the log file
    log: Mutex<()>,
}

impl FileStore {
    /// Open the store at `path`, replaying an existing log
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }

        let memory = MemoryStore::new();
        match File::open(&path) {
            Ok(file) => {
                let mut replayed = 0usize;
                for (idx, line) in BufReader::new(file).lines().enumerate() {
                    let line = line.map_err(|e| io_error(&path, e))?;
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match parse_line(line) {
                        Some((name, address)) => {
                            memory.insert(name, address);
                            replayed += 1;
                        }
                        None => warn!(
                            path = %path.display(),
                            line = idx + 1,
                            content = %line,
                            "Skipping malformed store entry"
                        ),
                    }
                }
                info!(path = %path.display(), entries = replayed, "Loaded service store");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Starting with an empty service store");
            }
            Err(e) => return Err(io_error(&path, e)),
        }

        Ok(Self {
            path,
            memory,
            log: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, name: &str, address: &str) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| io_error(&self.path, e))?;
        writeln!(file, "{}{}{}", name, FIELD_SEPARATOR, address)
            .and_then(|_| file.flush())
            .map_err(|e| io_error(&self.path, e))
    }

    fn rewrite(&self) -> Result<(), StoreError> {
        let file = File::create(&self.path).map_err(|e| io_error(&self.path, e))?;
        let mut writer = BufWriter::new(file);
        for (name, addresses) in self.memory.get_all() {
            for address in addresses {
                writeln!(writer, "{}{}{}", name, FIELD_SEPARATOR, address)
                    .map_err(|e| io_error(&self.path, e))?;
            }
        }
        writer.flush().map_err(|e| io_error(&self.path, e))
    }

    fn lock_log(&self) -> std::sync::MutexGuard<'_, ()> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ServiceStore for FileStore {
    fn add(&self, name: &str, address: &str) -> Result<bool, StoreError> {
        let _log = self.lock_log();
        if self.memory.get(name).iter().any(|a| a == address) {
            return Ok(false);
        }
        // Memory only learns pairs that reached the log.
        self.append(name, address)?;
        Ok(self.memory.insert(name, address))
    }

    fn get(&self, name: &str) -> Vec<String> {
        self.memory.get(name)
    }

    fn get_all(&self) -> BTreeMap<String, Vec<String>> {
        self.memory.get_all()
    }

    fn init(&self) -> Result<(), StoreError> {
        let _log = self.lock_log();
        self.memory.clear();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&self.path, e)),
        }
    }

    fn set(&self, services: BTreeMap<String, Vec<String>>) -> Result<(), StoreError> {
        let _log = self.lock_log();
        self.memory.replace(services);
        self.rewrite()
    }

    fn remove(&self, address: &str) -> Result<bool, StoreError> {
        let _log = self.lock_log();
        if !self.memory.drop_address(address) {
            return Ok(false);
        }
        self.rewrite()?;
        Ok(true)
    }
}

/// Split a `name&address` log line
fn parse_line(line: &str) -> Option<(&str, &str)> {
    let mut fields = line.split(FIELD_SEPARATOR);
    match (fields.next(), fields.next(), fields.next()) {
        (Some(name), Some(address), None) if !name.is_empty() && !address.is_empty() => {
            Some((name, address))
        }
        _ => None,
    }
}

fn io_error(path: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}
