//! Durable lease storage.
//!
//! [`JsonLeaseFile`] keeps an append-only JSON Lines journal: one record per
//! IA snapshot or server DUID. The latest record for a key wins on replay,
//! after which the journal is rewritten with one record per live IA.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::parse_hex;
use crate::store::{BindingStore, IaKey, LeaseState, RestoredLease};
use crate::wire::IaKind;

// ── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRecord {
    pub address: Ipv6Addr,
    pub prefix_len: u8,
    pub state: LeaseState,
    pub preferred: u32,
    pub valid: u32,
    pub ends: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IaRecord {
    pub kind: IaKind,
    pub iaid: u32,
    /// Client DUID, hex.
    pub duid: String,
    pub cltt: u64,
    #[serde(default)]
    pub bindings: Vec<BindingRecord>,
}

impl IaRecord {
    /// Current state of `key`. An IA that no longer exists yields a record
    /// without bindings, which deletes it on replay.
    pub fn snapshot(store: &BindingStore, key: &IaKey, now: u64) -> Self {
        let (cltt, bindings) = match store.ia(key) {
            Some(ia) => (
                ia.cltt,
                store
                    .ia_leases(ia)
                    .filter(|l| l.committed)
                    .map(|l| BindingRecord {
                        address: l.address,
                        prefix_len: l.prefix_len,
                        state: l.state,
                        preferred: l.preferred,
                        valid: l.valid,
                        ends: l.hard_end,
                    })
                    .collect(),
            ),
            None => (now, Vec::new()),
        };
        Self {
            kind: key.kind,
            iaid: key.iaid,
            duid: hex::encode(&key.duid),
            cltt,
            bindings,
        }
    }

    pub fn key(&self) -> Result<IaKey> {
        let duid = parse_hex(&self.duid).with_context(|| format!("Invalid duid in lease record: {}", self.duid))?;
        Ok(IaKey::new(self.kind, self.iaid, &duid))
    }

    pub fn restored(&self) -> Vec<RestoredLease> {
        self.bindings
            .iter()
            .map(|b| RestoredLease {
                address: b.address,
                prefix_len: b.prefix_len,
                state: b.state,
                preferred: b.preferred,
                valid: b.valid,
                hard_end: b.ends,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "kebab-case")]
enum Record {
    ServerDuid { duid: String },
    Ia(IaRecord),
}

/// What a journal replay produced.
#[derive(Debug, Default)]
pub struct LoadedLeases {
    pub server_duid: Option<Vec<u8>>,
    pub ias: Vec<IaRecord>,
}

// ── Store trait ─────────────────────────────────────────────────────────────

pub trait LeaseStore: Send {
    fn write_ia(&mut self, record: &IaRecord) -> Result<()>;
    fn write_server_duid(&mut self, duid: &[u8]) -> Result<()>;
    /// Make pending writes durable. Without `flush` this may be deferred.
    fn commit(&mut self, flush: bool) -> Result<()>;
}

// ── JSON Lines journal ──────────────────────────────────────────────────────

pub struct JsonLeaseFile {
    path: PathBuf,
    writer: BufWriter<File>,
    commit_interval: u64,
    last_commit: i64,
    pending: usize,
}

impl JsonLeaseFile {
    /// Replay the journal at `path`, rewrite it compactly and open it for
    /// appending. A missing file starts an empty journal.
    pub fn open(path: &Path, commit_interval_secs: u64) -> Result<(Self, LoadedLeases)> {
        let loaded = if path.exists() {
            replay(path)?
        } else {
            info!("Lease file {} not found, starting empty", path.display());
            LoadedLeases::default()
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create lease directory {}", parent.display()))?;
            }
        }
        rewrite(path, &loaded)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open lease file {}", path.display()))?;

        info!(
            "Loaded {} IAs from lease file {}",
            loaded.ias.len(),
            path.display()
        );

        Ok((
            Self {
                path: path.to_path_buf(),
                writer: BufWriter::new(file),
                commit_interval: commit_interval_secs,
                last_commit: chrono::Utc::now().timestamp(),
                pending: 0,
            },
            loaded,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&mut self, record: &Record) -> Result<()> {
        let line = serde_json::to_string(record)?;
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.write_all(b"\n"))
            .with_context(|| format!("Failed to append to lease file {}", self.path.display()))?;
        self.pending += 1;
        Ok(())
    }
}

impl LeaseStore for JsonLeaseFile {
    fn write_ia(&mut self, record: &IaRecord) -> Result<()> {
        self.append(&Record::Ia(record.clone()))
    }

    fn write_server_duid(&mut self, duid: &[u8]) -> Result<()> {
        self.append(&Record::ServerDuid { duid: hex::encode(duid) })
    }

    fn commit(&mut self, flush: bool) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        if !flush && now - self.last_commit < self.commit_interval as i64 {
            return Ok(());
        }
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush lease file {}", self.path.display()))?;
        if flush {
            self.writer
                .get_ref()
                .sync_all()
                .with_context(|| format!("Failed to sync lease file {}", self.path.display()))?;
        }
        if self.pending > 0 {
            debug!("Committed {} lease records", self.pending);
        }
        self.pending = 0;
        self.last_commit = now;
        Ok(())
    }
}

fn replay(path: &Path) -> Result<LoadedLeases> {
    let file = File::open(path).with_context(|| format!("Failed to open lease file {}", path.display()))?;

    let mut server_duid = None;
    let mut order: Vec<(IaKind, u32, String)> = Vec::new();
    let mut latest: HashMap<(IaKind, u32, String), IaRecord> = HashMap::new();

    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read lease file {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!("Skipping unreadable lease record at {}:{}: {}", path.display(), n + 1, e);
                continue;
            }
        };
        match record {
            Record::ServerDuid { duid } => match parse_hex(&duid) {
                Ok(d) => server_duid = Some(d),
                Err(e) => warn!("Skipping bad server duid at {}:{}: {}", path.display(), n + 1, e),
            },
            Record::Ia(mut ia) => {
                ia.bindings.retain(|b| b.state != LeaseState::Expired);
                let key = (ia.kind, ia.iaid, ia.duid.clone());
                if ia.bindings.is_empty() {
                    latest.remove(&key);
                    continue;
                }
                if !latest.contains_key(&key) {
                    order.push(key.clone());
                }
                latest.insert(key, ia);
            }
        }
    }

    let ias = order.into_iter().filter_map(|k| latest.remove(&k)).collect();
    Ok(LoadedLeases { server_duid, ias })
}

fn rewrite(path: &Path, loaded: &LoadedLeases) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let file = File::create(&tmp).with_context(|| format!("Failed to create {}", tmp.display()))?;
        let mut w = BufWriter::new(file);
        if let Some(duid) = &loaded.server_duid {
            serde_json::to_writer(&mut w, &Record::ServerDuid { duid: hex::encode(duid) })?;
            w.write_all(b"\n")?;
        }
        for ia in &loaded.ias {
            serde_json::to_writer(&mut w, &Record::Ia(ia.clone()))?;
            w.write_all(b"\n")?;
        }
        w.flush()?;
        w.get_ref().sync_all()?;
    }
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to replace lease file {}", path.display()))?;
    Ok(())
}

// ── In-memory store ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<IaRecord>,
    server_duid: Option<Vec<u8>>,
    commits: usize,
}

/// Records writes in memory. Clones share the same state, so a test can
/// keep a handle after giving the store to the server.
#[derive(Debug, Default, Clone)]
pub struct MemoryLeaseStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    pub fn records(&self) -> Vec<IaRecord> {
        self.with(|s| s.records.clone())
    }

    pub fn server_duid(&self) -> Option<Vec<u8>> {
        self.with(|s| s.server_duid.clone())
    }

    pub fn commits(&self) -> usize {
        self.with(|s| s.commits)
    }
}

impl LeaseStore for MemoryLeaseStore {
    fn write_ia(&mut self, record: &IaRecord) -> Result<()> {
        self.with(|s| s.records.push(record.clone()));
        Ok(())
    }

    fn write_server_duid(&mut self, duid: &[u8]) -> Result<()> {
        self.with(|s| s.server_duid = Some(duid.to_vec()));
        Ok(())
    }

    fn commit(&mut self, _flush: bool) -> Result<()> {
        self.with(|s| s.commits += 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(addr: &str, state: LeaseState) -> BindingRecord {
        BindingRecord {
            address: addr.parse::<Ipv6Addr>().unwrap(),
            prefix_len: 128,
            state,
            preferred: 100,
            valid: 200,
            ends: 5000,
        }
    }

    fn ia(iaid: u32, bindings: Vec<BindingRecord>) -> IaRecord {
        IaRecord {
            kind: IaKind::Na,
            iaid,
            duid: "000100aa".into(),
            cltt: 1000,
            bindings,
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dhcp6-leasefile-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir.join("dhcp6.leases")
    }

    #[test]
    fn test_replay_latest_record_wins_and_compacts() {
        let path = temp_path("replay");
        {
            let (mut file, loaded) = JsonLeaseFile::open(&path, 0).unwrap();
            assert!(loaded.ias.is_empty());
            file.write_server_duid(&[0, 1, 0, 1, 9]).unwrap();
            file.write_ia(&ia(1, vec![binding("2001:db8::1", LeaseState::Active)])).unwrap();
            file.write_ia(&ia(2, vec![binding("2001:db8::2", LeaseState::Active)])).unwrap();
            file.write_ia(&ia(1, vec![binding("2001:db8::3", LeaseState::Active)])).unwrap();
            // released: empty snapshot deletes the IA
            file.write_ia(&ia(2, Vec::new())).unwrap();
            file.write_ia(&ia(3, vec![binding("2001:db8::4", LeaseState::Expired)])).unwrap();
            file.commit(true).unwrap();
        }

        let (_file, loaded) = JsonLeaseFile::open(&path, 0).unwrap();
        assert_eq!(loaded.server_duid, Some(vec![0, 1, 0, 1, 9]));
        assert_eq!(loaded.ias.len(), 1);
        assert_eq!(loaded.ias[0].iaid, 1);
        assert_eq!(loaded.ias[0].bindings[0].address, "2001:db8::3".parse::<Ipv6Addr>().unwrap());

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_unreadable_lines_are_skipped() {
        let path = temp_path("garbage");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let good = serde_json::to_string(&Record::Ia(ia(7, vec![binding("2001:db8::7", LeaseState::Abandoned)]))).unwrap();
        std::fs::write(&path, format!("not json\n{}\n", good)).unwrap();

        let (_file, loaded) = JsonLeaseFile::open(&path, 60).unwrap();
        assert_eq!(loaded.ias.len(), 1);
        assert_eq!(loaded.ias[0].bindings[0].state, LeaseState::Abandoned);
        assert_eq!(loaded.ias[0].key().unwrap().duid, vec![0, 1, 0, 0xaa]);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_snapshot_of_missing_ia_is_a_deletion() {
        let store = BindingStore::new();
        let key = IaKey::new(IaKind::Pd, 4, &[1, 2]);
        let record = IaRecord::snapshot(&store, &key, 77);
        assert_eq!(record.duid, "0102");
        assert_eq!(record.cltt, 77);
        assert!(record.bindings.is_empty());
    }
}
