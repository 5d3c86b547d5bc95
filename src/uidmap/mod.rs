//! UID ↔ package map.
//!
//! The engine's view of installed packages: versioned app records keyed by
//! `(uid, package)`, an insertion-ordered change log consumed by report
//! dumps, a bounded ring of deleted apps, and an isolated-uid → host-uid
//! overlay maintained by process lifecycle callbacks. The map has its own
//! locks and never takes the dispatcher lock; listener callbacks are always
//! invoked after the map lock is released.

mod aid;

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, Weak};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::spec::ConfigKey;
use crate::stats::GuardrailStats;

pub use aid::{aid_name, aid_uid, FIRST_APP_UID};
use std::sync::atomic::Ordering;

/// Byte budget for the change log. Oldest records drop first.
pub const MAX_BYTES: usize = 50 * 1024;
/// Flat cost charged per change record against [`MAX_BYTES`].
pub const BYTES_PER_CHANGE_RECORD: usize = 64;
/// Deleted apps retained before the oldest is purged from the map.
pub const MAX_DELETED_APPS: usize = 100;

/// Installed-package record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppData {
    pub version_code: i64,
    pub version_string: String,
    pub installer: String,
    pub certificate_hash: Vec<u8>,
    pub deleted: bool,
}

impl AppData {
    fn new(
        version_code: i64,
        version_string: String,
        installer: String,
        certificate_hash: Vec<u8>,
    ) -> Self {
        Self {
            version_code,
            version_string,
            installer,
            certificate_hash,
            deleted: false,
        }
    }
}

/// Full package description used by [`UidMap::update`].
#[derive(Debug, Clone)]
pub struct AppInfo {
    pub uid: i32,
    pub package: String,
    pub version_code: i64,
    pub version_string: String,
    pub installer: String,
    pub certificate_hash: Vec<u8>,
}

#[derive(Debug, Clone)]
struct ChangeRecord {
    deletion: bool,
    timestamp_ns: i64,
    package: String,
    uid: i32,
    version: i64,
    version_string: String,
    prev_version: i64,
    prev_version_string: String,
}

/// Subscriber for package lifecycle notifications. Callbacks run outside
/// the map lock; a subscriber that has unregistered itself must tolerate a
/// late call.
pub trait UidMapListener: Send + Sync {
    fn on_uid_map_received(&self, timestamp_ns: i64);
    fn on_app_upgrade(&self, timestamp_ns: i64, package: &str, uid: i32, version: i64);
    fn on_app_removed(&self, timestamp_ns: i64, package: &str, uid: i32);
}

#[derive(Default)]
struct Inner {
    map: HashMap<(i32, String), AppData>,
    changes: VecDeque<ChangeRecord>,
    deleted_apps: VecDeque<(i32, String)>,
    last_report: HashMap<ConfigKey, i64>,
    bytes_used: usize,
}

/// Thread-safe package map. See the module docs for the locking contract.
pub struct UidMap {
    inner: Mutex<Inner>,
    isolated: Mutex<HashMap<i32, i32>>,
    listener: Mutex<Weak<dyn UidMapListener>>,
}

impl Default for UidMap {
    fn default() -> Self {
        Self::new()
    }
}

impl UidMap {
    pub fn new() -> Self {
        let unset: Weak<dyn UidMapListener> = Weak::<NoopListener>::new();
        Self {
            inner: Mutex::new(Inner::default()),
            isolated: Mutex::new(HashMap::new()),
            listener: Mutex::new(unset),
        }
    }

    pub fn set_listener(&self, listener: Weak<dyn UidMapListener>) {
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = listener;
    }

    fn listener(&self) -> Option<std::sync::Arc<dyn UidMapListener>> {
        self.listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True when a non-deleted entry exists for `(uid, package)`.
    pub fn has_app(&self, uid: i32, package: &str) -> bool {
        let inner = self.lock();
        inner
            .map
            .get(&(uid, package.to_string()))
            .is_some_and(|a| !a.deleted)
    }

    pub fn app_version(&self, uid: i32, package: &str) -> i64 {
        let inner = self.lock();
        match inner.map.get(&(uid, package.to_string())) {
            Some(a) if !a.deleted => a.version_code,
            _ => 0,
        }
    }

    /// Package names owning `uid`, lower-cased when `normalized`.
    pub fn app_names_from_uid(&self, uid: i32, normalized: bool) -> Vec<String> {
        let inner = self.lock();
        let mut names: Vec<String> = inner
            .map
            .iter()
            .filter(|((u, _), data)| *u == uid && !data.deleted)
            .map(|((_, name), _)| {
                if normalized {
                    name.to_lowercase()
                } else {
                    name.clone()
                }
            })
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn app_uids(&self, package: &str) -> Vec<i32> {
        let inner = self.lock();
        let mut uids: Vec<i32> = inner
            .map
            .iter()
            .filter(|((_, name), data)| name == package && !data.deleted)
            .map(|((uid, _), _)| *uid)
            .collect();
        uids.sort_unstable();
        uids
    }

    pub fn bytes_used(&self) -> usize {
        self.lock().bytes_used
    }

    /// Atomic swap of the whole package table. Entries flagged deleted
    /// survive the swap so pending change-log consumers can still resolve
    /// them.
    pub fn update(&self, timestamp_ns: i64, apps: Vec<AppInfo>, stats: &GuardrailStats) {
        {
            let mut inner = self.lock();

            let deleted: Vec<((i32, String), AppData)> = inner
                .map
                .iter()
                .filter(|(_, data)| data.deleted)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();

            inner.map.clear();
            for app in apps {
                inner.map.insert(
                    (app.uid, app.package),
                    AppData::new(
                        app.version_code,
                        app.version_string,
                        app.installer,
                        app.certificate_hash,
                    ),
                );
            }

            for (key, data) in deleted {
                inner.map.entry(key).or_insert(data);
            }

            ensure_bytes_below_limit(&mut inner, stats);
            info!(packages = inner.map.len(), "uid map replaced");
        }

        if let Some(listener) = self.listener() {
            listener.on_uid_map_received(timestamp_ns);
        }
    }

    /// Records an install or upgrade of one package.
    pub fn upsert(
        &self,
        timestamp_ns: i64,
        uid: i32,
        package: &str,
        version_code: i64,
        version_string: &str,
        installer: &str,
        certificate_hash: Vec<u8>,
        stats: &GuardrailStats,
    ) {
        let mut is_upgrade = false;
        {
            let mut inner = self.lock();
            let key = (uid, package.to_string());
            let mut prev_version = 0;
            let mut prev_version_string = String::new();

            if let Some(existing) = inner.map.get_mut(&key) {
                prev_version = existing.version_code;
                prev_version_string = existing.version_string.clone();
                existing.version_code = version_code;
                existing.version_string = version_string.to_string();
                existing.installer = installer.to_string();
                existing.certificate_hash = certificate_hash;
                existing.deleted = false;
                // Only an upgrade of a known app notifies the listener;
                // first installs do not.
                is_upgrade = true;
            } else {
                inner.map.insert(
                    key,
                    AppData::new(
                        version_code,
                        version_string.to_string(),
                        installer.to_string(),
                        certificate_hash,
                    ),
                );
            }

            inner.changes.push_back(ChangeRecord {
                deletion: false,
                timestamp_ns,
                package: package.to_string(),
                uid,
                version: version_code,
                version_string: version_string.to_string(),
                prev_version,
                prev_version_string,
            });
            inner.bytes_used += BYTES_PER_CHANGE_RECORD;
            ensure_bytes_below_limit(&mut inner, stats);
        }

        if is_upgrade {
            if let Some(listener) = self.listener() {
                listener.on_app_upgrade(timestamp_ns, package, uid, version_code);
            }
        }
    }

    /// Flags a package deleted and records the removal. The entry survives
    /// until the deleted-apps ring evicts it.
    pub fn remove(&self, timestamp_ns: i64, uid: i32, package: &str, stats: &GuardrailStats) {
        {
            let mut inner = self.lock();
            let key = (uid, package.to_string());
            let mut prev_version = 0;
            let mut prev_version_string = String::new();

            if let Some(existing) = inner.map.get_mut(&key) {
                if !existing.deleted {
                    prev_version = existing.version_code;
                    prev_version_string = existing.version_string.clone();
                    existing.deleted = true;
                    inner.deleted_apps.push_back(key);
                }
            }

            if inner.deleted_apps.len() > MAX_DELETED_APPS {
                if let Some(oldest) = inner.deleted_apps.pop_front() {
                    debug!(uid = oldest.0, package = %oldest.1, "evicting oldest deleted app");
                    inner.map.remove(&oldest);
                }
            }

            inner.changes.push_back(ChangeRecord {
                deletion: true,
                timestamp_ns,
                package: package.to_string(),
                uid,
                version: 0,
                version_string: String::new(),
                prev_version,
                prev_version_string,
            });
            inner.bytes_used += BYTES_PER_CHANGE_RECORD;
            ensure_bytes_below_limit(&mut inner, stats);
        }

        if let Some(listener) = self.listener() {
            listener.on_app_removed(timestamp_ns, package, uid);
        }
    }

    pub fn assign_isolated(&self, isolated_uid: i32, parent_uid: i32) {
        self.isolated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(isolated_uid, parent_uid);
    }

    pub fn remove_isolated(&self, isolated_uid: i32) {
        self.isolated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&isolated_uid);
    }

    /// Resolves an isolated uid to its host, or returns the uid unchanged.
    pub fn host_uid_or_self(&self, uid: i32) -> i32 {
        self.isolated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&uid)
            .copied()
            .unwrap_or(uid)
    }

    /// Registers a config key so its first report covers all changes.
    pub fn on_config_updated(&self, key: ConfigKey) {
        self.lock().last_report.insert(key, -1);
    }

    pub fn on_config_removed(&self, key: ConfigKey) {
        self.lock().last_report.remove(&key);
    }

    /// Writes the current snapshot plus the change log accumulated since
    /// `key`'s previous report, then advances the report window and
    /// garbage-collects records no config still needs.
    pub fn append_report(
        &self,
        timestamp_ns: i64,
        key: ConfigKey,
        opts: &ReportOptions,
    ) -> UidMapReport {
        let mut inner = self.lock();

        let since = inner.last_report.get(&key).copied().unwrap_or(-1);
        let changes: Vec<UidMapChange> = inner
            .changes
            .iter()
            .filter(|c| c.timestamp_ns > since)
            .map(|c| render_change(c, opts))
            .collect();

        let mut packages: Vec<PackageSnapshot> = inner
            .map
            .iter()
            .map(|((uid, name), data)| render_snapshot(*uid, name, data, opts))
            .collect();
        packages.sort_by(|a, b| (a.uid, &a.package, &a.package_hash).cmp(&(b.uid, &b.package, &b.package_hash)));

        let prev_min = min_last_report(&inner);
        inner.last_report.insert(key, timestamp_ns);
        let new_min = min_last_report(&inner);

        if new_min > prev_min {
            let before = inner.changes.len();
            while inner
                .changes
                .front()
                .is_some_and(|c| c.timestamp_ns < new_min)
            {
                inner.changes.pop_front();
                inner.bytes_used = inner.bytes_used.saturating_sub(BYTES_PER_CHANGE_RECORD);
            }
            let purged = before - inner.changes.len();
            if purged > 0 {
                debug!(purged, "purged fully-reported uid map changes");
            }
        }

        UidMapReport {
            snapshot_timestamp_ns: timestamp_ns,
            packages,
            changes,
        }
    }
}

fn min_last_report(inner: &Inner) -> i64 {
    inner
        .last_report
        .values()
        .copied()
        .min()
        .unwrap_or(0)
        .max(0)
}

fn ensure_bytes_below_limit(inner: &mut Inner, stats: &GuardrailStats) {
    let mut dropped = 0u64;
    while inner.bytes_used > MAX_BYTES {
        if inner.changes.pop_front().is_some() {
            inner.bytes_used -= BYTES_PER_CHANGE_RECORD;
            dropped += 1;
        } else {
            break;
        }
    }
    if dropped > 0 {
        warn!(dropped, bytes = inner.bytes_used, "uid map over budget, dropped oldest changes");
        stats.map_memory_exceeded.fetch_add(1, Ordering::Relaxed);
        stats.map_changes_dropped.fetch_add(dropped, Ordering::Relaxed);
    }
}

/// String/field selection knobs for [`UidMap::append_report`].
#[derive(Debug, Clone, Default)]
pub struct ReportOptions {
    pub include_version_strings: bool,
    pub include_installer: bool,
    /// Leading bytes of the certificate hash to expose; 0 omits it.
    pub certificate_hash_bytes: u8,
    /// Replace strings with stable 64-bit hashes.
    pub hash_strings: bool,
}

/// Stable 64-bit string hash used when reports carry hashes, not strings.
pub fn hash64(s: &str) -> u64 {
    let digest = Sha256::digest(s.as_bytes());
    u64::from_le_bytes(digest[..8].try_into().unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PackageSnapshot {
    pub uid: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_hash: Option<u64>,
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_string: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_string_hash: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installer_hash: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub truncated_certificate_hash: Vec<u8>,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UidMapChange {
    pub deletion: bool,
    pub timestamp_ns: i64,
    pub uid: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_hash: Option<u64>,
    pub new_version: i64,
    pub prev_version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_version_string: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_version_string: Option<String>,
}

/// Snapshot plus change log emitted into a config report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UidMapReport {
    pub snapshot_timestamp_ns: i64,
    pub packages: Vec<PackageSnapshot>,
    pub changes: Vec<UidMapChange>,
}

fn render_snapshot(uid: i32, name: &str, data: &AppData, opts: &ReportOptions) -> PackageSnapshot {
    let mut snap = PackageSnapshot {
        uid,
        version: data.version_code,
        deleted: data.deleted,
        ..Default::default()
    };

    if opts.hash_strings {
        snap.package_hash = Some(hash64(name));
        if opts.include_version_strings {
            snap.version_string_hash = Some(hash64(&data.version_string));
        }
        if opts.include_installer {
            snap.installer_hash = Some(hash64(&data.installer));
        }
    } else {
        snap.package = Some(name.to_string());
        if opts.include_version_strings {
            snap.version_string = Some(data.version_string.clone());
        }
        if opts.include_installer {
            snap.installer = Some(data.installer.clone());
        }
    }

    let keep = usize::from(opts.certificate_hash_bytes).min(data.certificate_hash.len());
    if keep > 0 {
        snap.truncated_certificate_hash = data.certificate_hash[..keep].to_vec();
    }

    snap
}

fn render_change(c: &ChangeRecord, opts: &ReportOptions) -> UidMapChange {
    let mut out = UidMapChange {
        deletion: c.deletion,
        timestamp_ns: c.timestamp_ns,
        uid: c.uid,
        new_version: c.version,
        prev_version: c.prev_version,
        ..Default::default()
    };

    if opts.hash_strings {
        out.package_hash = Some(hash64(&c.package));
        if opts.include_version_strings {
            out.new_version_string = None;
            out.prev_version_string = None;
        }
    } else {
        out.package = Some(c.package.clone());
        if opts.include_version_strings {
            out.new_version_string = Some(c.version_string.clone());
            out.prev_version_string = Some(c.prev_version_string.clone());
        }
    }

    out
}

struct NoopListener;

impl UidMapListener for NoopListener {
    fn on_uid_map_received(&self, _: i64) {}
    fn on_app_upgrade(&self, _: i64, _: &str, _: i32, _: i64) {}
    fn on_app_removed(&self, _: i64, _: &str, _: i32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    fn stats() -> GuardrailStats {
        GuardrailStats::new()
    }

    fn app(uid: i32, package: &str, version: i64) -> AppInfo {
        AppInfo {
            uid,
            package: package.to_string(),
            version_code: version,
            version_string: format!("v{version}"),
            installer: "installer".to_string(),
            certificate_hash: vec![0xAB, 0xCD, 0xEF],
        }
    }

    #[test]
    fn test_has_app_after_update() {
        let map = UidMap::new();
        map.update(1, vec![app(1000, "com.example.a", 1)], &stats());
        assert!(map.has_app(1000, "com.example.a"));
        assert!(!map.has_app(1000, "com.example.b"));
        assert_eq!(map.app_version(1000, "com.example.a"), 1);
    }

    #[test]
    fn test_update_preserves_deleted_entries() {
        let st = stats();
        let map = UidMap::new();
        map.update(1, vec![app(1000, "com.example.a", 1)], &st);
        map.remove(2, 1000, "com.example.a", &st);
        assert!(!map.has_app(1000, "com.example.a"));

        // New snapshot includes the package again but the deleted flag from
        // the old entry wins so change-log consumers still see it deleted.
        map.update(3, vec![app(1000, "com.example.a", 2)], &st);
        assert!(!map.has_app(1000, "com.example.a"));
    }

    #[test]
    fn test_upsert_notifies_only_on_upgrade() {
        #[derive(Default)]
        struct Recorder {
            upgrades: AtomicU64,
        }
        impl UidMapListener for Recorder {
            fn on_uid_map_received(&self, _: i64) {}
            fn on_app_upgrade(&self, _: i64, _: &str, _: i32, _: i64) {
                self.upgrades.fetch_add(1, Ordering::Relaxed);
            }
            fn on_app_removed(&self, _: i64, _: &str, _: i32) {}
        }

        let st = stats();
        let map = UidMap::new();
        let recorder = Arc::new(Recorder::default());
        let dyn_listener: Arc<dyn UidMapListener> = recorder.clone();
        map.set_listener(Arc::downgrade(&dyn_listener));

        map.upsert(1, 1000, "com.example.a", 1, "v1", "i", vec![], &st);
        assert_eq!(recorder.upgrades.load(Ordering::Relaxed), 0);

        map.upsert(2, 1000, "com.example.a", 2, "v2", "i", vec![], &st);
        assert_eq!(recorder.upgrades.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_isolated_uid_overlay() {
        let map = UidMap::new();
        map.assign_isolated(99001, 10007);
        assert_eq!(map.host_uid_or_self(99001), 10007);
        assert_eq!(map.host_uid_or_self(10007), 10007);
        map.remove_isolated(99001);
        assert_eq!(map.host_uid_or_self(99001), 99001);
    }

    #[test]
    fn test_deleted_apps_ring_evicts_oldest() {
        let st = stats();
        let map = UidMap::new();
        for i in 0..(MAX_DELETED_APPS as i32 + 1) {
            let name = format!("com.example.p{i}");
            map.upsert(i64::from(i), 1000 + i, &name, 1, "v1", "i", vec![], &st);
            map.remove(i64::from(i) + 1000, 1000 + i, &name, &st);
        }
        // The first removed app was evicted entirely.
        let inner = map.lock();
        assert_eq!(inner.deleted_apps.len(), MAX_DELETED_APPS);
        assert!(!inner.map.contains_key(&(1000, "com.example.p0".to_string())));
    }

    #[test]
    fn test_change_log_byte_guardrail() {
        let st = stats();
        let map = UidMap::new();
        let over = MAX_BYTES / BYTES_PER_CHANGE_RECORD + 10;
        for i in 0..over {
            map.upsert(i as i64, 1000, "com.example.a", i as i64, "v", "i", vec![], &st);
        }
        assert!(map.bytes_used() <= MAX_BYTES);
        assert!(st.map_memory_exceeded.load(Ordering::Relaxed) > 0);
        assert!(st.map_changes_dropped.load(Ordering::Relaxed) >= 10);
    }

    #[test]
    fn test_append_report_windows_and_gc() {
        let st = stats();
        let map = UidMap::new();
        let key = ConfigKey::new(0, 1);
        map.on_config_updated(key);

        map.upsert(100, 100, "a", 1, "v1", "", vec![], &st);
        map.upsert(200, 100, "a", 2, "v2", "", vec![], &st);
        map.remove(300, 100, "a", &st);

        let opts = ReportOptions {
            include_version_strings: true,
            ..Default::default()
        };
        let report = map.append_report(400, key, &opts);
        assert_eq!(report.changes.len(), 3);
        assert_eq!(report.packages.len(), 1);
        assert!(report.packages[0].deleted);
        assert_eq!(report.packages[0].version, 2);

        // No further changes: empty change log, identical snapshot.
        let report2 = map.append_report(500, key, &opts);
        assert!(report2.changes.is_empty());
        assert_eq!(report2.packages, report.packages);

        // All records predate the minimum last-report time and are gone.
        let inner = map.lock();
        assert!(inner.changes.is_empty());
        assert_eq!(inner.last_report[&key], 500);
    }

    #[test]
    fn test_append_report_two_configs_gc_waits_for_minimum() {
        let st = stats();
        let map = UidMap::new();
        let key1 = ConfigKey::new(0, 1);
        let key2 = ConfigKey::new(0, 2);
        map.on_config_updated(key1);
        map.on_config_updated(key2);

        map.upsert(100, 100, "a", 1, "v1", "", vec![], &st);

        let opts = ReportOptions::default();
        let _ = map.append_report(200, key1, &opts);
        // key2 has not reported yet; the record must survive.
        assert_eq!(map.lock().changes.len(), 1);

        let r2 = map.append_report(300, key2, &opts);
        assert_eq!(r2.changes.len(), 1);
        assert!(map.lock().changes.is_empty());
    }

    #[test]
    fn test_report_hashed_strings() {
        let st = stats();
        let map = UidMap::new();
        let key = ConfigKey::new(0, 1);
        map.on_config_updated(key);
        map.upsert(100, 100, "com.example.a", 1, "v1", "play", vec![1, 2, 3, 4], &st);

        let opts = ReportOptions {
            include_version_strings: true,
            include_installer: true,
            certificate_hash_bytes: 2,
            hash_strings: true,
        };
        let report = map.append_report(200, key, &opts);
        let pkg = &report.packages[0];
        assert!(pkg.package.is_none());
        assert_eq!(pkg.package_hash, Some(hash64("com.example.a")));
        assert_eq!(pkg.installer_hash, Some(hash64("play")));
        assert_eq!(pkg.truncated_certificate_hash, vec![1, 2]);
    }

    #[test]
    fn test_app_names_normalized_for_matching() {
        let st = stats();
        let map = UidMap::new();
        map.upsert(1, 10007, "com.Example.App", 1, "v", "", vec![], &st);
        assert_eq!(
            map.app_names_from_uid(10007, true),
            vec!["com.example.app".to_string()]
        );
        assert_eq!(
            map.app_names_from_uid(10007, false),
            vec!["com.Example.App".to_string()]
        );
    }
}
