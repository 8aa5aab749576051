//! The filesystem-backed session catalog.
//!
//! Every session gets a `session-<NNN>.meta` JSON file and a
//! `session-<NNN>.sock` listening socket under a per-user 0700 root.
//! A `.lock` file (presence-as-lock) serializes ID allocation and
//! listing across processes, and `.current_session` records the one
//! active attachment. Dead sessions are garbage collected lazily, so
//! the catalog self-heals after supervisor or client crashes.

use std::{
    env, fs,
    io::{self, Write},
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, TryLockError},
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use lazy_static::lazy_static;
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use serde_derive::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{consts, error::SessError};

/// Metadata persisted for one session. The file exists iff the
/// supervisor has started the shell and recorded the child pid.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionMeta {
    #[serde(alias = "number")]
    pub session_num: String,
    pub created_at: String,
    /// pid of the shell child, used for liveness probing.
    pub pid: i32,
    pub command: String,
}

/// The registry-global record of the one active attachment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CurrentAttachment {
    pub number: String,
    /// pid of the attached client, used to deliver out-of-band detach.
    pub pid: i32,
}

pub struct Registry {
    root: PathBuf,
}

lazy_static! {
    // The lock file excludes other processes; this additionally
    // serializes lock acquisition between threads of this process.
    static ref LOCAL_LOCK: Mutex<()> = Mutex::new(());
}

/// Held while allocating or listing. Unlinks the lock file when
/// dropped, on every exit path.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    _local: MutexGuard<'static, ()>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("error removing registry lock file: {:?}", e);
        }
    }
}

impl Registry {
    pub fn new(dir_override: Option<PathBuf>) -> anyhow::Result<Registry> {
        let root = match dir_override {
            Some(d) => d,
            None => default_root()?,
        };
        Registry::from_root(root)
    }

    pub fn from_root<P: Into<PathBuf>>(root: P) -> anyhow::Result<Registry> {
        let reg = Registry { root: root.into() };
        reg.ensure_root()?;
        Ok(reg)
    }

    fn ensure_root(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating registry root {:?}", self.root))?;
        fs::set_permissions(&self.root, fs::Permissions::from_mode(0o700))
            .context("setting registry root permissions")?;
        Ok(())
    }

    pub fn socket_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("session-{id}.sock"))
    }

    pub fn meta_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("session-{id}.meta"))
    }

    fn current_path(&self) -> PathBuf {
        self.root.join(".current_session")
    }

    pub fn lock(&self) -> anyhow::Result<LockGuard> {
        self.lock_timeout(consts::LOCK_TIMEOUT)
    }

    /// Acquire the whole-registry lock by exclusively creating the
    /// lock file, polling until the deadline.
    pub fn lock_timeout(&self, timeout: Duration) -> anyhow::Result<LockGuard> {
        let deadline = Instant::now() + timeout;
        let path = self.root.join(".lock");
        loop {
            let local = match LOCAL_LOCK.try_lock() {
                Ok(g) => Some(g),
                // propagate the poison rather than deadlocking
                Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
                Err(TryLockError::WouldBlock) => None,
            };
            if let Some(local) = local {
                match fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(&path)
                {
                    Ok(_) => return Ok(LockGuard { path, _local: local }),
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        // another process holds it, keep polling
                    }
                    Err(e) => return Err(e).context("creating registry lock file"),
                }
            }

            if Instant::now() >= deadline {
                return Err(SessError::Timeout("acquiring registry lock").into());
            }
            thread::sleep(consts::LOCK_POLL_DUR);
        }
    }

    /// Next ID = 1 + max(existing), or 1 if the root is empty. Gaps
    /// from killed sessions are never reused because dead metadata is
    /// only ever removed after the max has moved past it.
    pub fn alloc_next_id(&self, _lock: &LockGuard) -> anyhow::Result<String> {
        let max = self.scan_ids()?.into_iter().max().unwrap_or(0);
        Ok(format_id(max + 1))
    }

    fn scan_ids(&self) -> anyhow::Result<Vec<u32>> {
        let mut ids = vec![];
        for entry in fs::read_dir(&self.root).context("scanning registry root")? {
            let entry = entry.context("reading registry dir entry")?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(num) =
                name.strip_prefix("session-").and_then(|n| n.strip_suffix(".meta"))
            {
                if let Ok(n) = num.parse::<u32>() {
                    ids.push(n);
                }
            }
        }
        Ok(ids)
    }

    /// Enumerate sessions whose shell pid is still alive, ascending by
    /// ID. Dead ones are garbage collected as a side effect.
    pub fn list_live(&self) -> anyhow::Result<Vec<SessionMeta>> {
        let _lock = self.lock()?;

        let mut ids = self.scan_ids()?;
        ids.sort_unstable();

        let mut live = vec![];
        for n in ids {
            let id = format_id(n);
            let meta = match self.read_meta_file(&id)? {
                Some(m) => m,
                None => continue,
            };
            if pid_alive(meta.pid) {
                live.push(meta);
            } else {
                info!("gc'ing dead session {}", id);
                self.gc(&id);
            }
        }
        Ok(live)
    }

    /// Fetch one session's metadata. Garbage collects and reports
    /// `SessionDead` if the recorded pid is gone.
    pub fn lookup(&self, id: &str) -> anyhow::Result<SessionMeta> {
        let id = normalize_id(id);
        let meta = match self.read_meta_file(&id)? {
            Some(m) => m,
            None => return Err(SessError::NotFound(id).into()),
        };
        if !pid_alive(meta.pid) {
            self.gc(&id);
            return Err(SessError::SessionDead(id).into());
        }
        Ok(meta)
    }

    fn read_meta_file(&self, id: &str) -> anyhow::Result<Option<SessionMeta>> {
        let path = self.meta_path(id);
        let data = match fs::read_to_string(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("reading session metadata"),
        };
        match serde_json::from_str(&data) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                // a mangled file shouldn't wedge the whole catalog
                warn!("skipping unparsable metadata {:?}: {:?}", path, e);
                Ok(None)
            }
        }
    }

    /// Atomically persist session metadata. Called by the supervisor
    /// once the shell child is running.
    pub fn write_meta(&self, meta: &SessionMeta) -> anyhow::Result<()> {
        let buf = serde_json::to_vec(meta).context("formatting session metadata")?;
        self.write_atomic(&self.meta_path(&meta.session_num), &buf)
    }

    /// Terminate the session's shell: SIGTERM, up to a second of
    /// grace, then SIGKILL. Cleans up the session's files and the
    /// current-attachment pointer if it referenced this session.
    pub fn kill(&self, id: &str) -> anyhow::Result<()> {
        let id = normalize_id(id);
        let meta = match self.read_meta_file(&id)? {
            Some(m) => m,
            None => return Err(SessError::NotFound(id).into()),
        };

        match signal::kill(Pid::from_raw(meta.pid), Signal::SIGTERM) {
            Err(Errno::ESRCH) => {
                // No side effects here, so killing a dead session
                // reports the same thing however often it is repeated.
                // The list/lookup sweeps collect the files.
                return Err(SessError::AlreadyDead(id).into());
            }
            Err(e) => return Err(e).context("sending SIGTERM to session shell"),
            Ok(()) => {}
        }

        let deadline = Instant::now() + consts::SHELL_TERM_TIMEOUT;
        while pid_alive(meta.pid) && Instant::now() < deadline {
            thread::sleep(consts::SHELL_TERM_POLL_DUR);
        }
        if pid_alive(meta.pid) {
            info!("session {} ignored SIGTERM, escalating", id);
            let _ = signal::kill(Pid::from_raw(meta.pid), Signal::SIGKILL);
        }

        self.gc(&id);
        self.clear_current_if(&id);
        Ok(())
    }

    fn gc(&self, id: &str) {
        let _ = fs::remove_file(self.meta_path(id));
        let _ = fs::remove_file(self.socket_path(id));
    }

    pub fn set_current(&self, id: &str, client_pid: i32) -> anyhow::Result<()> {
        let att =
            CurrentAttachment { number: normalize_id(id), pid: client_pid };
        let buf = serde_json::to_vec(&att).context("formatting current attachment")?;
        self.write_atomic(&self.current_path(), &buf)
    }

    /// Read the current attachment, validating that both the session
    /// and the recorded client pid are still alive. A stale pointer is
    /// cleared and reported as no attachment.
    pub fn get_current(&self) -> anyhow::Result<Option<CurrentAttachment>> {
        let data = match fs::read_to_string(self.current_path()) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("reading current attachment"),
        };

        let att = match parse_current(&data) {
            Some(att) => att,
            None => {
                warn!("clearing unparsable current attachment");
                self.clear_current();
                return Ok(None);
            }
        };

        if self.lookup(&att.number).is_err() {
            info!("current attachment points at defunct session {}, clearing", att.number);
            self.clear_current();
            return Ok(None);
        }
        // legacy records carry pid 0, which we can't probe
        if att.pid > 0 && !pid_alive(att.pid) {
            info!("current attachment client pid {} is gone, clearing", att.pid);
            self.clear_current();
            return Ok(None);
        }

        Ok(Some(att))
    }

    pub fn clear_current(&self) {
        let _ = fs::remove_file(self.current_path());
    }

    /// Clear the pointer only when it names the given session, without
    /// liveness validation. Used by supervisor shutdown and kill so a
    /// dying session can't clobber an attachment to a different one.
    pub fn clear_current_if(&self, id: &str) {
        if let Ok(data) = fs::read_to_string(self.current_path()) {
            if let Some(att) = parse_current(&data) {
                if att.number == id {
                    self.clear_current();
                }
            }
        }
    }

    fn write_atomic(&self, path: &Path, buf: &[u8]) -> anyhow::Result<()> {
        // tempfile creates 0600 files, which is exactly the mode the
        // registry's payload files want
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)
            .context("creating registry temp file")?;
        tmp.write_all(buf).context("writing registry temp file")?;
        tmp.persist(path).context("renaming registry temp file into place")?;
        Ok(())
    }
}

/// Accept a structured record or the legacy plain session number.
fn parse_current(data: &str) -> Option<CurrentAttachment> {
    if let Ok(att) = serde_json::from_str::<CurrentAttachment>(data) {
        return Some(att);
    }
    let trimmed = data.trim();
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Some(CurrentAttachment { number: normalize_id(trimmed), pid: 0 });
    }
    None
}

/// Null-signal liveness probe. Only "no such process" counts as dead;
/// EPERM and friends mean something is there.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    !matches!(signal::kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

pub fn format_id(n: u32) -> String {
    format!("{n:03}")
}

/// Zero-pad numeric IDs to width three; non-numeric input passes
/// through unchanged so the subsequent lookup can fail it.
pub fn normalize_id(id: &str) -> String {
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(n) = id.parse::<u32>() {
            return format_id(n);
        }
    }
    String::from(id)
}

/// The session ID exported by the enclosing supervisor, if any.
pub fn current_session_from_env() -> Option<String> {
    env::var(consts::SESSION_ENV_VAR).ok().filter(|v| !v.is_empty())
}

pub fn in_session() -> bool {
    current_session_from_env().is_some()
}

pub fn timestamp_now() -> String {
    chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, false)
}

fn default_root() -> anyhow::Result<PathBuf> {
    if let Ok(runtime_dir) = env::var("XDG_RUNTIME_DIR") {
        return Ok(PathBuf::from(runtime_dir).join("sess"));
    }
    let home = env::var("HOME").context("no XDG_RUNTIME_DIR or HOME")?;
    Ok(PathBuf::from(home).join(".sess"))
}

#[cfg(test)]
mod test {
    use super::*;

    // comfortably above any real pid_max
    const DEAD_PID: i32 = 99999999;

    fn test_registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().expect("creating tmp registry root");
        let reg = Registry::from_root(dir.path()).expect("creating registry");
        (dir, reg)
    }

    fn seed_meta(reg: &Registry, id: &str, pid: i32) {
        let meta = SessionMeta {
            session_num: String::from(id),
            created_at: timestamp_now(),
            pid,
            command: String::from("/bin/sh"),
        };
        reg.write_meta(&meta).expect("seeding metadata");
    }

    fn self_pid() -> i32 {
        std::process::id() as i32
    }

    #[test]
    fn alloc_starts_at_one() -> anyhow::Result<()> {
        let (_dir, reg) = test_registry();
        let lock = reg.lock()?;
        assert_eq!(reg.alloc_next_id(&lock)?, "001");
        Ok(())
    }

    #[test]
    fn alloc_never_reuses_gaps() -> anyhow::Result<()> {
        let (_dir, reg) = test_registry();
        seed_meta(&reg, "001", self_pid());
        seed_meta(&reg, "007", self_pid());

        let lock = reg.lock()?;
        assert_eq!(reg.alloc_next_id(&lock)?, "008");
        Ok(())
    }

    #[test]
    fn alloc_concurrent_ids_distinct() -> anyhow::Result<()> {
        let (_dir, reg) = test_registry();
        let ids = Mutex::new(Vec::new());

        thread::scope(|s| {
            for _ in 0..10 {
                s.spawn(|| {
                    let lock = reg.lock().expect("acquiring lock");
                    let id = reg.alloc_next_id(&lock).expect("allocating id");
                    // make the allocation durable before releasing, the
                    // way the launcher holds the lock until the
                    // supervisor's files exist
                    seed_meta(&reg, &id, self_pid());
                    ids.lock().unwrap().push(id);
                });
            }
        });

        let mut ids = ids.into_inner().unwrap();
        ids.sort();
        let want: Vec<String> = (1..=10).map(format_id).collect();
        assert_eq!(ids, want);
        Ok(())
    }

    #[test]
    fn normalize_pads_and_is_idempotent() {
        let cases = vec![("1", "001"), ("007", "007"), ("42", "042"), ("1000", "1000")];
        for (input, want) in cases {
            assert_eq!(normalize_id(input), want);
            assert_eq!(normalize_id(&normalize_id(input)), want);
        }
        // non-numeric input passes through untouched
        assert_eq!(normalize_id("bogus"), "bogus");
        assert_eq!(normalize_id(""), "");
    }

    #[test]
    fn current_round_trip() -> anyhow::Result<()> {
        let (dir, reg) = test_registry();
        seed_meta(&reg, "003", self_pid());

        reg.set_current("3", self_pid())?;
        let att = reg.get_current()?.expect("an attachment");
        assert_eq!(att.number, "003");
        assert_eq!(att.pid, self_pid());

        reg.clear_current();
        assert!(reg.get_current()?.is_none());
        assert!(!dir.path().join(".current_session").exists());
        Ok(())
    }

    #[test]
    fn current_accepts_legacy_format() -> anyhow::Result<()> {
        let (dir, reg) = test_registry();
        seed_meta(&reg, "007", self_pid());
        fs::write(dir.path().join(".current_session"), "007\n")?;

        let att = reg.get_current()?.expect("an attachment");
        assert_eq!(att, CurrentAttachment { number: String::from("007"), pid: 0 });
        Ok(())
    }

    #[test]
    fn current_self_heals_dead_client() -> anyhow::Result<()> {
        let (dir, reg) = test_registry();
        seed_meta(&reg, "001", self_pid());

        reg.set_current("001", DEAD_PID)?;
        assert!(reg.get_current()?.is_none());
        assert!(!dir.path().join(".current_session").exists());
        Ok(())
    }

    #[test]
    fn current_self_heals_missing_session() -> anyhow::Result<()> {
        let (dir, reg) = test_registry();
        reg.set_current("042", self_pid())?;

        assert!(reg.get_current()?.is_none());
        assert!(!dir.path().join(".current_session").exists());
        Ok(())
    }

    #[test]
    fn lookup_missing() {
        let (_dir, reg) = test_registry();
        let err = reg.lookup("5").unwrap_err();
        assert_eq!(
            err.downcast_ref::<SessError>(),
            Some(&SessError::NotFound(String::from("005")))
        );
    }

    #[test]
    fn lookup_dead_session_gcs() -> anyhow::Result<()> {
        let (dir, reg) = test_registry();
        seed_meta(&reg, "998", DEAD_PID);
        fs::write(dir.path().join("session-998.sock"), "")?;

        let err = reg.lookup("998").unwrap_err();
        assert_eq!(
            err.downcast_ref::<SessError>(),
            Some(&SessError::SessionDead(String::from("998")))
        );
        assert!(!dir.path().join("session-998.meta").exists());
        assert!(!dir.path().join("session-998.sock").exists());
        Ok(())
    }

    #[test]
    fn list_live_drops_dead() -> anyhow::Result<()> {
        let (dir, reg) = test_registry();
        seed_meta(&reg, "001", self_pid());
        seed_meta(&reg, "002", DEAD_PID);

        let live = reg.list_live()?;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].session_num, "001");
        assert!(!dir.path().join("session-002.meta").exists());
        Ok(())
    }

    #[test]
    fn kill_dead_session_is_idempotent() -> anyhow::Result<()> {
        let (dir, reg) = test_registry();
        seed_meta(&reg, "004", DEAD_PID);

        // repeated kills of a dead session keep saying the same thing
        // and touch nothing
        for _ in 0..2 {
            let err = reg.kill("4").unwrap_err();
            assert_eq!(
                err.downcast_ref::<SessError>(),
                Some(&SessError::AlreadyDead(String::from("004")))
            );
            assert!(dir.path().join("session-004.meta").exists());
        }

        // the liveness sweep is what finally collects the carcass
        let err = reg.lookup("4").unwrap_err();
        assert_eq!(
            err.downcast_ref::<SessError>(),
            Some(&SessError::SessionDead(String::from("004")))
        );
        assert!(!dir.path().join("session-004.meta").exists());

        // after that the id no longer names a session at all
        let err = reg.kill("4").unwrap_err();
        assert_eq!(
            err.downcast_ref::<SessError>(),
            Some(&SessError::NotFound(String::from("004")))
        );
        Ok(())
    }

    #[test]
    fn kill_missing() {
        let (_dir, reg) = test_registry();
        let err = reg.kill("9").unwrap_err();
        assert_eq!(
            err.downcast_ref::<SessError>(),
            Some(&SessError::NotFound(String::from("009")))
        );
    }

    #[test]
    fn lock_times_out_while_held() -> anyhow::Result<()> {
        let (_dir, reg) = test_registry();
        let _held = reg.lock()?;

        let err = reg.lock_timeout(Duration::from_millis(200)).unwrap_err();
        assert_eq!(
            err.downcast_ref::<SessError>(),
            Some(&SessError::Timeout("acquiring registry lock"))
        );
        Ok(())
    }

    #[test]
    fn lock_released_on_drop() -> anyhow::Result<()> {
        let (dir, reg) = test_registry();
        {
            let _guard = reg.lock()?;
            assert!(dir.path().join(".lock").exists());
        }
        assert!(!dir.path().join(".lock").exists());

        // and it can be taken again
        let _guard = reg.lock_timeout(Duration::from_millis(200))?;
        Ok(())
    }
}
