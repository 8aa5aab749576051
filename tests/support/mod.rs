// This module is used from multiple different test files, each of which
// gets compiled into its own binary. Not all the binaries use all the
// stuff here.
#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    process::{Child, Command, Output},
};

use anyhow::Context;
use tempfile::TempDir;

pub fn sess_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_sess"))
}

/// An isolated storage root plus helpers for running the binary
/// against it.
pub struct TestRoot {
    dir: TempDir,
}

impl TestRoot {
    pub fn new() -> anyhow::Result<TestRoot> {
        // salt the prefix so concurrently running test binaries can't
        // ever collide even outside tempfile's own randomization
        let salt: u32 = rand::random();
        let dir = tempfile::Builder::new()
            .prefix(&format!("sess-test-{salt:08x}-"))
            .tempdir()
            .context("creating tmp registry root")?;
        Ok(TestRoot { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// A command for the sess binary pointed at this root, with any
    /// ambient session environment scrubbed for hermeticity.
    pub fn sess_cmd(&self) -> Command {
        let mut cmd = Command::new(sess_bin());
        cmd.arg("--sess-dir").arg(self.dir.path()).env_remove("SESS_NUM");
        cmd
    }

    pub fn run(&self, args: &[&str]) -> anyhow::Result<Output> {
        self.sess_cmd().args(args).output().context("running sess")
    }

    /// Drop a metadata file into the root as if a supervisor had
    /// written it.
    pub fn seed_session(&self, id: &str, pid: i32) -> anyhow::Result<()> {
        let meta = serde_json::json!({
            "session_num": id,
            "created_at": "2026-01-01T00:00:00+00:00",
            "pid": pid,
            "command": "/bin/sh",
        });
        fs::write(self.meta_path(id), serde_json::to_vec(&meta)?)
            .context("seeding session metadata")?;
        Ok(())
    }

    pub fn seed_socket_file(&self, id: &str) -> anyhow::Result<()> {
        fs::write(self.sock_path(id), b"").context("seeding socket file")?;
        Ok(())
    }

    pub fn meta_path(&self, id: &str) -> PathBuf {
        self.dir.path().join(format!("session-{id}.meta"))
    }

    pub fn sock_path(&self, id: &str) -> PathBuf {
        self.dir.path().join(format!("session-{id}.sock"))
    }

    pub fn current_path(&self) -> PathBuf {
        self.dir.path().join(".current_session")
    }

    pub fn meta_files(&self) -> anyhow::Result<Vec<String>> {
        let mut names = vec![];
        for entry in fs::read_dir(self.dir.path())? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.ends_with(".meta") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

/// A throwaway process standing in for a session's shell; killed on
/// drop so a failing test can't leak it.
pub struct Sleeper {
    child: Child,
}

impl Sleeper {
    pub fn spawn() -> anyhow::Result<Sleeper> {
        let child = Command::new("sleep").arg("30").spawn().context("spawning sleeper")?;
        Ok(Sleeper { child })
    }

    pub fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    /// Reap the child so its pid stops probing as alive.
    pub fn reap(&mut self) -> anyhow::Result<()> {
        self.child.wait().context("reaping sleeper")?;
        Ok(())
    }
}

impl Drop for Sleeper {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// A pid that can't exist (far above any real pid_max).
pub const DEAD_PID: i32 = 99999999;
