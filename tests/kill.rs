use ntest::timeout;

mod support;

#[test]
#[timeout(30000)]
fn missing_session() -> anyhow::Result<()> {
    let root = support::TestRoot::new()?;

    let out = root.run(&["kill", "9"])?;
    assert!(!out.status.success(), "kill of a missing session succeeded");

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("session 009 not found"), "stderr: {stderr}");
    Ok(())
}

#[test]
#[timeout(30000)]
fn dead_session_reports_already_dead() -> anyhow::Result<()> {
    let root = support::TestRoot::new()?;
    root.seed_session("998", support::DEAD_PID)?;
    root.seed_socket_file("998")?;

    let re = regex::Regex::new(r"session 998 is already dead")?;

    // killing a dead session is idempotent: same report, no cleanup
    for _ in 0..2 {
        let out = root.run(&["kill", "998"])?;
        assert!(!out.status.success());

        let stderr = String::from_utf8_lossy(&out.stderr);
        assert!(re.is_match(&stderr), "stderr: {stderr}");
        assert!(root.meta_path("998").exists(), "kill swept the carcass itself");
    }

    // the list sweep is what garbage collects it
    let out = root.run(&["ls"])?;
    assert!(out.status.success(), "ls failed: {out:?}");
    assert!(String::from_utf8_lossy(&out.stdout).contains("No active sessions"));
    assert!(!root.meta_path("998").exists());
    assert!(!root.sock_path("998").exists());
    Ok(())
}

#[test]
#[timeout(30000)]
fn live_session_killed() -> anyhow::Result<()> {
    let root = support::TestRoot::new()?;
    let mut sleeper = support::Sleeper::spawn()?;
    root.seed_session("001", sleeper.pid())?;
    root.seed_socket_file("001")?;

    let out = root.run(&["kill", "1"])?;
    assert!(out.status.success(), "kill failed: {out:?}");

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Killed session 001"), "stdout: {stdout}");

    // the stand-in shell should be gone now
    sleeper.reap()?;
    assert!(!root.meta_path("001").exists());
    assert!(!root.sock_path("001").exists());
    Ok(())
}

#[test]
#[timeout(30000)]
fn no_id_and_no_attachment() -> anyhow::Result<()> {
    let root = support::TestRoot::new()?;

    let out = root.run(&["kill"])?;
    assert!(!out.status.success());

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("no active attachment"), "stderr: {stderr}");
    Ok(())
}

#[test]
#[timeout(30000)]
fn no_id_uses_enclosing_session() -> anyhow::Result<()> {
    let root = support::TestRoot::new()?;
    let mut sleeper = support::Sleeper::spawn()?;
    root.seed_session("007", sleeper.pid())?;

    let out = root.sess_cmd().arg("kill").env("SESS_NUM", "007").output()?;
    assert!(out.status.success(), "kill failed: {out:?}");

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Killed session 007"), "stdout: {stdout}");

    sleeper.reap()?;
    assert!(!root.meta_path("007").exists());
    Ok(())
}

#[test]
#[timeout(30000)]
fn killall_empty() -> anyhow::Result<()> {
    let root = support::TestRoot::new()?;

    let out = root.run(&["killall"])?;
    assert!(out.status.success());

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("No active sessions"));
    Ok(())
}

#[test]
#[timeout(30000)]
fn killall_multiple() -> anyhow::Result<()> {
    let root = support::TestRoot::new()?;
    let mut s1 = support::Sleeper::spawn()?;
    let mut s2 = support::Sleeper::spawn()?;
    root.seed_session("001", s1.pid())?;
    root.seed_session("002", s2.pid())?;

    let out = root.run(&["killall"])?;
    assert!(out.status.success(), "killall failed: {out:?}");

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Killed session 001"), "stdout: {stdout}");
    assert!(stdout.contains("Killed session 002"), "stdout: {stdout}");

    s1.reap()?;
    s2.reap()?;
    assert_eq!(root.meta_files()?, Vec::<String>::new());
    Ok(())
}
