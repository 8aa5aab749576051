use std::fs;

use ntest::timeout;

mod support;

#[test]
#[timeout(30000)]
fn no_attachment() -> anyhow::Result<()> {
    let root = support::TestRoot::new()?;

    let out = root.run(&["detach"])?;
    assert!(!out.status.success(), "detach with nothing attached succeeded");

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("no active attachment"), "stderr: {stderr}");
    Ok(())
}

#[test]
#[timeout(30000)]
fn dash_x_flag_spelling() -> anyhow::Result<()> {
    let root = support::TestRoot::new()?;

    let out = root.run(&["-x"])?;
    assert!(!out.status.success());

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("no active attachment"), "stderr: {stderr}");
    Ok(())
}

#[test]
#[timeout(30000)]
fn stale_legacy_pointer_cleared() -> anyhow::Result<()> {
    let root = support::TestRoot::new()?;
    // old installations recorded just the session number
    fs::write(root.current_path(), "007\n")?;

    let out = root.run(&["detach"])?;
    assert!(!out.status.success());

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("no active attachment"), "stderr: {stderr}");
    assert!(!root.current_path().exists(), "stale pointer survived");
    Ok(())
}

#[test]
#[timeout(30000)]
fn dead_client_pointer_cleared() -> anyhow::Result<()> {
    let root = support::TestRoot::new()?;
    let sleeper = support::Sleeper::spawn()?;
    root.seed_session("001", sleeper.pid())?;
    fs::write(
        root.current_path(),
        serde_json::to_vec(&serde_json::json!({"number": "001", "pid": support::DEAD_PID}))?,
    )?;

    let out = root.run(&["detach"])?;
    assert!(!out.status.success());

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("no active attachment"), "stderr: {stderr}");
    assert!(!root.current_path().exists(), "stale pointer survived");
    // the session itself is untouched
    assert!(root.meta_path("001").exists());
    Ok(())
}
