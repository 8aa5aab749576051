use ntest::timeout;

mod support;

#[test]
#[timeout(30000)]
fn nested_create_refused() -> anyhow::Result<()> {
    let root = support::TestRoot::new()?;

    let out = root.sess_cmd().env("SESS_NUM", "007").output()?;
    assert!(!out.status.success(), "nested create succeeded");

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        stderr.contains("Cannot create session from within existing session 007"),
        "stderr: {stderr}"
    );
    assert_eq!(root.meta_files()?, Vec::<String>::new(), "a session was created anyway");
    Ok(())
}

#[test]
#[timeout(30000)]
fn nested_attach_create_refused() -> anyhow::Result<()> {
    let root = support::TestRoot::new()?;

    // `ac` with no such session falls into the create path, which must
    // also refuse from inside a session
    let out = root.sess_cmd().args(["ac", "9"]).env("SESS_NUM", "007").output()?;
    assert!(!out.status.success());

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        stderr.contains("Cannot create session from within existing session 007"),
        "stderr: {stderr}"
    );
    assert_eq!(root.meta_files()?, Vec::<String>::new());
    Ok(())
}

#[test]
#[timeout(30000)]
fn self_attach_refused() -> anyhow::Result<()> {
    let root = support::TestRoot::new()?;

    let out = root.sess_cmd().args(["attach", "7"]).env("SESS_NUM", "007").output()?;
    assert!(!out.status.success(), "self attach succeeded");

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        stderr.contains("cannot attach to session 007 from within itself"),
        "stderr: {stderr}"
    );
    Ok(())
}

#[test]
#[timeout(30000)]
fn attach_missing_session() -> anyhow::Result<()> {
    let root = support::TestRoot::new()?;

    let out = root.run(&["attach", "5"])?;
    assert!(!out.status.success());

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("session 005 not found"), "stderr: {stderr}");
    Ok(())
}

#[test]
#[timeout(30000)]
fn attach_dead_session() -> anyhow::Result<()> {
    let root = support::TestRoot::new()?;
    root.seed_session("003", support::DEAD_PID)?;

    let out = root.run(&["attach", "3"])?;
    assert!(!out.status.success());

    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("session 003 is dead"), "stderr: {stderr}");
    // the lookup garbage collects on the way out
    assert!(!root.meta_path("003").exists());
    Ok(())
}
