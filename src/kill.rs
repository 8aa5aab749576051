use anyhow::anyhow;

use super::{error::SessError, registry, registry::Registry};

/// Kill one session. With no ID, kill "the current one": the
/// enclosing session when invoked from inside one, otherwise the
/// session named by the recorded attachment.
pub fn run(reg: &Registry, id: Option<String>) -> anyhow::Result<()> {
    let id = match id {
        Some(id) => registry::normalize_id(&id),
        None => current_session_id(reg)?,
    };

    reg.kill(&id)?;
    println!("Killed session {id}");
    Ok(())
}

pub fn run_all(reg: &Registry) -> anyhow::Result<()> {
    let sessions = reg.list_live()?;
    if sessions.is_empty() {
        println!("No active sessions");
        return Ok(());
    }

    let mut failed = vec![];
    for meta in sessions {
        match reg.kill(&meta.session_num) {
            Ok(()) => println!("Killed session {}", meta.session_num),
            // lost a race with the session's own exit; it is gone
            // either way
            Err(e)
                if matches!(
                    e.downcast_ref::<SessError>(),
                    Some(SessError::AlreadyDead(_) | SessError::NotFound(_))
                ) =>
            {
                println!("Killed session {}", meta.session_num);
            }
            Err(e) => {
                eprintln!("killing session {}: {e:#}", meta.session_num);
                failed.push(meta.session_num);
            }
        }
    }

    if !failed.is_empty() {
        return Err(anyhow!("failed to kill: {}", failed.join(" ")));
    }
    Ok(())
}

fn current_session_id(reg: &Registry) -> anyhow::Result<String> {
    if let Some(id) = registry::current_session_from_env() {
        return Ok(registry::normalize_id(&id));
    }
    if let Some(att) = reg.get_current()? {
        return Ok(att.number);
    }
    Err(SessError::NotInSession.into())
}
