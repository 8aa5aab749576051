use super::registry::Registry;

pub fn run(reg: &Registry) -> anyhow::Result<()> {
    let sessions = reg.list_live()?;
    if sessions.is_empty() {
        println!("No active sessions");
        return Ok(());
    }

    println!("ID\tCREATED_AT\tPID\tCOMMAND");
    for session in sessions.iter() {
        println!(
            "{}\t{}\t{}\t{}",
            session.session_num, session.created_at, session.pid, session.command
        );
    }

    Ok(())
}
