//! Recovery log command implementation.

use super::CliResult;
use courier_transport::{RecoveryEntry, RecoveryLog};
use std::path::Path;

/// Runs the recovery-log command.
pub fn run(path: &Path, format: &str) -> CliResult<()> {
    let entries = RecoveryLog::read(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        _ => {
            print_text_output(path, &entries);
        }
    }

    Ok(())
}

fn print_text_output(path: &Path, entries: &[RecoveryEntry]) {
    println!("Recovery log: {}", path.display());
    println!("Pending background requests: {}", entries.len());
    if entries.is_empty() {
        return;
    }
    println!();
    println!(
        "{:<38} {:<7} {:<40} {:<20} {:<14}",
        "REQUEST", "METHOD", "PATH", "SESSION/TASK", "RECORDED (ms)"
    );
    for entry in entries {
        println!(
            "{:<38} {:<7} {:<40} {:<20} {:<14}",
            entry.request_id,
            entry.method.to_string(),
            entry.path,
            format!("{}/{}", entry.session, entry.task_id),
            entry.recorded_at_ms
        );
        if let Some(tag) = &entry.tag {
            println!("    tag: {tag}");
        }
    }
}
