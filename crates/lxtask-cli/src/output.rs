//! Formatted output helpers for CLI commands.
//!
//! Renders lifecycle events, usage samples and exit results as single
//! human-readable lines.

use lxtask_common::types::{ExitResult, TaskResourceUsage};
use lxtask_runtime::event::{TaskEvent, TaskEventKind};

/// Formats a byte count into a human-readable string (e.g., "128 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Renders an exit result, e.g. `exit code 137 (oom killed)`.
#[must_use]
pub fn format_exit(result: &ExitResult) -> String {
    let mut line = format!("exit code {}", result.exit_code);
    if result.oom_killed {
        line.push_str(" (oom killed)");
    }
    if let Some(err) = &result.err {
        line.push_str(": ");
        line.push_str(err);
    }
    line
}

/// Renders a lifecycle event.
#[must_use]
pub fn format_event(event: &TaskEvent) -> String {
    let kind = match &event.kind {
        TaskEventKind::Started => "started".to_owned(),
        TaskEventKind::Recovered => "recovered".to_owned(),
        TaskEventKind::Exited { result } => format!("exited, {}", format_exit(result)),
        TaskEventKind::Stopped => "stopped".to_owned(),
        TaskEventKind::Destroyed => "destroyed".to_owned(),
    };
    format!(
        "{} {} {kind}: {}",
        event.timestamp.format("%H:%M:%S"),
        event.task_id,
        event.message
    )
}

/// Renders a usage sample as CPU percentage and memory.
#[must_use]
pub fn format_usage(usage: &TaskResourceUsage) -> String {
    format!(
        "cpu {:>5.1}% (user {:.1}%, system {:.1}%)  mem {}",
        usage.cpu.total_percent,
        usage.cpu.user_percent,
        usage.cpu.system_percent,
        format_bytes(usage.memory.usage_bytes)
    )
}
