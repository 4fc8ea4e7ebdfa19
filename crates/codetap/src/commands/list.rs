//! `codetap list`: table of discovered sessions.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use codetap_core::platform;

use crate::service::SessionEntry;

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Socket directory (default: /dev/shm/codetap)
    #[arg(long)]
    socket_dir: Option<PathBuf>,
}

pub async fn execute(args: ListArgs) -> Result<()> {
    let socket_dir = platform::resolve_socket_dir(args.socket_dir.as_deref());
    let service = super::build_service(socket_dir)?;

    let entries = service.list().await?;
    if entries.is_empty() {
        println!("No sessions found.");
        return Ok(());
    }

    print!("{}", render_table(&entries));
    Ok(())
}

/// Render the session table with columns sized to their contents.
fn render_table(entries: &[SessionEntry]) -> String {
    let headers = ["NAME", "COMMIT", "FOLDER", "PID", "STATUS", "STARTED"];

    let rows: Vec<[String; 6]> = entries
        .iter()
        .map(|entry| match &entry.info {
            Some(info) => [
                entry.name.clone(),
                short_commit(&info.commit),
                info.folder.clone(),
                info.pid.to_string(),
                "alive".to_string(),
                info.started_at_time()
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ],
            None => [
                entry.name.clone(),
                "-".to_string(),
                "-".to_string(),
                "0".to_string(),
                "dead".to_string(),
                "-".to_string(),
            ],
        })
        .collect();

    let mut widths = headers.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = String::new();
    let render_row = |out: &mut String, cells: &[&str]| {
        for (i, (cell, width)) in cells.iter().zip(widths.iter().copied()).enumerate() {
            if i + 1 == cells.len() {
                out.push_str(cell);
            } else {
                out.push_str(&format!("{cell:<width$}  "));
            }
        }
        out.push('\n');
    };

    render_row(&mut out, &headers);
    for row in &rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        render_row(&mut out, &cells);
    }
    out
}

fn short_commit(commit: &str) -> String {
    if commit.len() > 12 {
        commit[..12].to_string()
    } else if commit.is_empty() {
        "-".to_string()
    } else {
        commit.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codetap_core::control::SessionInfo;

    #[test]
    fn table_shows_alive_and_dead_rows() {
        let entries = vec![
            SessionEntry {
                name: "dev".to_string(),
                socket_path: PathBuf::from("/tmp/dev.sock"),
                info: Some(SessionInfo {
                    name: "dev".to_string(),
                    commit: "0123456789abcdef0123456789abcdef01234567".to_string(),
                    arch: "x64".to_string(),
                    folder: "/workspace".to_string(),
                    pid: 42,
                    started_at: "2026-08-02T10:15:00Z".to_string(),
                }),
            },
            SessionEntry {
                name: "stale".to_string(),
                socket_path: PathBuf::from("/tmp/stale.sock"),
                info: None,
            },
        ];

        let table = render_table(&entries);
        assert!(table.contains("NAME"));
        assert!(table.contains("0123456789ab"));
        assert!(!table.contains("0123456789abc"));
        assert!(table.contains("alive"));
        assert!(table.contains("dead"));
        assert!(table.contains("/workspace"));
    }
}
