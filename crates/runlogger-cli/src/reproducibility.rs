//! Facts about how a sweep was created, stored in its metadata.

use std::path::Path;
use std::process::Command;

use serde_json::{Map, Value};
use tracing::debug;

/// Command line and time, plus git root, commit URL and dirty flag when
/// run inside a git checkout.
pub fn collect(cwd: &Path) -> Map<String, Value> {
    let mut info = Map::new();
    info.insert("command_line".into(), command_line(std::env::args()).into());
    info.insert(
        "time".into(),
        chrono::Local::now().format("%c").to_string().into(),
    );

    match git_info(cwd) {
        Some(git) => info.extend(git),
        None => debug!(cwd = %cwd.display(), "not a git checkout; skipping git metadata"),
    }
    info
}

fn git_info(cwd: &Path) -> Option<Map<String, Value>> {
    let root = git(cwd, &["rev-parse", "--show-toplevel"])?;
    let mut info = Map::new();
    info.insert("git_root".into(), root.into());

    let remote = git(cwd, &["remote", "get-url", "origin"])
        .or_else(|| git(cwd, &["config", "--get", "remote.origin.url"]));
    if let (Some(remote), Some(hash)) = (remote, git(cwd, &["rev-parse", "HEAD"])) {
        info.insert("git_url".into(), format!("{}/tree/{hash}", https_url(&remote)).into());
    }
    if let Some(status) = git(cwd, &["status", "--porcelain"]) {
        info.insert("git_has_uncommitted_changes".into(), (!status.is_empty()).into());
    }
    Some(info)
}

/// Trimmed stdout of a successful git command.
fn git(cwd: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Browser URL for a remote given as https or scp-style ssh.
fn https_url(remote: &str) -> String {
    let remote = remote.trim().trim_end_matches(".git");
    match remote.strip_prefix("git@").and_then(|rest| rest.split_once(':')) {
        Some((host, path)) => format!("https://{host}/{path}"),
        None => remote.to_string(),
    }
}

fn command_line(args: impl IntoIterator<Item = String>) -> String {
    args.into_iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains(char::is_whitespace) || arg.contains('\'') {
                format!("'{}'", arg.replace('\'', r"'\''"))
            } else {
                arg
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_remotes_become_https() {
        assert_eq!(
            https_url("git@github.com:acme/trainer.git"),
            "https://github.com/acme/trainer"
        );
        assert_eq!(
            https_url("https://github.com/acme/trainer.git\n"),
            "https://github.com/acme/trainer"
        );
    }

    #[test]
    fn arguments_with_spaces_are_quoted() {
        let args = ["runlog", "create-sweep", "--name", "lr sweep"].map(String::from);
        assert_eq!(command_line(args), "runlog create-sweep --name 'lr sweep'");
    }

    #[test]
    fn outside_git_only_basics_are_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let info = collect(dir.path());
        assert!(info.contains_key("command_line"));
        assert!(info.contains_key("time"));
    }
}
