// Rejects lint-suppression attributes ("#[" + "allow" ...) anywhere in the workspace's crates.
// Suppressions must be `#[expect]` with a reason so they fail once they become stale.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CRATE_DIRS: [&str; 5] = [
    "eventlog",
    "eventlog-types",
    "eventlog-memory",
    "eventlog-postgres",
    "eventlog-testing",
];
const SOURCE_DIRS: [&str; 3] = ["src", "tests", "benches"];

fn main() {
    if env::var("CHECK_NO_ALLOW").is_ok_and(|value| value == "0") {
        return;
    }

    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").expect("manifest dir"));
    let workspace_root = manifest_dir.parent().unwrap_or(&manifest_dir).to_path_buf();

    let mut violations = Vec::new();
    for crate_dir in CRATE_DIRS {
        for source_dir in SOURCE_DIRS {
            let path = workspace_root.join(crate_dir).join(source_dir);
            if path.exists() {
                println!("cargo:rerun-if-changed={}", path.display());
                collect_violations(&path, &mut violations);
            }
        }
    }

    if violations.is_empty() {
        return;
    }

    eprintln!("ERROR: lint suppression attributes found in the eventlog workspace:");
    for (file, line, content) in &violations {
        eprintln!("  {}:{}: {}", file.display(), line, content.trim());
    }
    panic!("use #[expect(..., reason = \"...\")] instead of allow attributes");
}

fn collect_violations(path: &Path, violations: &mut Vec<(PathBuf, usize, String)>) {
    if path.is_dir() {
        let entries = fs::read_dir(path).expect("readable source directory");
        for entry in entries {
            collect_violations(&entry.expect("directory entry").path(), violations);
        }
        return;
    }

    if path.extension().map_or(true, |ext| ext != "rs") {
        return;
    }

    let Ok(content) = fs::read_to_string(path) else {
        return;
    };
    for (index, line) in content.lines().enumerate() {
        if line.contains("#[allow") || line.contains("#![allow") {
            violations.push((path.to_path_buf(), index + 1, line.to_owned()));
        }
    }
}
