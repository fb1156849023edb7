use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn harvest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("harvest");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // Source metadata files
    let source_dir = root.join("source");
    fs::create_dir_all(source_dir.join("nested")).unwrap();
    fs::write(
        source_dir.join("rivers.xml"),
        r#"<?xml version="1.0"?><metadata><title>Rivers</title></metadata>"#,
    )
    .unwrap();
    fs::write(
        source_dir.join("nested").join("roads.xml"),
        r#"<?xml version="1.0"?><metadata><title>Roads</title></metadata>"#,
    )
    .unwrap();
    fs::write(source_dir.join("notes.txt"), "not metadata").unwrap();

    let config_content = format!(
        r#"[http]
timeout_secs = 10

[history]
backend = "sqlite"
path = "{}/data/history.sqlite"

[logging]
level = "warn"
"#,
        root.display()
    );

    let config_path = config_dir.join("harvest.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_harvest(config_path: Option<&Path>, args: &[&str]) -> (String, String, bool) {
    let binary = harvest_binary();
    let mut command = Command::new(&binary);
    if let Some(config_path) = config_path {
        command.arg("--config").arg(config_path.to_str().unwrap());
    }
    let output = command
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run harvest binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn unc_to_folder_task(root: &Path) -> String {
    serde_json::json!({
        "source": {
            "type": "UNC",
            "properties": {
                "unc-root-folder": root.join("source").to_string_lossy(),
                "unc-pattern": "*.xml"
            }
        },
        "destinations": [
            {
                "action": {
                    "type": "FOLDER",
                    "properties": {
                        "folder-root-folder": root.join("out").to_string_lossy()
                    }
                }
            }
        ]
    })
    .to_string()
}

fn files_under(dir: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

#[test]
fn test_version() {
    let (stdout, _, success) = run_harvest(None, &["-v"]);
    assert!(success);
    assert_eq!(
        stdout.trim(),
        format!("Version: {}", env!("CARGO_PKG_VERSION"))
    );
}

#[test]
fn test_no_arguments_prints_help() {
    let (stdout, _, success) = run_harvest(None, &[]);
    assert!(success);
    assert!(stdout.starts_with("Harvest ver. "));
    assert!(stdout.contains("--file"));
    assert!(stdout.contains("--task"));
}

#[test]
fn test_list_templates() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_harvest(Some(&config_path), &["--list"]);
    assert!(success, "list failed: stdout={}, stderr={}", stdout, stderr);
    for section in ["[inbound]", "[outbound]", "[filters]", "[transformers]", "[triggers]"] {
        assert!(stdout.contains(section), "missing {} in: {}", section, stdout);
    }
    for entity_type in ["UNC", "WAF", "FOLDER", "GPT", "CONSOLE", "REGEX", "DC", "PERIOD"] {
        assert!(stdout.contains(entity_type), "missing {} in: {}", entity_type, stdout);
    }
}

#[test]
fn test_inline_task_unc_to_folder() {
    let (tmp, config_path) = setup_test_env();
    let task = unc_to_folder_task(tmp.path());

    let (stdout, stderr, success) = run_harvest(Some(&config_path), &["-t", &task]);
    assert!(success, "run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(
        stdout.contains("Acquired: 2, published: 2, failed: 0"),
        "unexpected summary: {}",
        stdout
    );

    let written = files_under(&tmp.path().join("out"));
    assert_eq!(written.len(), 2, "written: {:?}", written);
    assert!(written.iter().all(|p| p.extension().is_some_and(|e| e == "xml")));
    assert!(written.iter().any(|p| p.ends_with("nested/roads.xml")));
}

#[test]
fn test_task_file_rerun_overwrites() {
    let (tmp, config_path) = setup_test_env();
    let task_path = tmp.path().join("task.json");
    fs::write(&task_path, unc_to_folder_task(tmp.path())).unwrap();

    let (stdout1, _, success1) =
        run_harvest(Some(&config_path), &["-f", task_path.to_str().unwrap()]);
    assert!(success1);
    assert!(stdout1.contains("published: 2"));

    // Second run updates the same files instead of adding new ones
    let (stdout2, _, success2) =
        run_harvest(Some(&config_path), &["-f", task_path.to_str().unwrap()]);
    assert!(success2);
    assert!(stdout2.contains("published: 2"));
    assert_eq!(files_under(&tmp.path().join("out")).len(), 2);
}

#[test]
fn test_invalid_task_json_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_harvest(Some(&config_path), &["-t", "{not json"]);
    assert!(!success);
    assert!(stderr.contains("Failed to parse task definition"), "stderr: {}", stderr);
}

#[test]
fn test_unknown_source_type_fails() {
    let (_tmp, config_path) = setup_test_env();
    let task = r#"{"source": {"type": "NOPE"}, "destinations": []}"#;

    let (_, stderr, success) = run_harvest(Some(&config_path), &["-t", task]);
    assert!(!success);
    assert!(stderr.contains("Invalid task definition"), "stderr: {}", stderr);
}

#[test]
fn test_missing_task_file_fails() {
    let (tmp, config_path) = setup_test_env();
    let missing = tmp.path().join("missing.json");

    let (_, stderr, success) =
        run_harvest(Some(&config_path), &["-f", missing.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("Failed to read task file"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_config_fails() {
    let (tmp, _) = setup_test_env();
    let bad_config = tmp.path().join("config").join("bad.toml");
    fs::write(&bad_config, "[http]\ntimeout_secs = 0\n").unwrap();

    let (_, stderr, success) = run_harvest(Some(&bad_config), &["--list"]);
    assert!(!success);
    assert!(stderr.contains("timeout_secs"), "stderr: {}", stderr);
}
