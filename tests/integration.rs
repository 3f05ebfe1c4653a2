use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn docgraph_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("docgraph");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha document about Rust programming.\n\nIt covers cargo and crates.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nThis document discusses Python and machine learning.\n\nPyTorch is covered.",
    )
    .unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma plain text file.\n\nNotes about deployment and infrastructure.\n\nKubernetes and Docker are mentioned here.",
    )
    .unwrap();
    fs::write(files_dir.join("ignored.csv"), "a,b,c").unwrap();

    let config_content = format!(
        r#"[storage]
indices_dir = "{root}/data/indices"
collections_dir = "{root}/data/collections"
uploads_dir = "{root}/data/uploads"

[chunking]
chunk_size = 200
overlap = 20

[routing]
strategy = "keyword"

[server]
bind = "127.0.0.1:7341"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("docgraph.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docgraph(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = docgraph_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docgraph binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn files_dir(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().join("files")
}

#[test]
fn test_init_writes_config_when_missing() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("nested").join("docgraph.toml");

    // The starter config uses relative storage paths.
    let output = Command::new(docgraph_binary())
        .current_dir(tmp.path())
        .arg("--config")
        .arg(&config_path)
        .arg("init")
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "init failed: {}", String::from_utf8_lossy(&output.stderr));
    assert!(config_path.exists());
    assert!(stdout.contains("Storage initialized"));
    assert!(tmp.path().join("data").join("indices").is_dir());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();
    let before = fs::read_to_string(&config_path).unwrap();

    let (_, _, success1) = run_docgraph(&config_path, &["init"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_docgraph(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");

    assert_eq!(fs::read_to_string(&config_path).unwrap(), before);
}

#[test]
fn test_index_directory_creates_collection() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);

    let (stdout, stderr, success) = run_docgraph(
        &config_path,
        &[
            "index",
            files.to_str().unwrap(),
            "--collection",
            "notes",
            "--progress",
            "json",
        ],
    );
    assert!(success, "index failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Indexed 3 of 3"));
    assert!(stderr.contains("\"phase\":\"saved\""));

    let (stdout, _, success) = run_docgraph(&config_path, &["collections"]);
    assert!(success);
    assert_eq!(stdout.trim(), "notes");
}

#[test]
fn test_index_unsupported_file_fails_without_collection() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);

    let (_, stderr, success) = run_docgraph(
        &config_path,
        &[
            "index",
            files.join("alpha.md").to_str().unwrap(),
            files.join("ignored.csv").to_str().unwrap(),
            "--collection",
            "broken",
            "--progress",
            "off",
        ],
    );
    assert!(!success);
    assert!(stderr.contains("ignored.csv"));

    let (stdout, _, _) = run_docgraph(&config_path, &["collections"]);
    assert!(stdout.trim().is_empty());
}

#[test]
fn test_index_rejects_bad_chunking() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);

    let (_, stderr, success) = run_docgraph(
        &config_path,
        &[
            "index",
            files.to_str().unwrap(),
            "--collection",
            "notes",
            "--chunk-size",
            "50",
            "--overlap",
            "50",
        ],
    );
    assert!(!success);
    assert!(stderr.contains("invalid chunking"));
}

#[test]
fn test_ask_answers_from_collection() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);
    run_docgraph(
        &config_path,
        &["index", files.to_str().unwrap(), "--collection", "notes"],
    );

    let (stdout, stderr, success) = run_docgraph(
        &config_path,
        &[
            "ask",
            "--collection",
            "notes",
            "which notes mention kubernetes and docker?",
        ],
    );
    assert!(success, "ask failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Kubernetes"));
}

#[test]
fn test_ask_missing_collection() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_docgraph(
        &config_path,
        &["ask", "--collection", "ghost", "anything?"],
    );
    assert!(!success);
    assert!(stderr.contains("collection not found: ghost"));
}

#[test]
fn test_completions() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, _, success) = run_docgraph(&config_path, &["completions", "bash"]);
    assert!(success);
    assert!(stdout.contains("docgraph"));
}
