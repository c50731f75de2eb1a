use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn bulk_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("bulk");
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
        files_dir.join("users.csv"),
        "id,email,name,role,active\n\
         u1,ada@example.com,Ada,admin,true\n\
         u2,rex@example.com,Rex,reader,false\n\
         u3,,Nobody,reader,true\n",
    )
    .unwrap();
    fs::write(
        files_dir.join("articles.ndjson"),
        "{\"id\":\"a1\",\"slug\":\"first-post\",\"title\":\"First\",\"body\":\"Hello\",\"author_id\":\"u1\",\"status\":\"published\",\"tags\":\"intro, news\"}\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{0}/data/bulk.sqlite"

[import]
batch_size = 2
uploads_dir = "{0}/data/uploads"

[export]
output_dir = "{0}/data/exports"

[server]
bind = "127.0.0.1:7341"

[log]
level = "warn"
"#,
        root.display()
    );

    let config_path = config_dir.join("bulk.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_bulk(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = bulk_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run bulk binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn files(config_path: &Path, name: &str) -> String {
    config_path
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("files")
        .join(name)
        .display()
        .to_string()
}

fn import_users(config_path: &Path, key: &str) -> serde_json::Value {
    let source = files(config_path, "users.csv");
    let (stdout, stderr, success) = run_bulk(
        config_path,
        &["import", &source, "--resource", "users", "--key", key, "--progress", "off"],
    );
    assert!(success, "import failed: stdout={}, stderr={}", stdout, stderr);
    serde_json::from_str(&stdout).unwrap()
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_bulk(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_bulk(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_bulk(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_import_reports_counts() {
    let (_tmp, config_path) = setup_test_env();
    run_bulk(&config_path, &["init"]);

    let job = import_users(&config_path, "users-1");
    assert_eq!(job["status"], "completed");
    assert_eq!(job["total_records"], 3);
    assert_eq!(job["success_count"], 2);
    assert_eq!(job["fail_count"], 1);
}

#[test]
fn test_import_same_key_replays() {
    let (_tmp, config_path) = setup_test_env();
    run_bulk(&config_path, &["init"]);

    let first = import_users(&config_path, "users-1");
    let second = import_users(&config_path, "users-1");
    assert_eq!(first["id"], second["id"]);

    let (stdout, _, success) = run_bulk(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Users:"));
    assert!(stdout.contains("completed"));
}

#[test]
fn test_import_missing_file_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_bulk(&config_path, &["init"]);

    let (stdout, _, success) = run_bulk(
        &config_path,
        &["import", "/nonexistent/users.csv", "--resource", "users", "--key", "missing"],
    );
    assert!(!success);
    let job: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(job["status"], "failed");
}

#[test]
fn test_unknown_resource_rejected() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, success) = run_bulk(
        &config_path,
        &["import", "x.csv", "--resource", "posts", "--key", "k"],
    );
    assert!(!success);
    assert!(stderr.contains("unknown resource"));
}

#[test]
fn test_export_streams_to_stdout() {
    let (_tmp, config_path) = setup_test_env();
    run_bulk(&config_path, &["init"]);
    import_users(&config_path, "users-1");

    let (stdout, stderr, success) = run_bulk(
        &config_path,
        &["export", "--resource", "users", "--format", "csv"],
    );
    assert!(success, "export failed: {}", stderr);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines[0], "id,email,name,role,active,created_at,updated_at");
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with("u1,ada@example.com,Ada,admin,true,"));
}

#[test]
fn test_article_tags_roundtrip_as_array() {
    let (_tmp, config_path) = setup_test_env();
    run_bulk(&config_path, &["init"]);
    import_users(&config_path, "users-1");

    let source = files(&config_path, "articles.ndjson");
    let (_, stderr, success) = run_bulk(
        &config_path,
        &["import", &source, "--resource", "articles", "--key", "articles-1"],
    );
    assert!(success, "article import failed: {}", stderr);

    let (stdout, _, success) = run_bulk(&config_path, &["export", "--resource", "articles"]);
    assert!(success);
    let article: serde_json::Value = serde_json::from_str(stdout.lines().next().unwrap()).unwrap();
    assert_eq!(article["tags"], serde_json::json!(["intro", "news"]));
    assert_eq!(article["slug"], "first-post");
}

#[test]
fn test_export_job_with_filter() {
    let (_tmp, config_path) = setup_test_env();
    run_bulk(&config_path, &["init"]);
    import_users(&config_path, "users-1");

    let (stdout, stderr, success) = run_bulk(
        &config_path,
        &[
            "export-job",
            "--resource",
            "users",
            "--format",
            "ndjson",
            "--key",
            "admins",
            "--filter",
            "role=admin",
            "--progress",
            "off",
        ],
    );
    assert!(success, "export-job failed: {}", stderr);
    let job: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(job["status"], "completed");
    assert_eq!(job["total_records"], 1);

    let content = fs::read_to_string(job["file_path"].as_str().unwrap()).unwrap();
    assert!(content.contains("ada@example.com"));
    assert!(!content.contains("rex@example.com"));

    let id = job["id"].as_str().unwrap();
    let (stdout, _, success) = run_bulk(&config_path, &["job", "export", id]);
    assert!(success);
    assert!(stdout.contains("admins"));
}
