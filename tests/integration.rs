mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use common::{sample_pdf, spawn_fake_ollama, CONTEXT_ANSWER};

fn rag_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_rag"))
}

/// Config with disabled providers, or Ollama providers at `ollama_url`.
fn setup_test_env(ollama_url: Option<&str>) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("documents")).unwrap();

    let providers = match ollama_url {
        Some(url) => format!(
            r#"
[embedding]
provider = "ollama"
model = "fake-embed"
dims = 3
url = "{url}"
max_retries = 0

[llm]
provider = "ollama"
model = "fake-llm"
url = "{url}"
"#
        ),
        None => String::new(),
    };

    let config_content = format!(
        r#"[db]
path = "{root}/data/rag.sqlite"

[documents]
root = "{root}/documents"

[queries]
default_user = "alice"
{providers}"#,
        root = root.display(),
        providers = providers,
    );

    let config_path = config_dir.join("rag.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_rag(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = rag_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run rag binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn add_document(config_path: &Path, user: &str, name: &str, pages: &[&str]) {
    let dir = config_path
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("documents")
        .join(user);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(name), sample_pdf(pages)).unwrap();
}

/// Value of a `  key: N` line in an ingest report.
fn report_value(stdout: &str, key: &str) -> usize {
    let prefix = format!("{}: ", key);
    stdout
        .lines()
        .find_map(|l| l.trim().strip_prefix(&prefix))
        .unwrap_or_else(|| panic!("no '{}' in output:\n{}", key, stdout))
        .parse()
        .unwrap()
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config) = setup_test_env(None);

    let (stdout, stderr, ok) = run_rag(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized"));

    let (_, stderr, ok) = run_rag(&config, &["init"]);
    assert!(ok, "second init failed: {}", stderr);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, ok) = run_rag(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!ok);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_documents_empty_and_listed() {
    let (_tmp, config) = setup_test_env(None);

    let (stdout, _, ok) = run_rag(&config, &["documents"]);
    assert!(ok);
    assert!(stdout.contains("No documents for alice"));

    add_document(&config, "alice", "handbook.pdf", &["Rust ownership"]);
    let (stdout, _, ok) = run_rag(&config, &["documents", "--user", "alice"]);
    assert!(ok);
    assert!(stdout.contains("handbook.pdf"));
}

#[test]
fn test_invalid_user_rejected() {
    let (_tmp, config) = setup_test_env(None);
    let (_, stderr, ok) = run_rag(&config, &["documents", "--user", "../etc"]);
    assert!(!ok);
    assert!(stderr.contains("invalid user id"));
}

#[test]
fn test_ask_too_long_rejected() {
    let (_tmp, config) = setup_test_env(None);
    run_rag(&config, &["init"]);

    let question = "x".repeat(2001);
    let (_, stderr, ok) = run_rag(&config, &["ask", &question]);
    assert!(!ok);
    assert!(stderr.contains("the limit is 2000"));

    let (stdout, _, ok) = run_rag(&config, &["queries", "list"]);
    assert!(ok);
    assert!(stdout.contains("No queries for alice"));
}

#[test]
fn test_get_unknown_query_fails() {
    let (_tmp, config) = setup_test_env(None);
    run_rag(&config, &["init"]);
    let (_, stderr, ok) = run_rag(&config, &["queries", "get", "missing"]);
    assert!(!ok);
    assert!(stderr.contains("query not found"));
}

#[test]
fn test_ingest_empty_directory() {
    let (_tmp, config) = setup_test_env(None);
    let (stdout, stderr, ok) = run_rag(&config, &["ingest"]);
    assert!(ok, "ingest failed: {}", stderr);
    assert_eq!(report_value(&stdout, "documents"), 0);
    assert_eq!(report_value(&stdout, "added"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ingest_twice_then_ask() {
    let url = spawn_fake_ollama().await;
    let (_tmp, config) = setup_test_env(Some(&url));
    add_document(
        &config,
        "alice",
        "handbook.pdf",
        &[
            "Rust ownership means every value has exactly one owner.",
            "Pasta should be cooked in salted boiling water.",
        ],
    );

    let (stdout, stderr, ok) = run_rag(&config, &["ingest"]);
    assert!(ok, "first ingest failed: {}", stderr);
    assert_eq!(report_value(&stdout, "pages"), 2);
    let first_added = report_value(&stdout, "added");
    assert!(first_added > 0);

    let (stdout, stderr, ok) = run_rag(&config, &["ingest"]);
    assert!(ok, "second ingest failed: {}", stderr);
    assert_eq!(report_value(&stdout, "added"), 0);
    assert_eq!(report_value(&stdout, "skipped"), first_added);

    let (stdout, stderr, ok) = run_rag(&config, &["ingest", "--reset"]);
    assert!(ok, "reset ingest failed: {}", stderr);
    assert_eq!(report_value(&stdout, "cleared"), first_added);
    assert_eq!(report_value(&stdout, "added"), first_added);

    let (stdout, stderr, ok) = run_rag(&config, &["ask", "Explain Rust ownership"]);
    assert!(ok, "ask failed: {}", stderr);
    assert!(stdout.contains(CONTEXT_ANSWER));
    assert!(stdout.contains("handbook.pdf (page 1)"));
    assert!(!stdout.contains("(page 2)"));

    let (stdout, _, ok) = run_rag(&config, &["queries", "list"]);
    assert!(ok);
    assert!(stdout.contains("[done]"));
    assert!(stdout.contains("Explain Rust ownership"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unrelated_question_gets_no_match() {
    let url = spawn_fake_ollama().await;
    let (_tmp, config) = setup_test_env(Some(&url));
    add_document(&config, "alice", "handbook.pdf", &["Rust ownership rules."]);

    let (_, stderr, ok) = run_rag(&config, &["ingest"]);
    assert!(ok, "ingest failed: {}", stderr);

    let (stdout, stderr, ok) = run_rag(&config, &["ask", "How long to cook pasta?"]);
    assert!(ok, "ask failed: {}", stderr);
    assert!(stdout.contains("Unable to find matching results."));
    assert!(!stdout.contains("sources:"));
}
