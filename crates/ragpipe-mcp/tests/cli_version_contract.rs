#[test]
fn ragpipe_version_contract() {
    let bin = assert_cmd::cargo::cargo_bin!("ragpipe");
    let out = std::process::Command::new(bin)
        .args(["version"])
        .output()
        .expect("run ragpipe version");

    assert!(out.status.success(), "ragpipe version failed");
    let s = String::from_utf8_lossy(&out.stdout);
    let v: serde_json::Value = serde_json::from_str(&s).expect("parse version json");

    assert_eq!(v["schema_version"].as_u64(), Some(1));
    assert_eq!(v["kind"].as_str(), Some("version"));
    assert_eq!(v["ok"].as_bool(), Some(true));
    assert_eq!(v["name"].as_str(), Some("ragpipe"));
    assert!(!v["version"].as_str().unwrap_or("").is_empty());
}

#[test]
fn ragpipe_version_text_output_contract() {
    use assert_cmd::prelude::*;
    use predicates::prelude::*;

    let mut cmd = std::process::Command::new(assert_cmd::cargo::cargo_bin!("ragpipe"));
    cmd.args(["version", "--output", "text"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::starts_with("ragpipe "));
}

#[test]
fn ragpipe_search_without_provider_is_not_configured() {
    // No provider vars at all: the envelope must say so instead of hanging
    // or printing a bare error.
    let bin = assert_cmd::cargo::cargo_bin!("ragpipe");
    let out = std::process::Command::new(bin)
        .args([
            "search",
            "--question",
            "how do i prevent rabies?",
            "--domains",
            "cdc.gov",
            "--direct",
        ])
        .env_remove("RAGPIPE_ENV_FILE")
        .env_remove("RAGPIPE_SEARCH_PROVIDER")
        .env_remove("RAGPIPE_SERPER_API_KEY")
        .env_remove("SERPER_API_KEY")
        .env_remove("RAGPIPE_SERPER_ENDPOINT")
        .env_remove("RAGPIPE_SEARXNG_ENDPOINT")
        .env_remove("RAGPIPE_SEARXNG_ENDPOINTS")
        .output()
        .expect("run ragpipe search");

    assert!(!out.status.success(), "expected non-zero exit");
    let v: serde_json::Value =
        serde_json::from_str(&String::from_utf8_lossy(&out.stdout)).expect("parse envelope");
    assert_eq!(v["ok"].as_bool(), Some(false));
    assert_eq!(v["kind"].as_str(), Some("search"));
    assert_eq!(v["error"]["code"].as_str(), Some("not_configured"));
    assert_eq!(v["error"]["retryable"].as_bool(), Some(false));
    assert!(!v["error"]["hint"].as_str().unwrap_or("").is_empty());
}

#[test]
fn ragpipe_env_file_supplies_provider_config() {
    // The loader fills only vars absent from the process env, so the child is
    // started with every provider var scrubbed and RAGPIPE_ENV_FILE pointing
    // at a file that carries the whole configuration.
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    rt.block_on(async {
        use axum::{routing::post, Router};

        let app = Router::new().route(
            "/search",
            post(|| async {
                axum::Json(serde_json::json!({
                    "organic": [
                        {"link": "https://www.cdc.gov/measles/vaccine.html",
                         "title": "Measles Vaccination", "snippet": "Two doses."}
                    ]
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("axum serve");
        });

        let dir = tempfile::tempdir()?;
        let env_path = dir.path().join("ragpipe.env");
        std::fs::write(
            &env_path,
            format!(
                "# test credentials\n\
                 RAGPIPE_SERPER_API_KEY=from-env-file\n\
                 RAGPIPE_SERPER_ENDPOINT=http://{addr}/search\n"
            ),
        )?;

        let bin = assert_cmd::cargo::cargo_bin!("ragpipe");
        let out = std::process::Command::new(bin)
            .args([
                "search",
                "--question",
                "is the measles vaccine safe?",
                "--domains",
                "cdc.gov",
                "--direct",
            ])
            .env("RAGPIPE_ENV_FILE", &env_path)
            .env_remove("RAGPIPE_SEARCH_PROVIDER")
            .env_remove("RAGPIPE_SERPER_API_KEY")
            .env_remove("SERPER_API_KEY")
            .env_remove("RAGPIPE_SERPER_ENDPOINT")
            .env_remove("RAGPIPE_SEARXNG_ENDPOINT")
            .env_remove("RAGPIPE_SEARXNG_ENDPOINTS")
            .output()?;

        assert!(
            out.status.success(),
            "search via env file failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        let v: serde_json::Value = serde_json::from_str(&String::from_utf8_lossy(&out.stdout))?;
        assert_eq!(v["ok"].as_bool(), Some(true));
        assert_eq!(v["kind"].as_str(), Some("search"));
        assert_eq!(v["count"].as_u64(), Some(1));
        assert_eq!(
            v["urls"][0].as_str(),
            Some("https://www.cdc.gov/measles/vaccine.html")
        );
        Ok::<(), Box<dyn std::error::Error>>(())
    })
    .expect("env file contract");
}
