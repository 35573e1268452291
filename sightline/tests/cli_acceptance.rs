use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
        }
    }

    fn write_config(&self, contents: &str) {
        let dir = self.xdg_config.join("sightline");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(dir.join("config.toml"), contents).expect("failed to write config");
    }

    fn local_storage_path(&self) -> PathBuf {
        self.xdg_data.join("sightline/local.json")
    }
}

fn run(env: &CliTestEnv, args: &[&str]) -> Output {
    let mut command = Command::new(assert_cmd::cargo::cargo_bin!("sightline"));

    command
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env_remove("SIGHTLINE_CLIENT_ID")
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute sightline: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    assert!(
        output.status.success(),
        "sightline {:?} failed\nstdout:\n{}\nstderr:\n{}",
        args,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn status_reports_defaults_on_fresh_profile() {
    let env = CliTestEnv::new();

    let args = ["status"];
    let output = run(&env, &args);
    assert_success(&args, &output);

    let out = stdout(&output);
    assert!(out.contains("Client ID:       <not set>"), "{out}");
    assert!(out.contains("Opted out:       no"), "{out}");
    assert!(out.contains("Anonymous ID:    <none>"), "{out}");
}

#[test]
fn opt_out_persists_across_invocations() {
    let env = CliTestEnv::new();

    let output = run(&env, &["opt-out"]);
    assert_success(&["opt-out"], &output);
    assert!(env.local_storage_path().exists());

    let output = run(&env, &["status"]);
    assert!(stdout(&output).contains("Opted out:       yes"));

    let output = run(&env, &["opt-in"]);
    assert_success(&["opt-in"], &output);
    let output = run(&env, &["status"]);
    assert!(stdout(&output).contains("Opted out:       no"));
}

#[test]
fn reset_mints_identity_visible_in_status() {
    let env = CliTestEnv::new();

    let output = run(&env, &["reset"]);
    assert_success(&["reset"], &output);
    let out = stdout(&output);
    let anon = out
        .lines()
        .find_map(|line| line.strip_prefix("Anonymous ID:"))
        .map(str::trim)
        .expect("reset prints the new anonymous id")
        .to_string();
    assert!(anon.starts_with("anon_"), "{anon}");

    let output = run(&env, &["status"]);
    assert!(stdout(&output).contains(&anon));
}

#[test]
fn track_without_client_id_fails() {
    let env = CliTestEnv::new();

    let output = run(&env, &["track", "signup"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("clientId"));
}

#[test]
fn track_when_opted_out_sends_nothing() {
    let env = CliTestEnv::new();
    // Unroutable collector: any request would surface as a failure or delay.
    env.write_config(
        r#"
[tracker]
clientId = "site-cli"
apiUrl = "http://127.0.0.1:9"
"#,
    );

    assert_success(&["opt-out"], &run(&env, &["opt-out"]));
    let args = ["track", "signup", "--timeout", "1"];
    let output = run(&env, &args);
    assert_success(&args, &output);
    assert!(stdout(&output).contains("suppressed"), "{}", stdout(&output));
}

#[tokio::test(flavor = "multi_thread")]
async fn track_delivers_event_to_collector() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(query_param("client_id", "site-cli"))
        .and(body_string_contains("\"name\":\"signup\""))
        .and(body_string_contains("\"plan\":\"pro\""))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let env = CliTestEnv::new();
    env.write_config(&format!(
        r#"
[tracker]
clientId = "site-cli"
apiUrl = "{}"
enableBatching = false
"#,
        server.uri()
    ));

    let args = ["track", "signup", "-p", "plan=pro", "--timeout", "5"];
    let output = tokio::task::spawn_blocking({
        let env_args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        move || {
            let refs: Vec<&str> = env_args.iter().map(String::as_str).collect();
            let output = run(&env, &refs);
            (env, output)
        }
    })
    .await
    .expect("cli task panicked");
    let (_env, output) = output;

    assert_success(&args, &output);
    assert!(stdout(&output).contains("Tracked \"signup\""));
    server.verify().await;
}
