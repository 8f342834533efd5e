//! Unit tests for backend launch command construction.

use std::path::PathBuf;

use agent_relay::acp::spawner::{build_launch_spec, BackendKind, LaunchSpec};
use agent_relay::config::{BackendConfig, CommandOverride};
use agent_relay::AppError;

fn backend(kind: &str, command: Option<CommandOverride>) -> BackendConfig {
    BackendConfig {
        kind: kind.to_owned(),
        command,
        cwd: PathBuf::from("."),
    }
}

fn argv(parts: &[&str]) -> Option<CommandOverride> {
    Some(CommandOverride::Argv(
        parts.iter().map(|p| (*p).to_owned()).collect(),
    ))
}

#[test]
fn claude_code_uses_the_fixed_npx_launcher() {
    let spec = build_launch_spec(&backend("claude-code", None)).expect("spec");

    assert_eq!(spec.backend, BackendKind::ClaudeCode);
    assert_eq!(spec.program, "npx");
    assert_eq!(spec.args, vec!["-y", "@zed-industries/claude-code-acp"]);
    assert_eq!(spec.credential_env, Some("ANTHROPIC_API_KEY"));
}

#[test]
fn claude_code_rejects_a_command_override() {
    let err = build_launch_spec(&backend(
        "claude-code",
        Some(CommandOverride::Path("/usr/bin/claude".into())),
    ))
    .expect_err("override must be refused");

    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
}

#[test]
fn opencode_defaults_to_the_opencode_binary() {
    let spec = build_launch_spec(&backend("opencode", None)).expect("spec");

    assert_eq!(spec.program, "opencode");
    assert_eq!(spec.args, vec!["acp"]);
    assert_eq!(spec.credential_env, None);
}

#[test]
fn string_override_appends_the_acp_argument() {
    let spec = build_launch_spec(&backend(
        "opencode",
        Some(CommandOverride::Path("/opt/opencode/bin/opencode".into())),
    ))
    .expect("spec");

    assert_eq!(spec.program, "/opt/opencode/bin/opencode");
    assert_eq!(spec.args, vec!["acp"]);
}

#[test]
fn array_override_is_used_verbatim() {
    let spec = build_launch_spec(&backend(
        "opencode",
        argv(&["bunx", "opencode-ai", "acp", "--port", "0"]),
    ))
    .expect("spec");

    assert_eq!(spec.program, "bunx");
    assert_eq!(spec.args, vec!["opencode-ai", "acp", "--port", "0"]);
}

#[test]
fn custom_backend_requires_a_command() {
    let err = build_launch_spec(&backend("custom", None)).expect_err("missing command");
    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
}

#[test]
fn custom_backend_runs_the_given_argv() {
    let spec = build_launch_spec(&backend("custom", argv(&["my-agent", "--stdio"]))).expect("spec");

    assert_eq!(spec.backend, BackendKind::Custom);
    assert_eq!(spec.program, "my-agent");
    assert_eq!(spec.args, vec!["--stdio"]);
}

#[test]
fn empty_argv_is_rejected() {
    let err = build_launch_spec(&backend("custom", argv(&[]))).expect_err("empty argv");
    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
}

#[test]
fn blank_path_override_is_rejected() {
    let err = build_launch_spec(&backend(
        "opencode",
        Some(CommandOverride::Path("  ".into())),
    ))
    .expect_err("blank path");
    assert!(matches!(err, AppError::Config(_)), "got {err:?}");
}

#[test]
fn unknown_backend_kind_is_a_config_error() {
    let err = build_launch_spec(&backend("gemini", None)).expect_err("unknown kind");

    let AppError::Config(message) = err else {
        panic!("expected a config error");
    };
    assert!(message.contains("gemini"), "message must name the kind: {message}");
}

// ── Credential hint ──────────────────────────────────────────────────────────

fn spec_with_credential(var: &'static str) -> LaunchSpec {
    LaunchSpec {
        backend: BackendKind::ClaudeCode,
        program: "npx".into(),
        args: Vec::new(),
        credential_env: Some(var),
    }
}

#[test]
#[serial_test::serial]
#[allow(unsafe_code)]
fn missing_credential_produces_a_hint() {
    unsafe {
        std::env::remove_var("AGENT_RELAY_TEST_CREDENTIAL");
    }

    let hint = spec_with_credential("AGENT_RELAY_TEST_CREDENTIAL")
        .credential_hint()
        .expect("hint for a missing variable");

    assert!(hint.contains("AGENT_RELAY_TEST_CREDENTIAL"), "hint: {hint}");
}

#[test]
#[serial_test::serial]
#[allow(unsafe_code)]
fn present_credential_produces_no_hint() {
    unsafe {
        std::env::set_var("AGENT_RELAY_TEST_CREDENTIAL", "sk-test");
    }

    let hint = spec_with_credential("AGENT_RELAY_TEST_CREDENTIAL").credential_hint();

    unsafe {
        std::env::remove_var("AGENT_RELAY_TEST_CREDENTIAL");
    }
    assert_eq!(hint, None);
}

#[test]
fn backend_without_credential_never_hints() {
    let spec = build_launch_spec(&backend("opencode", None)).expect("spec");
    assert_eq!(spec.credential_hint(), None);
}
