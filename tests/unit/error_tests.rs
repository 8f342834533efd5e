//! Unit tests for `AppError` display and retry classification.

use agent_relay::AppError;

#[test]
fn display_prefixes_the_category() {
    assert_eq!(
        AppError::Config("bad kind".into()).to_string(),
        "config: bad kind"
    );
    assert_eq!(
        AppError::Timeout("initialize not answered".into()).to_string(),
        "timeout: initialize not answered"
    );
    assert_eq!(
        AppError::Rpc {
            code: -32000,
            message: "boom".into()
        }
        .to_string(),
        "rpc: boom (code -32000)"
    );
}

#[test]
fn exit_display_includes_code_and_hint() {
    let err = AppError::Exited {
        backend: "claude-code".into(),
        code: Some(1),
        hint: Some("ANTHROPIC_API_KEY is not set".into()),
    };
    assert_eq!(
        err.to_string(),
        "exited: claude-code agent exited with code 1 (ANTHROPIC_API_KEY is not set)"
    );

    let killed = AppError::Exited {
        backend: "opencode".into(),
        code: None,
        hint: None,
    };
    assert_eq!(
        killed.to_string(),
        "exited: opencode agent terminated by signal"
    );
}

#[test]
fn transport_failures_are_retryable() {
    let retryable = [
        AppError::Launch("enoent".into()),
        AppError::NotConnected("gone".into()),
        AppError::Send("writer closed".into()),
        AppError::Exited {
            backend: "custom".into(),
            code: Some(2),
            hint: None,
        },
    ];
    for err in retryable {
        assert!(err.is_retryable(), "{err} must be retryable");
    }
}

#[test]
fn protocol_level_failures_are_not_retryable() {
    let fatal = [
        AppError::Config("x".into()),
        AppError::Handshake("x".into()),
        AppError::Timeout("x".into()),
        AppError::Protocol("x".into()),
        AppError::Rpc {
            code: -32603,
            message: "x".into(),
        },
        AppError::Shutdown("x".into()),
    ];
    for err in fatal {
        assert!(!err.is_retryable(), "{err} must not be retryable");
    }
}

#[test]
fn method_not_found_is_recognised_by_code() {
    assert!(AppError::Rpc {
        code: -32601,
        message: "whatever".into()
    }
    .is_method_not_found());
    assert!(!AppError::Rpc {
        code: -32602,
        message: "Method not found".into()
    }
    .is_method_not_found());
    assert!(!AppError::NotFound("method".into()).is_method_not_found());
}

#[test]
fn io_errors_convert_to_io_variant() {
    let err: AppError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed").into();
    assert_eq!(err, AppError::Io("pipe closed".into()));
}
