//! The `v4.channel.k8s.io` exec framing.
//!
//! Every WebSocket message is a binary frame whose first byte names the
//! stream it belongs to; the error channel carries one JSON Status object
//! when the remote process exits.

use serde::Deserialize;
use url::Url;

use crate::config::ClusterConfig;
use crate::error::ClusterError;

pub const EXEC_SUBPROTOCOL: &str = "v4.channel.k8s.io";

pub const STDIN_CHANNEL: u8 = 0;
pub const STDOUT_CHANNEL: u8 = 1;
pub const STDERR_CHANNEL: u8 = 2;
pub const ERROR_CHANNEL: u8 = 3;

/// ETX, the interrupt character. Writing it to the remote stdin is the only
/// portable way to stop a foreground process without a TTY.
pub const INTERRUPT_BYTE: u8 = 0x03;

/// Where every remote command of one mount runs.
#[derive(Debug, Clone)]
pub struct ExecTarget {
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

/// Builds the exec subresource URL with the ws/wss scheme the channel
/// dials. stdout and stderr are always requested; TTY never is.
pub fn exec_url(
    config: &ClusterConfig,
    target: &ExecTarget,
    argv: &[String],
    stdin: bool,
) -> Result<Url, ClusterError> {
    let mut url = config
        .server
        .join(&format!(
            "api/v1/namespaces/{}/pods/{}/exec",
            target.namespace, target.pod
        ))
        .map_err(|source| ClusterError::BadServer {
            url: config.server.to_string(),
            source,
        })?;

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("container", &target.container);
        for arg in argv {
            query.append_pair("command", arg);
        }
        query.append_pair("stdin", if stdin { "true" } else { "false" });
        query.append_pair("stdout", "true");
        query.append_pair("stderr", "true");
        query.append_pair("tty", "false");
    }

    let scheme = match url.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    // Infallible: http(s) and ws(s) are all "special" schemes to the parser.
    let _ = url.set_scheme(scheme);
    Ok(url)
}

/// Splits a raw frame into its channel byte and payload.
pub fn split_frame(data: &[u8]) -> Option<(u8, &[u8])> {
    data.split_first().map(|(channel, payload)| (*channel, payload))
}

/// Wraps payload bytes into a stdin frame.
pub fn stdin_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(STDIN_CHANNEL);
    frame.extend_from_slice(payload);
    frame
}

/// Result of one exec session as reported on the error channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Success,
    Failure {
        exit_code: Option<i32>,
        message: String,
    },
}

#[derive(Debug, Default, Deserialize)]
struct Status {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: StatusDetails,
}

#[derive(Debug, Default, Deserialize)]
struct StatusDetails {
    #[serde(default)]
    causes: Vec<StatusCause>,
}

#[derive(Debug, Default, Deserialize)]
struct StatusCause {
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

/// Parses the error-channel payload. An empty or unparseable frame from a
/// well-behaved server means the command simply succeeded.
pub fn parse_status(payload: &[u8]) -> ExecOutcome {
    if payload.is_empty() {
        return ExecOutcome::Success;
    }
    match serde_json::from_slice::<Status>(payload) {
        Ok(status) if status.status == "Success" => ExecOutcome::Success,
        Ok(status) => ExecOutcome::Failure {
            exit_code: status
                .details
                .causes
                .iter()
                .find(|cause| cause.reason == "ExitCode")
                .and_then(|cause| cause.message.parse().ok()),
            message: status.message,
        },
        Err(_) => ExecOutcome::Failure {
            exit_code: None,
            message: String::from_utf8_lossy(payload).into_owned(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClusterConfig {
        ClusterConfig {
            server: Url::parse("https://cluster.example:6443/").unwrap(),
            token: None,
            namespace: "default".to_string(),
            ca_pem: None,
            accept_invalid_certs: false,
        }
    }

    fn target() -> ExecTarget {
        ExecTarget {
            namespace: "web".to_string(),
            pod: "nginx".to_string(),
            container: "app".to_string(),
        }
    }

    #[test]
    fn exec_url_carries_argv_and_streams() {
        let argv = vec!["ls".to_string(), "-A".to_string(), "/etc".to_string()];
        let url = exec_url(&config(), &target(), &argv, false).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/api/v1/namespaces/web/pods/nginx/exec");

        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let commands: Vec<&str> = pairs
            .iter()
            .filter(|(k, _)| k == "command")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(commands, ["ls", "-A", "/etc"]);
        assert!(pairs.contains(&("container".to_string(), "app".to_string())));
        assert!(pairs.contains(&("stdin".to_string(), "false".to_string())));
        assert!(pairs.contains(&("stdout".to_string(), "true".to_string())));
        assert!(pairs.contains(&("stderr".to_string(), "true".to_string())));
        assert!(pairs.contains(&("tty".to_string(), "false".to_string())));
    }

    #[test]
    fn exec_url_enables_stdin_for_streaming_reads() {
        let argv = vec!["cat".to_string(), "/var/log/app.log".to_string()];
        let url = exec_url(&config(), &target(), &argv, true).unwrap();
        assert!(url.query().unwrap().contains("stdin=true"));
    }

    #[test]
    fn plain_http_server_dials_ws() {
        let mut config = config();
        config.server = Url::parse("http://localhost:8001/").unwrap();
        let url = exec_url(&config, &target(), &["true".to_string()], false).unwrap();
        assert_eq!(url.scheme(), "ws");
    }

    #[test]
    fn frame_helpers_round_trip() {
        let frame = stdin_frame(&[INTERRUPT_BYTE]);
        assert_eq!(frame, vec![STDIN_CHANNEL, 0x03]);
        let (channel, payload) = split_frame(&frame).unwrap();
        assert_eq!(channel, STDIN_CHANNEL);
        assert_eq!(payload, [0x03]);
        assert_eq!(split_frame(&[]), None);
    }

    #[test]
    fn success_status_parses() {
        assert_eq!(parse_status(b""), ExecOutcome::Success);
        assert_eq!(
            parse_status(br#"{"metadata":{},"status":"Success"}"#),
            ExecOutcome::Success
        );
    }

    #[test]
    fn failure_status_recovers_exit_code() {
        let payload = br#"{
            "metadata": {},
            "status": "Failure",
            "message": "command terminated with non-zero exit code",
            "reason": "NonZeroExitCode",
            "details": {"causes": [{"reason": "ExitCode", "message": "2"}]}
        }"#;
        assert_eq!(
            parse_status(payload),
            ExecOutcome::Failure {
                exit_code: Some(2),
                message: "command terminated with non-zero exit code".to_string(),
            }
        );
    }

    #[test]
    fn garbage_status_is_a_failure() {
        assert!(matches!(
            parse_status(b"not json"),
            ExecOutcome::Failure { exit_code: None, .. }
        ));
    }
}
