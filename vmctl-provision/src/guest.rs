//! QEMU guest agent protocol types.
//!
//! Commands travel as JSON envelopes `{"execute": ..., "arguments": ...}`
//! passed to `virsh qemu-agent-command`; replies wrap their payload in
//! `{"return": ...}`. Envelopes are always built with serde_json.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Serialize)]
struct Envelope<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
}

#[derive(Deserialize)]
struct Reply<T> {
    #[serde(rename = "return")]
    value: T,
}

/// Serialize a guest agent command.
pub fn envelope(execute: &str, arguments: Option<Value>) -> Result<String> {
    Ok(serde_json::to_string(&Envelope { execute, arguments })?)
}

/// Extract the `return` payload of a guest agent reply.
pub fn parse_return<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let reply: Reply<T> = serde_json::from_str(raw.trim())?;
    Ok(reply.value)
}

/// Arguments of `guest-exec`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExecRequest {
    pub path: String,
    pub arg: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_data: Option<String>,
    pub capture_output: bool,
}

impl ExecRequest {
    /// Build a request, rejecting arguments with NUL bytes.
    pub fn new(path: &str, args: &[String], capture_output: bool) -> Result<Self> {
        if path.is_empty() {
            return Err(Error::Validation("missing command path".to_string()));
        }
        if path.contains('\0') || args.iter().any(|a| a.contains('\0')) {
            return Err(Error::Validation(
                "command arguments may not contain NUL bytes".to_string(),
            ));
        }
        Ok(Self {
            path: path.to_string(),
            arg: args.to_vec(),
            input_data: None,
            capture_output,
        })
    }

    /// Feed `input` to the process's stdin.
    pub fn with_input(mut self, input: &[u8]) -> Self {
        self.input_data = Some(BASE64.encode(input));
        self
    }
}

/// Reply of `guest-exec`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecStarted {
    pub pid: i64,
}

/// Reply of `guest-exec-status`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExecStatus {
    pub exited: bool,
    #[serde(rename = "exitcode")]
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub out_data: Option<String>,
    pub err_data: Option<String>,
    #[serde(default)]
    pub out_truncated: bool,
    #[serde(default)]
    pub err_truncated: bool,
}

/// Result of a guest command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestExecOutput {
    pub pid: i64,
    /// `None` when output was not captured.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GuestExecOutput {
    pub(crate) fn from_status(pid: i64, status: ExecStatus) -> Result<Self> {
        Ok(Self {
            pid,
            exit_code: status.exit_code,
            stdout: decode_stream(status.out_data.as_deref())?,
            stderr: decode_stream(status.err_data.as_deref())?,
        })
    }
}

fn decode_stream(data: Option<&str>) -> Result<String> {
    match data {
        Some(encoded) => {
            let bytes = BASE64.decode(encoded).map_err(|e| Error::ExternalCommand {
                command: "guest-exec-status".to_string(),
                status: None,
                stderr: format!("guest returned invalid base64: {}", e),
            })?;
            Ok(String::from_utf8_lossy(&bytes).into_owned())
        }
        None => Ok(String::new()),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct HostName {
    #[serde(rename = "host-name")]
    pub host_name: String,
}

/// Reply of `guest-get-osinfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OsInfo {
    pub id: Option<String>,
    pub name: Option<String>,
    pub pretty_name: Option<String>,
    pub version: Option<String>,
    pub version_id: Option<String>,
    pub kernel_release: Option<String>,
    pub kernel_version: Option<String>,
    pub machine: Option<String>,
}

/// One entry of `guest-get-fsinfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileSystemInfo {
    pub name: String,
    pub mountpoint: String,
    #[serde(rename = "type")]
    pub fs_type: String,
    pub total_bytes: Option<u64>,
    pub used_bytes: Option<u64>,
}

/// One entry of `guest-network-get-interfaces`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkInterface {
    pub name: String,
    pub hardware_address: Option<String>,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IpAddress {
    pub ip_address_type: String,
    pub ip_address: String,
    pub prefix: u8,
}

/// One entry of `guest-get-users`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GuestUser {
    pub user: String,
    pub domain: Option<String>,
    pub login_time: f64,
}

/// Convert the nanosecond timestamp of `guest-get-time`.
pub fn guest_time(nanos: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_nanos(nanos)
}

/// Extended guest state. Fields the agent failed to report are absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<OsInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesystems: Option<Vec<FileSystemInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<NetworkInterface>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<GuestUser>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_escapes_arguments() {
        let request = ExecRequest::new("/bin/echo", &["a\"b".to_string(), "}{".to_string()], true)
            .unwrap();
        let raw = envelope("guest-exec", Some(serde_json::to_value(&request).unwrap())).unwrap();

        let parsed: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["execute"], "guest-exec");
        assert_eq!(parsed["arguments"]["arg"], json!(["a\"b", "}{"]));
        assert_eq!(parsed["arguments"]["capture-output"], true);
        assert!(parsed["arguments"].get("input-data").is_none());

        assert_eq!(envelope("guest-ping", None).unwrap(), r#"{"execute":"guest-ping"}"#);
    }

    #[test]
    fn test_exec_request_rejects_nul() {
        let err = ExecRequest::new("/bin/ls", &["a\0b".to_string()], false).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(ExecRequest::new("", &[], false).is_err());
    }

    #[test]
    fn test_exec_status_decodes_output() {
        let status: ExecStatus = parse_return(
            r#"{"return":{"exitcode":0,"out-data":"aGVsbG8K","exited":true}}"#,
        )
        .unwrap();
        let output = GuestExecOutput::from_status(42, status).unwrap();
        assert_eq!(output.exit_code, Some(0));
        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.stderr, "");
    }

    #[test]
    fn test_parse_hostname_and_interfaces() {
        let name: HostName = parse_return(r#"{"return":{"host-name":"web-01"}}"#).unwrap();
        assert_eq!(name.host_name, "web-01");

        let ifaces: Vec<NetworkInterface> = parse_return(
            r#"{"return":[{"name":"eth0","hardware-address":"52:54:00:12:34:56",
                "ip-addresses":[{"ip-address-type":"ipv4","ip-address":"10.0.0.5","prefix":24}]},
                {"name":"lo"}]}"#,
        )
        .unwrap();
        assert_eq!(ifaces.len(), 2);
        assert_eq!(ifaces[0].ip_addresses[0].ip_address, "10.0.0.5");
        assert!(ifaces[1].ip_addresses.is_empty());
    }

    #[test]
    fn test_guest_info_omits_missing_fields() {
        let info = GuestInfo {
            hostname: Some("web-01".to_string()),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&info).unwrap(), json!({"hostname": "web-01"}));
    }
}
