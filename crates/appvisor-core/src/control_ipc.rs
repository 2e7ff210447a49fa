use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// The closed set of actions an instance answers on its control port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlAction {
    Ping,
    OnSecondInstance,
    RestartAltInstance,
}

impl ControlAction {
    pub const ALL: [ControlAction; 3] = [
        ControlAction::Ping,
        ControlAction::OnSecondInstance,
        ControlAction::RestartAltInstance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Ping => "ping",
            ControlAction::OnSecondInstance => "on_second_instance",
            ControlAction::RestartAltInstance => "restart_alt_instance",
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlAction {
    type Err = ControlRejection;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "ping" => Ok(ControlAction::Ping),
            "on_second_instance" | "onSecondInstance" => Ok(ControlAction::OnSecondInstance),
            "restart_alt_instance" | "restartAltInstance" => Ok(ControlAction::RestartAltInstance),
            other => Err(ControlRejection::UnknownAction(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlRequest {
    #[serde(default)]
    pub version: ProtocolVersion,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<u16>,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
}

impl ControlRequest {
    pub fn new(action: ControlAction, data: Value) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            action: action.as_str().to_string(),
            data,
            source_port: None,
            secret_key: String::new(),
            sent_at: Some(Utc::now().to_rfc3339()),
        }
    }

    pub fn with_payload<T: Serialize>(
        action: ControlAction,
        payload: &T,
    ) -> Result<Self, FrameError> {
        let data =
            serde_json::to_value(payload).map_err(|err| FrameError::Encode(err.to_string()))?;
        Ok(Self::new(action, data))
    }

    pub fn signed(mut self, source_port: u16, secret_key: &str) -> Self {
        self.source_port = Some(source_port);
        self.secret_key = secret_key.to_string();
        self
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ControlRejection> {
        serde_json::from_value(self.data.clone())
            .map_err(|err| ControlRejection::InvalidPayload(err.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecondInstancePayload {
    #[serde(default)]
    pub sender_port: Option<u16>,
    pub profile_path: String,
    #[serde(default)]
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControlErrorCode {
    BadRequest,
    Unauthorized,
    NotFound,
    Unavailable,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlError {
    pub code: ControlErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlReply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlError>,
}

impl ControlReply {
    pub fn ok(value: impl Into<Value>) -> Self {
        Self {
            status: ReplyStatus::Ok,
            value: value.into(),
            error: None,
        }
    }

    pub fn error(code: ControlErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            value: Value::Null,
            error: Some(ControlError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn rejected(rejection: &ControlRejection) -> Self {
        Self::error(rejection.code(), rejection.to_string())
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    pub fn error_code(&self) -> Option<ControlErrorCode> {
        self.error.as_ref().map(|error| error.code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlRejection {
    #[error("missing \"action\" property in message")]
    MissingAction,
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),
    #[error("secret key mismatch")]
    Unauthorized,
    #[error("unknown action: {0}")]
    UnknownAction(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl ControlRejection {
    pub fn code(&self) -> ControlErrorCode {
        match self {
            ControlRejection::MissingAction
            | ControlRejection::UnsupportedVersion(_)
            | ControlRejection::InvalidPayload(_) => ControlErrorCode::BadRequest,
            ControlRejection::Unauthorized => ControlErrorCode::Unauthorized,
            ControlRejection::UnknownAction(_) => ControlErrorCode::NotFound,
        }
    }
}

/// Checks run before a request may reach any action handler. The secret is
/// checked before the action name is resolved.
pub fn authorize(
    request: &ControlRequest,
    secret: &str,
) -> Result<ControlAction, ControlRejection> {
    if request.version.0 > CURRENT_PROTOCOL_VERSION {
        return Err(ControlRejection::UnsupportedVersion(request.version.0));
    }
    if request.action.trim().is_empty() {
        return Err(ControlRejection::MissingAction);
    }
    if !secrets_match(&request.secret_key, secret) {
        return Err(ControlRejection::Unauthorized);
    }
    request.action.parse()
}

fn secrets_match(presented: &str, expected: &str) -> bool {
    if expected.is_empty() || presented.len() != expected.len() {
        return false;
    }
    presented
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

/// Longest line a reader should buffer for one frame, terminator included.
pub fn max_line_bytes(max_frame_bytes: usize) -> usize {
    max_frame_bytes.saturating_add(2)
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut frame =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    within_limit(frame.len(), max_frame_bytes)?;
    frame.push(b'\n');
    Ok(frame)
}

pub fn decode_frame<T: DeserializeOwned>(
    line: &[u8],
    max_frame_bytes: usize,
) -> Result<T, FrameError> {
    let body = strip_line_ending(line);
    within_limit(body.len(), max_frame_bytes)?;
    serde_json::from_slice(body).map_err(|err| FrameError::Decode(err.to_string()))
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn within_limit(size: usize, max: usize) -> Result<(), FrameError> {
    if size > max {
        return Err(FrameError::OversizedFrame { size, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn signed(action: &str, secret: &str) -> ControlRequest {
        ControlRequest {
            version: ProtocolVersion::CURRENT,
            action: action.to_string(),
            data: Value::Null,
            source_port: Some(2659),
            secret_key: secret.to_string(),
            sent_at: None,
        }
    }

    #[test]
    fn wrong_secret_is_rejected_for_every_action() {
        let names = ControlAction::ALL
            .iter()
            .map(|action| action.as_str().to_string())
            .chain(["not_a_real_action".to_string()]);
        for name in names {
            for bad in ["", "nope", &SECRET[1..], &format!("{SECRET}x")] {
                let result = authorize(&signed(&name, bad), SECRET);
                assert_eq!(
                    result,
                    Err(ControlRejection::Unauthorized),
                    "action {name} with secret {bad:?}"
                );
            }
        }
    }

    #[test]
    fn correct_secret_resolves_action_or_not_found() {
        for action in ControlAction::ALL {
            assert_eq!(authorize(&signed(action.as_str(), SECRET), SECRET), Ok(action));
        }
        let unknown = authorize(&signed("format_disk", SECRET), SECRET).unwrap_err();
        assert_eq!(unknown.code(), ControlErrorCode::NotFound);
    }

    #[test]
    fn empty_receiver_secret_never_authorizes() {
        assert_eq!(
            authorize(&signed("ping", ""), ""),
            Err(ControlRejection::Unauthorized)
        );
    }

    #[test]
    fn missing_action_and_future_version_are_bad_requests() {
        let missing = authorize(&signed("  ", SECRET), SECRET).unwrap_err();
        assert_eq!(missing, ControlRejection::MissingAction);
        assert_eq!(missing.code(), ControlErrorCode::BadRequest);

        let mut future = signed("ping", SECRET);
        future.version = ProtocolVersion(CURRENT_PROTOCOL_VERSION + 1);
        assert_eq!(
            authorize(&future, SECRET),
            Err(ControlRejection::UnsupportedVersion(CURRENT_PROTOCOL_VERSION + 1))
        );
    }

    #[test]
    fn legacy_camel_case_action_names_are_accepted() {
        assert_eq!(
            "onSecondInstance".parse::<ControlAction>(),
            Ok(ControlAction::OnSecondInstance)
        );
        assert_eq!(
            "restartAltInstance".parse::<ControlAction>(),
            Ok(ControlAction::RestartAltInstance)
        );
    }

    #[test]
    fn second_instance_payload_survives_the_wire() {
        let payload = SecondInstancePayload {
            sender_port: Some(2659),
            profile_path: "/home/user/.config/appvisor-desktop".to_string(),
            argv: vec![
                "appvisor".to_string(),
                "appvisor://x-callback-url/openNote?id=abc".to_string(),
            ],
        };
        let request = ControlRequest::with_payload(ControlAction::OnSecondInstance, &payload)
            .expect("payload")
            .signed(2659, SECRET);
        let frame = encode_frame(&request, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert_eq!(frame.last(), Some(&b'\n'));

        let decoded: ControlRequest =
            decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(decoded.source_port, Some(2659));
        assert_eq!(
            decoded.payload::<SecondInstancePayload>().expect("typed payload"),
            payload
        );
    }

    #[test]
    fn malformed_payload_is_invalid() {
        let mut request = signed("on_second_instance", SECRET);
        request.data = serde_json::json!({"argv": "not-a-list"});
        let err = request.payload::<SecondInstancePayload>().unwrap_err();
        assert!(matches!(err, ControlRejection::InvalidPayload(_)));
        assert_eq!(err.code(), ControlErrorCode::BadRequest);
    }

    #[test]
    fn reply_error_carries_code() {
        let reply = ControlReply::rejected(&ControlRejection::Unauthorized);
        assert!(!reply.is_ok());
        assert_eq!(reply.error_code(), Some(ControlErrorCode::Unauthorized));

        let json = serde_json::to_value(&reply).expect("serialize");
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["code"], "unauthorized");
    }

    #[test]
    fn version_field_is_numeric_and_defaults_when_missing() {
        let numeric_version: ControlRequest =
            serde_json::from_str(r#"{"version":1,"action":"ping","secret_key":"k"}"#)
                .expect("numeric version");
        assert_eq!(numeric_version.version, ProtocolVersion(1));

        let missing_version: ControlRequest =
            serde_json::from_str(r#"{"action":"ping"}"#).expect("missing version");
        assert_eq!(missing_version.version, ProtocolVersion::CURRENT);
        assert!(missing_version.secret_key.is_empty());

        let string_version: Result<ControlRequest, _> =
            serde_json::from_str(r#"{"version":"1","action":"ping"}"#);
        assert!(string_version.is_err());

        let json = serde_json::to_value(signed("ping", SECRET)).expect("serialize");
        assert_eq!(json["version"], 1);
    }

    #[test]
    fn oversized_frames_are_refused_both_ways() {
        let mut request = signed("ping", SECRET);
        request.data = serde_json::json!({"blob": "x".repeat(256)});
        assert!(matches!(
            encode_frame(&request, 64),
            Err(FrameError::OversizedFrame { .. })
        ));

        let frame = encode_frame(&request, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let decoded: Result<ControlRequest, _> = decode_frame(&frame, 64);
        assert!(matches!(decoded, Err(FrameError::OversizedFrame { .. })));
    }

    #[test]
    fn crlf_terminated_frame_decodes() {
        let mut frame =
            encode_frame(&signed("ping", SECRET), DEFAULT_MAX_FRAME_BYTES).expect("encode");
        frame.pop();
        frame.extend_from_slice(b"\r\n");
        let decoded: ControlRequest =
            decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(decoded.action, "ping");
        assert_eq!(max_line_bytes(DEFAULT_MAX_FRAME_BYTES), DEFAULT_MAX_FRAME_BYTES + 2);
    }
}
