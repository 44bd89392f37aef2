//! Wire frame types for the tutoring transport.
//!
//! Every websocket text message carries exactly one JSON frame with a `type`
//! discriminator. Function calls travel on a sub-channel: any object carrying a
//! `name`/`args` pair (and no other `type`) is a call from the tutor.
//!
//! # Frames
//!
//! - `audio` - base64 PCM16LE with a `mime` such as `audio/pcm;rate=16000`
//! - `text` - conversational text, tagged with the speaker
//! - `control` - turn and session control commands
//! - `error` - error reported by the remote side
//! - `function_result` - answer to a function call (outbound only)
//! - `setup` - handshake carrying the instruction payload (outbound only)

use std::fmt;

use base64::prelude::*;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{TutorError, TutorResult};

/// Mime prefix used for raw PCM audio frames.
pub const PCM_MIME_PREFIX: &str = "audio/pcm";

// =============================================================================
// Frame payloads
// =============================================================================

/// Who produced a piece of conversation content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// The learner
    User,
    /// The remote tutor
    #[default]
    Tutor,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::User => write!(f, "user"),
            Speaker::Tutor => write!(f, "tutor"),
        }
    }
}

/// Raw audio payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Raw PCM bytes (16-bit signed little-endian, mono)
    pub payload: Bytes,
    /// Mime type, including the sample rate parameter
    pub mime: String,
}

impl AudioFrame {
    /// Build a PCM frame at the given sample rate.
    pub fn pcm(payload: Bytes, sample_rate: u32) -> Self {
        Self {
            payload,
            mime: format!("{PCM_MIME_PREFIX};rate={sample_rate}"),
        }
    }

    /// Sample rate declared in the mime type, if any.
    pub fn sample_rate(&self) -> Option<u32> {
        self.mime
            .split(';')
            .skip(1)
            .filter_map(|param| param.trim().strip_prefix("rate="))
            .find_map(|rate| rate.trim().parse().ok())
    }
}

/// Conversational text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFrame {
    /// Text content
    pub content: String,
    /// Speaker the text belongs to
    pub speaker: Speaker,
    /// Whether the text is a native-language aside
    pub whisper: bool,
}

impl TextFrame {
    /// Text spoken or typed by the learner.
    pub fn user(content: impl Into<String>, whisper: bool) -> Self {
        Self {
            content: content.into(),
            speaker: Speaker::User,
            whisper,
        }
    }

    /// Text produced by the tutor.
    pub fn tutor(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            speaker: Speaker::Tutor,
            whisper: false,
        }
    }
}

/// Control commands exchanged in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    /// The current turn is complete
    TurnComplete,
    /// The tutor's output was cut short (barge-in or explicit stop)
    Interrupted,
    /// Ask the tutor to wrap up and produce a session summary
    ConcludeSession,
    /// The learner's microphone stream paused
    AudioStreamEnd,
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlCommand::TurnComplete => "turn_complete",
            ControlCommand::Interrupted => "interrupted",
            ControlCommand::ConcludeSession => "conclude_session",
            ControlCommand::AudioStreamEnd => "audio_stream_end",
        };
        f.write_str(name)
    }
}

/// Structured call emitted by the tutor.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCallFrame {
    /// Call ID, echoed in the result frame
    pub call_id: Option<String>,
    /// Function name
    pub name: String,
    /// Call arguments
    pub args: Map<String, Value>,
    /// Why `args` could not be read, when the tutor sent something other
    /// than an object. The call must still be answered, with an error.
    pub args_error: Option<String>,
}

/// Status of a function call result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// The call was applied
    Ok,
    /// The call was rejected
    Error,
}

/// Answer to a [`FunctionCallFrame`].
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionResultFrame {
    /// Call ID of the originating call
    pub call_id: Option<String>,
    /// Function name of the originating call
    pub name: String,
    /// Outcome
    pub result: CallStatus,
    /// Rejection reason when `result` is `error`
    pub error: Option<String>,
    /// Optional structured response for the tutor
    pub response: Option<Value>,
}

impl FunctionResultFrame {
    /// Successful result for a call.
    pub fn ok(call: &FunctionCallFrame, response: Option<Value>) -> Self {
        Self {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            result: CallStatus::Ok,
            error: None,
            response,
        }
    }

    /// Error result for a call.
    pub fn error(call: &FunctionCallFrame, reason: impl Into<String>) -> Self {
        Self {
            call_id: call.call_id.clone(),
            name: call.name.clone(),
            result: CallStatus::Error,
            error: Some(reason.into()),
            response: None,
        }
    }

    /// Whether the result reports success.
    pub fn is_ok(&self) -> bool {
        self.result == CallStatus::Ok
    }
}

/// Tool declaration sent with the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDeclaration {
    /// Function name
    pub name: String,
    /// What the tutor should use the function for
    pub description: String,
    /// JSON schema for the arguments
    pub parameters: Value,
}

/// Instruction payload delivered when a connection opens.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Handshake {
    /// Role, level, tone and task instructions for the tutor
    pub instructions: String,
    /// Function declarations the tutor may call
    pub tools: Vec<ToolDeclaration>,
}

impl Handshake {
    /// Handshake with instructions only.
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            tools: Vec::new(),
        }
    }

    /// Encode as the `setup` frame sent first on every connection.
    pub fn to_setup_json(&self, input_mime: &str, output_mime: &str) -> TutorResult<String> {
        let frame = TaggedFrame::Setup {
            instructions: self.instructions.clone(),
            tools: self.tools.clone(),
            input_mime: input_mime.to_string(),
            output_mime: output_mime.to_string(),
        };
        Ok(serde_json::to_string(&frame)?)
    }
}

// =============================================================================
// WireFrame
// =============================================================================

/// The unit of exchange on the transport.
///
/// Frames are immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    /// Raw audio
    Audio(AudioFrame),
    /// Conversational text
    Text(TextFrame),
    /// Control command
    Control(ControlCommand),
    /// Function call from the tutor
    FunctionCall(FunctionCallFrame),
    /// Function call result
    FunctionResult(FunctionResultFrame),
    /// Remote error
    Error(String),
}

impl WireFrame {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            WireFrame::Audio(_) => "audio",
            WireFrame::Text(_) => "text",
            WireFrame::Control(_) => "control",
            WireFrame::FunctionCall(_) => "function_call",
            WireFrame::FunctionResult(_) => "function_result",
            WireFrame::Error(_) => "error",
        }
    }

    /// Parse an inbound JSON frame.
    pub fn parse(text: &str) -> TutorResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| TutorError::MalformedFrame(format!("invalid JSON: {e}")))?;

        let object = value
            .as_object()
            .ok_or_else(|| TutorError::MalformedFrame("frame is not a JSON object".to_string()))?;

        // Function-call sub-channel: a name/args pair without a competing type tag
        let untyped_call = object.contains_key("name")
            && object.contains_key("args")
            && object.get("type").is_none();
        let tagged_call = object.get("type").and_then(Value::as_str) == Some("function_call");
        if untyped_call || tagged_call {
            return Ok(WireFrame::FunctionCall(call_from_object(object)?));
        }

        let tagged: TaggedFrame = serde_json::from_value(value)
            .map_err(|e| TutorError::MalformedFrame(e.to_string()))?;
        tagged.into_frame()
    }

    /// Encode as a JSON text message.
    pub fn to_json(&self) -> TutorResult<String> {
        let tagged = match self {
            WireFrame::Audio(audio) => TaggedFrame::Audio {
                data: BASE64_STANDARD.encode(&audio.payload),
                mime: audio.mime.clone(),
            },
            WireFrame::Text(text) => TaggedFrame::Text {
                content: text.content.clone(),
                speaker: text.speaker,
                whisper: text.whisper,
            },
            WireFrame::Control(command) => TaggedFrame::Control { command: *command },
            WireFrame::FunctionCall(call) => TaggedFrame::FunctionCall {
                id: call.call_id.clone(),
                name: call.name.clone(),
                args: call.args.clone(),
            },
            WireFrame::FunctionResult(result) => TaggedFrame::FunctionResult {
                id: result.call_id.clone(),
                name: result.name.clone(),
                result: result.result,
                error: result.error.clone(),
                response: result.response.clone(),
            },
            WireFrame::Error(message) => TaggedFrame::Error {
                message: message.clone(),
            },
        };
        Ok(serde_json::to_string(&tagged)?)
    }
}

impl From<TextFrame> for WireFrame {
    fn from(frame: TextFrame) -> Self {
        WireFrame::Text(frame)
    }
}

impl From<AudioFrame> for WireFrame {
    fn from(frame: AudioFrame) -> Self {
        WireFrame::Audio(frame)
    }
}

impl From<FunctionResultFrame> for WireFrame {
    fn from(frame: FunctionResultFrame) -> Self {
        WireFrame::FunctionResult(frame)
    }
}

// =============================================================================
// JSON representation
// =============================================================================

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TaggedFrame {
    Audio {
        data: String,
        mime: String,
    },
    Text {
        content: String,
        #[serde(default)]
        speaker: Speaker,
        #[serde(default, skip_serializing_if = "is_false")]
        whisper: bool,
    },
    Control {
        command: ControlCommand,
    },
    Error {
        message: String,
    },
    FunctionCall {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        #[serde(default)]
        args: Map<String, Value>,
    },
    FunctionResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        result: CallStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
    },
    Setup {
        instructions: String,
        #[serde(default)]
        tools: Vec<ToolDeclaration>,
        input_mime: String,
        output_mime: String,
    },
}

impl TaggedFrame {
    fn into_frame(self) -> TutorResult<WireFrame> {
        let frame = match self {
            TaggedFrame::Audio { data, mime } => {
                let payload = BASE64_STANDARD
                    .decode(data.as_bytes())
                    .map_err(|e| TutorError::MalformedFrame(format!("invalid base64 audio: {e}")))?;
                WireFrame::Audio(AudioFrame {
                    payload: Bytes::from(payload),
                    mime,
                })
            }
            TaggedFrame::Text {
                content,
                speaker,
                whisper,
            } => WireFrame::Text(TextFrame {
                content,
                speaker,
                whisper,
            }),
            TaggedFrame::Control { command } => WireFrame::Control(command),
            TaggedFrame::Error { message } => WireFrame::Error(message),
            TaggedFrame::FunctionCall { id, name, args } => {
                WireFrame::FunctionCall(FunctionCallFrame {
                    call_id: id,
                    name,
                    args,
                    args_error: None,
                })
            }
            TaggedFrame::FunctionResult {
                id,
                name,
                result,
                error,
                response,
            } => WireFrame::FunctionResult(FunctionResultFrame {
                call_id: id,
                name,
                result,
                error,
                response,
            }),
            TaggedFrame::Setup { .. } => {
                return Err(TutorError::MalformedFrame(
                    "setup frames are outbound only".to_string(),
                ));
            }
        };
        Ok(frame)
    }
}

/// Identifier from a JSON string or number.
pub fn lenient_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read a function call leniently. Only a missing name makes it unanswerable;
/// unreadable arguments are carried along so the call can be rejected.
fn call_from_object(object: &Map<String, Value>) -> TutorResult<FunctionCallFrame> {
    let name = object
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            TutorError::MalformedFrame("invalid function call: missing name".to_string())
        })?;
    let call_id = object
        .get("id")
        .or_else(|| object.get("call_id"))
        .and_then(lenient_id);

    let (args, args_error) = match object.get("args") {
        None | Some(Value::Null) => (Map::new(), None),
        Some(Value::Object(args)) => (args.clone(), None),
        // Some tutors double-encode the arguments
        Some(value @ Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(args)) => (args, None),
            _ => (Map::new(), Some(args_shape_error(value))),
        },
        Some(other) => (Map::new(), Some(args_shape_error(other))),
    };

    Ok(FunctionCallFrame {
        call_id,
        name: name.to_string(),
        args,
        args_error,
    })
}

fn args_shape_error(value: &Value) -> String {
    let kind = match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    };
    format!("arguments must be an object, got {kind}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_text_frame_defaults_to_tutor() {
        let frame = WireFrame::parse(r#"{"type":"text","content":"Hello! How are you?"}"#).unwrap();
        assert_eq!(frame, WireFrame::Text(TextFrame::tutor("Hello! How are you?")));
    }

    #[test]
    fn test_parse_untyped_function_call() {
        let frame = WireFrame::parse(
            r#"{"id":"c1","name":"mark_task_complete","args":{"task_id":"task-1"}}"#,
        )
        .unwrap();

        match frame {
            WireFrame::FunctionCall(call) => {
                assert_eq!(call.call_id.as_deref(), Some("c1"));
                assert_eq!(call.name, "mark_task_complete");
                assert_eq!(call.args.get("task_id"), Some(&json!("task-1")));
            }
            other => panic!("Expected function call, got {:?}", other),
        }
    }

    #[test]
    fn test_numeric_call_id_is_kept() {
        let frame = WireFrame::parse(
            r#"{"type":"function_call","id":7,"name":"mark_task_complete","args":{"task_id":"1"}}"#,
        )
        .unwrap();

        match frame {
            WireFrame::FunctionCall(call) => {
                assert_eq!(call.call_id.as_deref(), Some("7"));
                assert_eq!(call.args.get("task_id"), Some(&json!("1")));
                assert!(call.args_error.is_none());
            }
            other => panic!("Expected function call, got {:?}", other),
        }
    }

    #[test]
    fn test_unreadable_args_still_yield_a_call() {
        let frame = WireFrame::parse(r#"{"call_id":"c2","name":"award_badge","args":[1,2]}"#)
            .unwrap();

        match frame {
            WireFrame::FunctionCall(call) => {
                assert_eq!(call.call_id.as_deref(), Some("c2"));
                assert!(call.args.is_empty());
                assert_eq!(
                    call.args_error.as_deref(),
                    Some("arguments must be an object, got an array")
                );
            }
            other => panic!("Expected function call, got {:?}", other),
        }
    }

    #[test]
    fn test_string_encoded_args_are_decoded() {
        let frame =
            WireFrame::parse(r#"{"name":"award_badge","args":"{\"badge_id\":\"b1\"}"}"#)
                .unwrap();
        match frame {
            WireFrame::FunctionCall(call) => {
                assert_eq!(call.args.get("badge_id"), Some(&json!("b1")));
                assert!(call.args_error.is_none());
            }
            other => panic!("Expected function call, got {:?}", other),
        }
    }

    #[test]
    fn test_call_without_name_is_malformed() {
        assert!(matches!(
            WireFrame::parse(r#"{"type":"function_call","args":{}}"#),
            Err(TutorError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_parse_null_args_is_empty_map() {
        let frame = WireFrame::parse(r#"{"name":"show_session_summary","args":null}"#).unwrap();
        match frame {
            WireFrame::FunctionCall(call) => assert!(call.args.is_empty()),
            other => panic!("Expected function call, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_audio_frame_decodes_base64() {
        let text = json!({
            "type": "audio",
            "data": BASE64_STANDARD.encode([1u8, 0, 2, 0]),
            "mime": "audio/pcm;rate=24000",
        })
        .to_string();

        match WireFrame::parse(&text).unwrap() {
            WireFrame::Audio(audio) => {
                assert_eq!(audio.payload.as_ref(), &[1u8, 0, 2, 0]);
                assert_eq!(audio.sample_rate(), Some(24000));
            }
            other => panic!("Expected audio, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_payloads_are_rejected() {
        for payload in [
            "not json",
            "[1,2,3]",
            r#"{"type":"unknown"}"#,
            r#"{"type":"audio","data":"%%%","mime":"audio/pcm"}"#,
            r#"{"type":"control","command":"explode"}"#,
            r#"{"type":"setup","instructions":"x","input_mime":"a","output_mime":"b"}"#,
        ] {
            match WireFrame::parse(payload) {
                Err(TutorError::MalformedFrame(_)) => {}
                other => panic!("Expected MalformedFrame for {payload}, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_function_result_encoding() {
        let call = FunctionCallFrame {
            call_id: Some("c7".to_string()),
            name: "mark_task_complete".to_string(),
            args: Map::new(),
            args_error: None,
        };
        let json = WireFrame::from(FunctionResultFrame::error(&call, "missing field 'task_id'"))
            .to_json()
            .unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["type"], "function_result");
        assert_eq!(value["id"], "c7");
        assert_eq!(value["result"], "error");
        assert_eq!(value["error"], "missing field 'task_id'");
        assert!(value.get("response").is_none());
    }

    #[test]
    fn test_whisper_flag_only_serialized_when_set() {
        let plain = WireFrame::from(TextFrame::user("hi", false)).to_json().unwrap();
        assert!(!plain.contains("whisper"));

        let aside = WireFrame::from(TextFrame::user("como se dice", true))
            .to_json()
            .unwrap();
        let value: Value = serde_json::from_str(&aside).unwrap();
        assert_eq!(value["whisper"], true);
        assert_eq!(value["speaker"], "user");
    }

    #[test]
    fn test_setup_frame_carries_tools() {
        let handshake = Handshake {
            instructions: "You are a barista.".to_string(),
            tools: vec![ToolDeclaration {
                name: "mark_task_complete".to_string(),
                description: "Mark a task done".to_string(),
                parameters: json!({"type": "object"}),
            }],
        };
        let json = handshake
            .to_setup_json("audio/pcm;rate=16000", "audio/pcm;rate=24000")
            .unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["type"], "setup");
        assert_eq!(value["instructions"], "You are a barista.");
        assert_eq!(value["tools"][0]["name"], "mark_task_complete");
        assert_eq!(value["output_mime"], "audio/pcm;rate=24000");
    }

    #[test]
    fn test_sample_rate_missing_or_invalid() {
        let frame = AudioFrame {
            payload: Bytes::new(),
            mime: "audio/pcm".to_string(),
        };
        assert_eq!(frame.sample_rate(), None);

        let frame = AudioFrame {
            payload: Bytes::new(),
            mime: "audio/pcm; rate=abc".to_string(),
        };
        assert_eq!(frame.sample_rate(), None);

        assert_eq!(AudioFrame::pcm(Bytes::new(), 16000).sample_rate(), Some(16000));
    }
}
