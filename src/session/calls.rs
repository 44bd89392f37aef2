//! Typed function calls emitted by the tutor.
//!
//! Every built-in call name maps to one [`FunctionCall`] variant. Arguments
//! are checked once, at the boundary, against [`CALL_SCHEMAS`] (required
//! fields, with accepted aliases) and then decoded into typed payloads.
//! Anything that fails is rejected with a [`TutorError::FunctionCallValidation`]
//! and never reaches session state. Names without a schema pass through as
//! [`FunctionCall::Custom`] for handlers registered at runtime.
//!
//! The model is loose with types: numbers may arrive as strings and ids as
//! numbers, so decoding coerces where the intent is unambiguous.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::core::transport::{FunctionCallFrame, ToolDeclaration, lenient_id};
use crate::errors::{TutorError, TutorResult};

// =============================================================================
// Call names
// =============================================================================

/// Log a linguistic error.
pub const MARK_FOR_REVIEW: &str = "mark_for_review";
/// Merge learner preferences into their profile.
pub const UPDATE_USER_PROFILE: &str = "update_user_profile";
/// Mark a lesson task as achieved.
pub const MARK_TASK_COMPLETE: &str = "mark_task_complete";
/// Close the session with a summary.
pub const SHOW_SESSION_SUMMARY: &str = "show_session_summary";
/// Award a badge.
pub const AWARD_BADGE: &str = "award_badge";
/// Replay the learner's earlier recording during a review lesson.
pub const PLAY_STUDENT_AUDIO: &str = "play_student_audio";
/// Record that a review item is mastered.
pub const MARK_ITEM_MASTERED: &str = "mark_item_mastered";

/// Required fields per call. Each entry lists the accepted spellings of one
/// field; the first spelling is canonical.
pub struct CallSchema {
    /// Call name
    pub name: &'static str,
    /// Required fields, each with its aliases
    pub required: &'static [&'static [&'static str]],
}

/// Validation table for every known call.
pub const CALL_SCHEMAS: &[CallSchema] = &[
    CallSchema {
        name: MARK_FOR_REVIEW,
        required: &[
            &["error_type"],
            &["user_sentence"],
            &["correction"],
            &["severity"],
        ],
    },
    CallSchema {
        name: UPDATE_USER_PROFILE,
        required: &[],
    },
    CallSchema {
        name: MARK_TASK_COMPLETE,
        required: &[&["task_id"]],
    },
    CallSchema {
        name: SHOW_SESSION_SUMMARY,
        required: &[
            &["did_well", "strengths"],
            &["work_on", "areas_for_improvement"],
            &["stars"],
            &["summary_text", "summary"],
        ],
    },
    CallSchema {
        name: AWARD_BADGE,
        required: &[&["badge_id"]],
    },
    CallSchema {
        name: PLAY_STUDENT_AUDIO,
        required: &[&["review_item_id"]],
    },
    CallSchema {
        name: MARK_ITEM_MASTERED,
        required: &[&["review_item_id"], &["confidence"]],
    },
];

/// Schema for a call name.
pub fn schema_for(name: &str) -> Option<&'static CallSchema> {
    CALL_SCHEMAS.iter().find(|schema| schema.name == name)
}

// =============================================================================
// Payloads
// =============================================================================

/// A linguistic error observed by the tutor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StruggleRecord {
    /// Error category, e.g. "grammar" or "vocabulary"
    pub error_type: String,
    /// Severity from 1 (minor) to 10 (blocking)
    pub severity: u8,
    /// What the learner said
    pub user_sentence: String,
    /// What they should have said
    pub correction: String,
    /// Why
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    /// Clip of the learner's turn, when one was recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_ref: Option<String>,
}

/// Fields `update_user_profile` may carry.
pub const PROFILE_FIELDS: &[&str] = &["interests", "preferences", "learning_goals", "notes"];

/// Learner preferences to merge into the profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileDelta {
    /// Fields to merge, keyed by one of [`PROFILE_FIELDS`]
    pub fields: Map<String, Value>,
}

/// A badge awarded during the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeAward {
    /// Badge identifier
    pub badge_id: String,
    /// Optional reason shown to the learner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// How sure the tutor is that an item is mastered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Hesitant
    Low,
    /// Minor issues
    Medium,
    /// Natural use
    High,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::Low => write!(f, "low"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::High => write!(f, "high"),
        }
    }
}

/// A review item the learner has mastered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasteryRecord {
    /// Review item id
    pub review_item_id: String,
    /// Tutor's confidence
    pub confidence: Confidence,
}

/// End-of-session feedback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Things the learner did well
    pub did_well: Vec<String>,
    /// Areas to work on
    pub work_on: Vec<String>,
    /// Rating from 1 to 5
    pub stars: u8,
    /// Encouraging paragraph
    pub summary_text: String,
}

/// A validated call.
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionCall {
    /// `mark_for_review`
    MarkForReview(StruggleRecord),
    /// `update_user_profile`
    UpdateUserProfile(ProfileDelta),
    /// `mark_task_complete`
    MarkTaskComplete {
        /// Task id as the tutor sent it
        task_id: String,
    },
    /// `show_session_summary`
    ShowSessionSummary(SessionSummary),
    /// `award_badge`
    AwardBadge(BadgeAward),
    /// `play_student_audio`
    PlayStudentAudio {
        /// Review item whose clip should be replayed
        review_item_id: String,
    },
    /// `mark_item_mastered`
    MarkItemMastered(MasteryRecord),
    /// A call with no built-in schema, left undecoded
    Custom {
        /// Call name
        name: String,
        /// Raw arguments
        args: Map<String, Value>,
    },
}

impl FunctionCall {
    /// Call name on the wire.
    pub fn name(&self) -> &str {
        match self {
            FunctionCall::MarkForReview(_) => MARK_FOR_REVIEW,
            FunctionCall::UpdateUserProfile(_) => UPDATE_USER_PROFILE,
            FunctionCall::MarkTaskComplete { .. } => MARK_TASK_COMPLETE,
            FunctionCall::ShowSessionSummary(_) => SHOW_SESSION_SUMMARY,
            FunctionCall::AwardBadge(_) => AWARD_BADGE,
            FunctionCall::PlayStudentAudio { .. } => PLAY_STUDENT_AUDIO,
            FunctionCall::MarkItemMastered(_) => MARK_ITEM_MASTERED,
            FunctionCall::Custom { name, .. } => name,
        }
    }

    /// Validate and decode a raw call.
    pub fn from_frame(frame: &FunctionCallFrame) -> TutorResult<Self> {
        let name = frame.name.as_str();
        let Some(schema) = schema_for(name) else {
            return Ok(FunctionCall::Custom {
                name: name.to_string(),
                args: frame.args.clone(),
            });
        };
        let args = Args {
            name,
            map: &frame.args,
        };
        args.check_required(schema)?;

        let call = match name {
            MARK_FOR_REVIEW => FunctionCall::MarkForReview(StruggleRecord {
                error_type: args.text(&["error_type"])?,
                severity: args.ranged(&["severity"], 1, 10)?,
                user_sentence: args.text(&["user_sentence"])?,
                correction: args.text(&["correction"])?,
                explanation: args.optional_text(&["explanation"]),
                audio_ref: None,
            }),
            UPDATE_USER_PROFILE => {
                if let Some(unknown) = frame
                    .args
                    .keys()
                    .find(|key| !PROFILE_FIELDS.contains(&key.as_str()))
                {
                    return Err(TutorError::validation(
                        name,
                        format!(
                            "unknown profile field '{unknown}', expected one of {}",
                            PROFILE_FIELDS.join(", ")
                        ),
                    ));
                }
                let fields: Map<String, Value> = frame
                    .args
                    .iter()
                    .filter(|(_, value)| !value.is_null())
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                if fields.is_empty() {
                    return Err(TutorError::validation(name, "no profile fields supplied"));
                }
                FunctionCall::UpdateUserProfile(ProfileDelta { fields })
            }
            MARK_TASK_COMPLETE => FunctionCall::MarkTaskComplete {
                task_id: args.id(&["task_id"])?,
            },
            SHOW_SESSION_SUMMARY => FunctionCall::ShowSessionSummary(SessionSummary {
                did_well: args.text_list(&["did_well", "strengths"])?,
                work_on: args.text_list(&["work_on", "areas_for_improvement"])?,
                stars: args.ranged(&["stars"], 1, 5)?,
                summary_text: args.text(&["summary_text", "summary"])?,
            }),
            AWARD_BADGE => FunctionCall::AwardBadge(BadgeAward {
                badge_id: args.id(&["badge_id"])?,
                reason: args.optional_text(&["reason"]),
            }),
            PLAY_STUDENT_AUDIO => FunctionCall::PlayStudentAudio {
                review_item_id: args.id(&["review_item_id"])?,
            },
            MARK_ITEM_MASTERED => FunctionCall::MarkItemMastered(MasteryRecord {
                review_item_id: args.id(&["review_item_id"])?,
                confidence: args.confidence(&["confidence"])?,
            }),
            _ => {
                return Err(TutorError::validation(
                    name,
                    format!("unknown function '{name}'"),
                ));
            }
        };
        Ok(call)
    }
}

// =============================================================================
// Argument decoding
// =============================================================================

struct Args<'a> {
    name: &'a str,
    map: &'a Map<String, Value>,
}

impl<'a> Args<'a> {
    fn lookup(&self, keys: &[&str]) -> Option<&'a Value> {
        keys.iter()
            .filter_map(|key| self.map.get(*key))
            .find(|value| !value.is_null())
    }

    fn fail(&self, reason: String) -> TutorError {
        TutorError::validation(self.name, reason)
    }

    fn require(&self, keys: &[&str]) -> TutorResult<&'a Value> {
        self.lookup(keys)
            .ok_or_else(|| self.fail(missing_field_message(keys)))
    }

    fn check_required(&self, schema: &CallSchema) -> TutorResult<()> {
        for keys in schema.required {
            self.require(keys)?;
        }
        Ok(())
    }

    fn text(&self, keys: &[&str]) -> TutorResult<String> {
        let value = self.require(keys)?;
        match value {
            Value::String(s) if !s.trim().is_empty() => Ok(s.trim().to_string()),
            Value::String(_) => Err(self.fail(format!("field '{}' is empty", keys[0]))),
            _ => Err(self.fail(format!("field '{}' must be a string", keys[0]))),
        }
    }

    fn optional_text(&self, keys: &[&str]) -> Option<String> {
        match self.lookup(keys) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            _ => None,
        }
    }

    fn id(&self, keys: &[&str]) -> TutorResult<String> {
        let value = self.require(keys)?;
        lenient_id(value)
            .ok_or_else(|| self.fail(format!("field '{}' must be a string or number", keys[0])))
    }

    fn ranged(&self, keys: &[&str], min: u8, max: u8) -> TutorResult<u8> {
        let value = self.require(keys)?;
        let number = lenient_u64(value)
            .ok_or_else(|| self.fail(format!("field '{}' must be a whole number", keys[0])))?;
        if number < u64::from(min) || number > u64::from(max) {
            return Err(self.fail(format!(
                "field '{}' must be between {min} and {max}, got {number}",
                keys[0]
            )));
        }
        Ok(number as u8)
    }

    fn text_list(&self, keys: &[&str]) -> TutorResult<Vec<String>> {
        let value = self.require(keys)?;
        match value {
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.trim().to_string()),
                    _ => Err(self.fail(format!("field '{}' must hold strings", keys[0]))),
                })
                .collect(),
            Value::String(s) => Ok(vec![s.trim().to_string()]),
            _ => Err(self.fail(format!("field '{}' must be a list of strings", keys[0]))),
        }
    }

    fn confidence(&self, keys: &[&str]) -> TutorResult<Confidence> {
        let value = self.require(keys)?;
        let text = value.as_str().map(|s| s.trim().to_ascii_lowercase());
        match text.as_deref() {
            Some("low") => Ok(Confidence::Low),
            Some("medium") => Ok(Confidence::Medium),
            Some("high") => Ok(Confidence::High),
            _ => Err(self.fail(format!(
                "field '{}' must be one of low, medium, high",
                keys[0]
            ))),
        }
    }
}

fn missing_field_message(keys: &[&str]) -> String {
    match keys {
        [only] => format!("missing required field '{only}'"),
        [first, rest @ ..] => {
            let aliases: Vec<String> = rest.iter().map(|k| format!("'{k}'")).collect();
            format!(
                "missing required field '{first}' (or {})",
                aliases.join(", ")
            )
        }
        [] => "missing required field".to_string(),
    }
}

/// Whole number from a JSON number or numeric string.
pub fn lenient_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                .map(|f| f as u64)
        }),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<u64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                    .map(|f| f as u64)
            })
        }
        _ => None,
    }
}

// =============================================================================
// Tool declarations
// =============================================================================

fn declaration(name: &str, description: &str, parameters: Value) -> ToolDeclaration {
    ToolDeclaration {
        name: name.to_string(),
        description: description.to_string(),
        parameters,
    }
}

/// Declarations for the calls available in every session.
pub fn base_tool_declarations() -> Vec<ToolDeclaration> {
    vec![
        declaration(
            MARK_FOR_REVIEW,
            "Silently log a linguistic error the student made.",
            json!({
                "type": "object",
                "properties": {
                    "error_type": {"type": "string", "description": "grammar, pronunciation or vocabulary"},
                    "severity": {"type": "integer", "minimum": 1, "maximum": 10},
                    "user_sentence": {"type": "string"},
                    "correction": {"type": "string"},
                    "explanation": {"type": "string"}
                },
                "required": ["error_type", "severity", "user_sentence", "correction"]
            }),
        ),
        declaration(
            UPDATE_USER_PROFILE,
            "Record student interests or preferences to personalize future sessions.",
            json!({
                "type": "object",
                "properties": {
                    "interests": {"type": "array", "items": {"type": "string"}},
                    "preferences": {"type": "object"},
                    "learning_goals": {"type": "string"},
                    "notes": {"type": "string"}
                }
            }),
        ),
        declaration(
            SHOW_SESSION_SUMMARY,
            "End the lesson with feedback for the student.",
            json!({
                "type": "object",
                "properties": {
                    "did_well": {"type": "array", "items": {"type": "string"}},
                    "work_on": {"type": "array", "items": {"type": "string"}},
                    "stars": {"type": "integer", "minimum": 1, "maximum": 5},
                    "summary_text": {"type": "string"}
                },
                "required": ["did_well", "work_on", "stars", "summary_text"]
            }),
        ),
        declaration(
            AWARD_BADGE,
            "Award the student a badge.",
            json!({
                "type": "object",
                "properties": {
                    "badge_id": {"type": "string"},
                    "reason": {"type": "string"}
                },
                "required": ["badge_id"]
            }),
        ),
    ]
}

/// Declaration for task completion, offered when the lesson has tasks.
pub fn task_tool_declaration() -> ToolDeclaration {
    declaration(
        MARK_TASK_COMPLETE,
        "Mark a lesson task as completed as soon as the student achieves it.",
        json!({
            "type": "object",
            "properties": {"task_id": {"type": "string"}},
            "required": ["task_id"]
        }),
    )
}

/// Declarations offered in review lessons.
pub fn review_tool_declarations() -> Vec<ToolDeclaration> {
    vec![
        declaration(
            PLAY_STUDENT_AUDIO,
            "Play back the student's original recording of a review item.",
            json!({
                "type": "object",
                "properties": {"review_item_id": {"type": "string"}},
                "required": ["review_item_id"]
            }),
        ),
        declaration(
            MARK_ITEM_MASTERED,
            "Record that the student used a review item correctly in context.",
            json!({
                "type": "object",
                "properties": {
                    "review_item_id": {"type": "string"},
                    "confidence": {"type": "string", "enum": ["low", "medium", "high"]}
                },
                "required": ["review_item_id", "confidence"]
            }),
        ),
    ]
}
