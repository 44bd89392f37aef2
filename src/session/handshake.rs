//! Handshake payload assembly.
//!
//! The instruction string starts with the lesson author's scenario prompt and
//! appends tool guidance: task completion when the lesson has tasks, review
//! tools and an item reference for review lessons, and the always-on
//! autonomous tracking block. Sections are separated by newlines in that
//! order.

use serde::{Deserialize, Serialize};

use super::calls::{base_tool_declarations, review_tool_declarations, task_tool_declaration};
use super::state::SessionTask;
use crate::core::transport::Handshake;

const TRACKING_INSTRUCTIONS: &str = "
## Autonomous Tracking (use silently, never announce to student)

### Error Tracking
When the student makes a linguistic error, call `mark_for_review` silently:
- Grammar mistakes (wrong tense, word order, conjugation)
- Pronunciation errors (if apparent from context)
- Vocabulary misuse (wrong word choice)
Include: error_type, severity (1-10), user_sentence, correction, explanation

### User Preferences
When you learn about student interests or preferences, call `update_user_profile` to personalize future sessions.

### Badges
When the student reaches a notable milestone, call `award_badge` with a badge_id and a short reason.

### Session Summary
When the lesson naturally ends or the student says goodbye, call `show_session_summary` with:
- 2-4 things the student did well (did_well)
- 2-3 areas to work on (work_on)
- 1-5 star rating based on participation and effort (stars)
- An encouraging summary paragraph (summary_text)
";

const TASK_INSTRUCTIONS_HEADER: &str = "
### Task Completion
Call `mark_task_complete` IMMEDIATELY when the student achieves each objective:";

const TASK_INSTRUCTIONS_FOOTER: &str =
    "\nDo not wait - call as soon as the task is clearly completed.\n";

const REVIEW_INSTRUCTIONS: &str = "
### Review Session Tools
- Call `play_student_audio` to play back the student's original mistake before correcting, then wait for \"Audio played successfully\"
- Call `mark_item_mastered` when the student demonstrates clear understanding of a reviewed item
  - Only call it if they use it correctly in context, not just repeating after you
  - Include a confidence level: low (hesitant), medium (minor issues), high (natural)
";

/// A past struggle revisited in a review lesson.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewItem {
    /// Id the tutor passes to `play_student_audio` and `mark_item_mastered`
    pub id: String,
    /// Corrected sentence
    pub correction: String,
    /// Whether a recording of the original attempt is available
    #[serde(default)]
    pub has_audio: bool,
}

/// Builds the [`Handshake`] for a lesson.
#[derive(Debug, Clone, Default)]
pub struct HandshakeBuilder {
    scenario: String,
    tasks: Vec<SessionTask>,
    review_items: Vec<ReviewItem>,
    review_lesson: bool,
}

impl HandshakeBuilder {
    /// Builder around the author's scenario prompt.
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            ..Default::default()
        }
    }

    /// Lesson objectives.
    pub fn with_tasks(mut self, tasks: Vec<SessionTask>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Mark this a review lesson over `items`.
    pub fn with_review_items(mut self, items: Vec<ReviewItem>) -> Self {
        self.review_items = items;
        self.review_lesson = true;
        self
    }

    /// Mark this a review lesson even without an item list.
    pub fn review_lesson(mut self) -> Self {
        self.review_lesson = true;
        self
    }

    /// Assembled instruction string.
    pub fn instructions(&self) -> String {
        let mut sections = vec![self.scenario.trim().to_string()];

        if !self.tasks.is_empty() {
            let mut block = TASK_INSTRUCTIONS_HEADER.to_string();
            for task in &self.tasks {
                block.push_str(&format!("\n- task_id=\"{}\" → {}", task.id, task.text));
            }
            block.push('\n');
            block.push_str(TASK_INSTRUCTIONS_FOOTER);
            sections.push(block);
        }

        if self.review_lesson {
            sections.push(REVIEW_INSTRUCTIONS.to_string());
            if !self.review_items.is_empty() {
                sections.push(self.review_reference());
            }
        }

        sections.push(TRACKING_INSTRUCTIONS.to_string());
        sections.join("\n")
    }

    fn review_reference(&self) -> String {
        let mut block = String::from(
            "## REVIEW ITEM REFERENCE (for function calls)\n\
             Use these exact IDs when calling play_student_audio or mark_item_mastered:",
        );
        for item in &self.review_items {
            let audio = if item.has_audio { "HAS AUDIO" } else { "no audio" };
            block.push_str(&format!(
                "\n- ID: `{}` | \"{}\" | {}",
                item.id, item.correction, audio
            ));
        }
        block
    }

    /// Handshake with instructions and the tool declarations the lesson uses.
    pub fn build(&self) -> Handshake {
        let mut tools = base_tool_declarations();
        if !self.tasks.is_empty() {
            tools.push(task_tool_declaration());
        }
        if self.review_lesson {
            tools.extend(review_tool_declarations());
        }
        Handshake {
            instructions: self.instructions(),
            tools,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(handshake: &Handshake) -> Vec<&str> {
        handshake.tools.iter().map(|t| t.name.as_str()).collect()
    }

    #[test]
    fn test_plain_lesson() {
        let handshake = HandshakeBuilder::new("  You are a barista in Madrid.  ").build();

        assert!(handshake.instructions.starts_with("You are a barista in Madrid.\n"));
        assert!(handshake.instructions.contains("## Autonomous Tracking"));
        assert!(!handshake.instructions.contains("### Task Completion"));
        assert!(!handshake.instructions.contains("### Review Session Tools"));
        assert!(!names(&handshake).contains(&"mark_task_complete"));
        assert!(names(&handshake).contains(&"show_session_summary"));
    }

    #[test]
    fn test_task_lines() {
        let handshake = HandshakeBuilder::new("Scenario")
            .with_tasks(vec![
                SessionTask::new("task-1", "Greet the waiter"),
                SessionTask::new("task-2", "Order a coffee"),
            ])
            .build();

        assert!(handshake
            .instructions
            .contains("- task_id=\"task-1\" → Greet the waiter\n- task_id=\"task-2\" → Order a coffee"));
        assert!(names(&handshake).contains(&"mark_task_complete"));

        // Tasks come before the tracking block
        let tasks_at = handshake.instructions.find("### Task Completion").unwrap();
        let tracking_at = handshake.instructions.find("## Autonomous Tracking").unwrap();
        assert!(tasks_at < tracking_at);
    }

    #[test]
    fn test_review_lesson_reference() {
        let handshake = HandshakeBuilder::new("Review")
            .with_review_items(vec![
                ReviewItem {
                    id: "r1".to_string(),
                    correction: "Tengo hambre".to_string(),
                    has_audio: true,
                },
                ReviewItem {
                    id: "r2".to_string(),
                    correction: "Me llamo Ana".to_string(),
                    has_audio: false,
                },
            ])
            .build();

        assert!(handshake
            .instructions
            .contains("- ID: `r1` | \"Tengo hambre\" | HAS AUDIO"));
        assert!(handshake
            .instructions
            .contains("- ID: `r2` | \"Me llamo Ana\" | no audio"));
        assert!(names(&handshake).contains(&"play_student_audio"));
        assert!(names(&handshake).contains(&"mark_item_mastered"));
    }
}
