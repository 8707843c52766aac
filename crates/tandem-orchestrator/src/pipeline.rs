use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Running,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Architect,
    Developer,
    Reviewer,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Architect => "architect",
            Self::Developer => "developer",
            Self::Reviewer => "reviewer",
        }
    }

    pub fn system_prompt(self) -> &'static str {
        match self {
            Self::Architect => {
                "You are the architect agent of a coding assistant. Break the \
                 user's request into a concrete technical plan: components, \
                 data flow, and the order of implementation. Be specific and \
                 concise; do not write the implementation yet."
            }
            Self::Developer => {
                "You are the developer agent of a coding assistant. Implement \
                 the approved plan from the conversation. Produce complete, \
                 working code with brief explanations. Use the available \
                 tools when a file or command is needed."
            }
            Self::Reviewer => {
                "You are the reviewer agent of a coding assistant. Review the \
                 implementation above for correctness, edge cases and clarity. \
                 List concrete issues with suggested fixes, then give a short \
                 overall verdict."
            }
        }
    }
}

/// Immutable once the pipeline is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub role: AgentRole,
    #[serde(rename = "taskType")]
    pub task_type: String,
    pub title: String,
    pub description: String,
    #[serde(rename = "requiresApproval")]
    pub requires_approval: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineError {
    #[serde(rename = "stageIndex")]
    pub stage_index: usize,
    pub message: String,
}

/// Owned exclusively by the orchestrator for its lifetime; external readers
/// receive clones, never a mutable handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    pub description: String,
    pub stages: Vec<Stage>,
    #[serde(rename = "currentStageIndex")]
    pub current_stage_index: usize,
    pub status: PipelineStatus,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "completedAt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PipelineError>,
}

impl Pipeline {
    pub fn new(id: String, name: String, description: String, stages: Vec<Stage>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            description,
            stages,
            current_stage_index: 0,
            status: PipelineStatus::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
        }
    }
}

const TRIGGER_VERBS: &[&str] = &["build", "implement", "create", "develop", "make", "write"];

const TRIGGER_NOUNS: &[&str] = &[
    "app",
    "application",
    "feature",
    "service",
    "system",
    "api",
    "module",
    "component",
    "website",
    "tool",
    "pipeline",
    "integration",
];

/// Fixed trigger table, case-insensitive: a build-style verb plus an
/// artifact noun marks a request as multi-step.
pub fn is_multi_step_request(text: &str) -> bool {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|character: char| !character.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect();

    let has_verb = words
        .iter()
        .any(|word| TRIGGER_VERBS.contains(word));
    let has_noun = words
        .iter()
        .any(|word| TRIGGER_NOUNS.contains(word));
    has_verb && has_noun
}

/// Fixed architect -> developer -> reviewer template. The architect stage
/// gates on approval so the user signs off on the plan before any code is
/// produced; the reviewer is final and auto-completes the pipeline.
pub fn plan_stages(request_text: &str) -> Vec<Stage> {
    let task_type = infer_task_type(request_text);
    vec![
        Stage {
            role: AgentRole::Architect,
            task_type: task_type.to_string(),
            title: "Plan".to_string(),
            description: "Draft the technical plan for the request".to_string(),
            requires_approval: true,
        },
        Stage {
            role: AgentRole::Developer,
            task_type: task_type.to_string(),
            title: "Implement".to_string(),
            description: "Implement the approved plan".to_string(),
            requires_approval: false,
        },
        Stage {
            role: AgentRole::Reviewer,
            task_type: task_type.to_string(),
            title: "Review".to_string(),
            description: "Review the implementation".to_string(),
            requires_approval: false,
        },
    ]
}

fn infer_task_type(text: &str) -> &'static str {
    let lowered = text.to_lowercase();
    for noun in TRIGGER_NOUNS {
        if lowered.contains(noun) {
            return match *noun {
                "app" | "application" | "website" => "application",
                "api" | "service" | "system" | "integration" | "pipeline" => "service",
                _ => "feature",
            };
        }
    }
    "feature"
}
