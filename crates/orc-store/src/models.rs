//! Persisted data model: projects, tasks, events, and the document
//! envelopes that wrap them on disk.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $s:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let s = match self {
                    $(Self::$variant => $s),+
                };
                f.write_str(s)
            }
        }

        impl FromStr for $name {
            type Err = paste_error::EnumParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err(paste_error::EnumParseError {
                        type_name: stringify!($name),
                        value: other.to_owned(),
                    }),
                }
            }
        }
    };
}

/// Error returned when parsing any of this module's string-backed enums
/// from an unrecognised value.
pub mod paste_error {
    use std::fmt;

    #[derive(Debug, Clone)]
    pub struct EnumParseError {
        pub type_name: &'static str,
        pub value: String,
    }

    impl fmt::Display for EnumParseError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "invalid {}: {:?}", self.type_name, self.value)
        }
    }

    impl std::error::Error for EnumParseError {}
}

pub use paste_error::EnumParseError;

string_enum! {
    /// Lifecycle status of a [`Project`].
    ProjectStatus {
        Draft => "draft",
        Active => "active",
        OnHold => "on_hold",
        Completed => "completed",
        Archived => "archived",
    }
}

string_enum! {
    /// Lifecycle status of a [`Task`].
    TaskStatus {
        Pending => "pending",
        PlanReview => "plan_review",
        BlockedBySubtasks => "blocked_by_subtasks",
        InProgress => "in_progress",
        Reviewing => "reviewing",
        Completed => "completed",
        Failed => "failed",
        Cancelled => "cancelled",
    }
}

string_enum! {
    /// What kind of work a task represents, used to route it to an engine.
    TaskType {
        Feature => "feature",
        Bugfix => "bugfix",
        Review => "review",
        Refactor => "refactor",
        Analysis => "analysis",
        Plan => "plan",
        Audit => "audit",
    }
}

string_enum! {
    Priority {
        High => "high",
        Medium => "medium",
        Low => "low",
    }
}

string_enum! {
    SlaTier {
        Urgent => "urgent",
        Expedite => "expedite",
        Standard => "standard",
    }
}

string_enum! {
    RiskLevel {
        Low => "low",
        Medium => "medium",
        High => "high",
    }
}

string_enum! {
    /// Which coding-agent CLI a task is (or should be) routed to.
    ///
    /// `Auto` is only ever an author *hint*; once a task is dispatched,
    /// `routed_engine` always holds a concrete [`Engine`].
    Engine {
        Auto => "auto",
        A => "A",
        B => "B",
    }
}

string_enum! {
    ReviewStatus {
        Pending => "pending",
        Completed => "completed",
        Approved => "approved",
        ChangesRequested => "changes_requested",
    }
}

string_enum! {
    EventLevel {
        Info => "info",
        Warning => "warning",
        Error => "error",
        Critical => "critical",
    }
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub repo_path: String,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub attempt: u32,
    pub worker_id: String,
    pub engine: Engine,
    pub lease_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: Option<TaskStatus>,
    pub exit_code: Option<i32>,
    pub error_tail: Option<String>,
    #[serde(default)]
    pub commit_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub at: DateTime<Utc>,
    pub event: String,
    #[serde(default)]
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanQuestion {
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    pub selected: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub severity: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub description: String,
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResult {
    pub issues: Vec<ReviewIssue>,
    pub summary: Option<String>,
    pub reviewed_at: DateTime<Utc>,
    pub round: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub sub_tasks: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,

    pub title: String,
    #[serde(default)]
    pub description: String,
    pub task_type: TaskType,
    pub priority: Priority,
    pub sla_tier: SlaTier,
    pub risk_level: RiskLevel,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub rollback_plan: Option<String>,

    pub engine: Engine,
    pub routed_engine: Option<Engine>,
    pub fallback_reason: Option<String>,

    pub status: TaskStatus,
    pub assigned_worker: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub retry_after: Option<DateTime<Utc>>,
    pub last_exit_code: Option<i32>,
    #[serde(default)]
    pub commit_ids: Vec<String>,
    pub error_log: Option<String>,

    #[serde(default)]
    pub plan_mode: bool,
    pub plan_content: Option<String>,
    #[serde(default)]
    pub plan_questions: Vec<PlanQuestion>,
    pub review_status: Option<ReviewStatus>,
    pub review_engine: Option<Engine>,
    pub review_result: Option<ReviewResult>,
    #[serde(default)]
    pub review_round: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub _review_feedback: Option<String>,

    #[serde(default)]
    pub attempts: Vec<Attempt>,
    #[serde(default)]
    pub timeline: Vec<TimelineEntry>,
    pub blocked_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_max_retries() -> u32 {
    3
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub event_type: String,
    pub level: EventLevel,
    pub task_id: Option<String>,
    pub worker_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, level: EventLevel, message: impl Into<String>) -> Self {
        Self {
            id: format!("evt-{}", Uuid::new_v4().simple()),
            event_type: event_type.into(),
            level,
            task_id: None,
            worker_id: None,
            message: message.into(),
            meta: serde_json::Value::Null,
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }
}

// ---------------------------------------------------------------------------
// Meta / document envelopes
// ---------------------------------------------------------------------------

/// The document schema version written to every persisted file.
pub const SCHEMA_VERSION: u32 = 2;

/// Maximum number of events retained per project document.
pub const EVENT_CAP: usize = 2000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub last_updated: DateTime<Utc>,
    pub total_completed: u64,
    pub success_rate: f64,
    pub a_tasks: u64,
    pub b_tasks: u64,
    pub schema_version: u32,
}

impl Default for Meta {
    fn default() -> Self {
        Self {
            last_updated: Utc::now(),
            total_completed: 0,
            success_rate: 0.0,
            a_tasks: 0,
            b_tasks: 0,
            schema_version: SCHEMA_VERSION,
        }
    }
}

/// The full per-project document: `projects/<id>/tasks.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDocument {
    #[serde(default = "schema_version_default")]
    pub schema_version: u32,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub events: Vec<Event>,
    #[serde(default)]
    pub meta: Meta,
}

fn schema_version_default() -> u32 {
    SCHEMA_VERSION
}

impl Default for ProjectDocument {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            tasks: Vec::new(),
            events: Vec::new(),
            meta: Meta::default(),
        }
    }
}

impl ProjectDocument {
    /// Recompute `meta` from the current `tasks`/`events`, cap the event
    /// ring at [`EVENT_CAP`], and stamp `last_updated`.
    pub fn recompute_meta(&mut self) {
        if self.events.len() > EVENT_CAP {
            let excess = self.events.len() - EVENT_CAP;
            self.events.drain(0..excess);
        }

        let completed = self.tasks.iter().filter(|t| t.status == TaskStatus::Completed).count() as u64;
        let failed = self.tasks.iter().filter(|t| t.status == TaskStatus::Failed).count() as u64;
        let a_tasks = self
            .tasks
            .iter()
            .filter(|t| t.routed_engine == Some(Engine::A))
            .count() as u64;
        let b_tasks = self
            .tasks
            .iter()
            .filter(|t| t.routed_engine == Some(Engine::B))
            .count() as u64;

        self.meta = Meta {
            last_updated: Utc::now(),
            total_completed: completed,
            success_rate: if completed + failed == 0 {
                0.0
            } else {
                completed as f64 / (completed + failed) as f64
            },
            a_tasks,
            b_tasks,
            schema_version: SCHEMA_VERSION,
        };
    }

    pub fn find_task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn find_task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }
}

/// The top-level registry: `projects.json`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectsRegistry {
    #[serde(default)]
    pub projects: Vec<Project>,
}
