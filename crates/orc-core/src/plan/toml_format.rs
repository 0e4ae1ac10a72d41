//! TOML format for `orc plan create --from-toml` (§4.9), mapped directly
//! onto the on-disk `plan.toml` shape via `serde` + the `toml` crate.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanToml {
    pub plan: PlanMeta,
    #[serde(default)]
    pub tasks: Vec<TaskToml>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanMeta {
    /// Human-readable plan name, carried into each synthesized task's
    /// timeline for traceability; not itself a stored entity.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskToml {
    /// Unique name within the plan file, used as a `depends_on` referent.
    /// Not the persisted task id (minted fresh on materialization).
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// One of feature/bugfix/review/refactor/analysis/plan/audit. Left
    /// unset to let the keyword classifier decide from title+description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default = "default_sla_tier")]
    pub sla_tier: String,
    #[serde(default = "default_risk_level")]
    pub risk_level: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_plan: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_engine")]
    pub engine: String,
    #[serde(default)]
    pub plan_mode: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_priority() -> String {
    "medium".to_string()
}

fn default_sla_tier() -> String {
    "standard".to_string()
}

fn default_risk_level() -> String {
    "medium".to_string()
}

fn default_engine() -> String {
    "auto".to_string()
}

fn default_max_retries() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_minimal_plan() {
        let toml_str = r#"
[plan]
name = "Add login"

[[tasks]]
name = "impl"
title = "Implement login"
"#;
        let plan: PlanToml = toml::from_str(toml_str).expect("should parse");
        assert_eq!(plan.plan.name, "Add login");
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].priority, "medium");
        assert_eq!(plan.tasks[0].engine, "auto");
        assert_eq!(plan.tasks[0].max_retries, 3);
    }

    #[test]
    fn deserialize_full_plan() {
        let toml_str = r#"
[plan]
name = "Add login"

[[tasks]]
name = "design"
title = "Design the login flow"
task_type = "plan"
priority = "high"
sla_tier = "urgent"
risk_level = "high"
plan_mode = true

[[tasks]]
name = "impl"
title = "Implement login"
depends_on = ["design"]
acceptance_criteria = ["users can log in", "sessions persist"]
rollback_plan = "revert the merge commit"
engine = "A"
max_retries = 1
"#;
        let plan: PlanToml = toml::from_str(toml_str).expect("should parse");
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[0].task_type.as_deref(), Some("plan"));
        assert!(plan.tasks[0].plan_mode);
        assert_eq!(plan.tasks[1].depends_on, vec!["design".to_string()]);
        assert_eq!(plan.tasks[1].max_retries, 1);
    }
}
