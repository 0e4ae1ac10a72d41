//! Keyword classifier and task-type to engine routing table (§4.3),
//! grounded in the source project's `ROUTING_RULES` / `dispatcher.route_task`.

use orc_store::models::{Engine, TaskType};

struct RoutingRule {
    task_type: TaskType,
    keywords: &'static [&'static str],
}

/// Rules are matched in order; the first whose keyword set intersects the
/// lowercased title+description text wins. No match defaults to `feature`.
const RULES: &[RoutingRule] = &[
    RoutingRule {
        task_type: TaskType::Review,
        keywords: &["review", "code review", "pr review"],
    },
    RoutingRule {
        task_type: TaskType::Refactor,
        keywords: &["refactor", "cleanup", "clean up"],
    },
    RoutingRule {
        task_type: TaskType::Bugfix,
        keywords: &["bug", "fix", "crash", "error", "exception"],
    },
    RoutingRule {
        task_type: TaskType::Audit,
        keywords: &["audit"],
    },
    RoutingRule {
        task_type: TaskType::Analysis,
        keywords: &["analyze", "analysis", "scan", "detect"],
    },
    RoutingRule {
        task_type: TaskType::Plan,
        keywords: &["plan", "design", "architecture", "decompose"],
    },
    RoutingRule {
        task_type: TaskType::Feature,
        keywords: &["implement", "add", "create", "build", "feature"],
    },
];

/// Classify a task's type from its title and description text.
pub fn classify(title: &str, description: &str) -> TaskType {
    let haystack = format!("{title} {description}").to_lowercase();
    for rule in RULES {
        if rule.keywords.iter().any(|kw| haystack.contains(kw)) {
            return rule.task_type;
        }
    }
    TaskType::Feature
}

/// Preferred engine for a task type (§4.3: feature/bugfix/plan -> A,
/// review/refactor/analysis/audit -> B).
pub fn preferred_engine(task_type: TaskType) -> Engine {
    match task_type {
        TaskType::Feature | TaskType::Bugfix | TaskType::Plan => Engine::A,
        TaskType::Review | TaskType::Refactor | TaskType::Analysis | TaskType::Audit => Engine::B,
    }
}

/// The other engine — always the fallback for any type.
pub fn opposite_engine(engine: Engine) -> Engine {
    match engine {
        Engine::A => Engine::B,
        Engine::B => Engine::A,
        Engine::Auto => Engine::A,
    }
}

/// Resolve the concrete engine a task should be routed to. An explicit
/// non-`auto` hint always wins over the classifier's preference.
pub fn route(task_type: TaskType, engine_hint: Engine) -> Engine {
    match engine_hint {
        Engine::Auto => preferred_engine(task_type),
        explicit => explicit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_review_before_bugfix_on_overlap() {
        assert_eq!(classify("Review the fix for the crash", ""), TaskType::Review);
    }

    #[test]
    fn classifies_bugfix() {
        assert_eq!(classify("Fix null pointer crash", "users see a crash on login"), TaskType::Bugfix);
    }

    #[test]
    fn defaults_to_feature() {
        assert_eq!(classify("Do the thing", "no distinctive keywords here"), TaskType::Feature);
    }

    #[test]
    fn explicit_hint_overrides_classification() {
        assert_eq!(route(TaskType::Review, Engine::A), Engine::A);
    }

    #[test]
    fn auto_hint_uses_preference_table() {
        assert_eq!(route(TaskType::Review, Engine::Auto), Engine::B);
        assert_eq!(route(TaskType::Feature, Engine::Auto), Engine::A);
    }

    #[test]
    fn opposite_is_involutive() {
        assert_eq!(opposite_engine(opposite_engine(Engine::A)), Engine::A);
        assert_eq!(opposite_engine(opposite_engine(Engine::B)), Engine::B);
    }
}
