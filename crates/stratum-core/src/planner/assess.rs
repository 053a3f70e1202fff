//! Plan assessment: effort estimates, complexity, risk, and confidence.

use std::collections::HashSet;

use crate::plan::{Complexity, ExperienceLevel, PlanningContext, RiskLevel, SizeClass, Task};

/// Tools whose calls change the workspace
const MUTATING_TOOLS: &[&str] = &["write", "bash"];

/// Where the task drafts came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftSource {
    Model,
    Heuristic,
}

/// Scale a base estimate in minutes by project size and experience.
pub fn scaled_estimate(base_minutes: u32, ctx: &PlanningContext) -> u32 {
    let factor = ctx.project_size.effort_factor() * ctx.experience.effort_factor();
    (base_minutes as f64 * factor).round().max(1.0) as u32
}

fn touched_files(tasks: &[Task]) -> usize {
    tasks
        .iter()
        .flat_map(|t| t.files_involved.iter())
        .collect::<HashSet<_>>()
        .len()
}

pub fn complexity(tasks: &[Task], ctx: &PlanningContext) -> Complexity {
    let score = tasks.len() + touched_files(tasks) / 3;
    let base = match score {
        0..=2 => Complexity::Simple,
        3..=4 => Complexity::Moderate,
        _ => Complexity::Complex,
    };
    match (base, ctx.project_size) {
        (Complexity::Simple, SizeClass::Large) => Complexity::Moderate,
        (Complexity::Moderate, SizeClass::Large) => Complexity::Complex,
        (level, _) => level,
    }
}

fn uses_mutating_tools(task: &Task) -> bool {
    task.tools_required
        .iter()
        .map(String::as_str)
        .chain(task.tool_calls.iter().map(|c| c.tool_name.as_str()))
        .any(|name| MUTATING_TOOLS.contains(&name))
}

pub fn risk_level(tasks: &[Task], complexity: Complexity, ctx: &PlanningContext) -> RiskLevel {
    let mut score = 0;
    if tasks.iter().any(uses_mutating_tools) {
        score += 1;
    }
    if ctx.project_size == SizeClass::Large {
        score += 1;
    }
    if complexity == Complexity::Complex {
        score += 1;
    }
    match score {
        0 => RiskLevel::Low,
        1 => RiskLevel::Medium,
        _ => RiskLevel::High,
    }
}

/// Confidence in `[0.1, 0.95]`
pub fn confidence(
    source: DraftSource,
    complexity: Complexity,
    risk: RiskLevel,
    ctx: &PlanningContext,
) -> f64 {
    let mut confidence: f64 = match source {
        DraftSource::Model => 0.8,
        DraftSource::Heuristic => 0.6,
    };
    confidence += match complexity {
        Complexity::Simple => 0.05,
        Complexity::Moderate => 0.0,
        Complexity::Complex => -0.1,
    };
    if risk == RiskLevel::High {
        confidence -= 0.1;
    }
    if ctx.verify_command.is_some() {
        confidence += 0.1;
    }
    if ctx.experience == ExperienceLevel::Beginner {
        confidence -= 0.05;
    }
    confidence.clamp(0.1, 0.95)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::ToolCall;
    use crate::plan::TaskType;
    use serde_json::json;

    fn task(id: &str, tools: &[&str]) -> Task {
        let mut task = Task::new(id, id, TaskType::Implementation);
        task.tools_required = tools.iter().map(|s| s.to_string()).collect();
        task
    }

    #[test]
    fn estimates_scale_with_context() {
        let mut ctx = PlanningContext::default();
        assert_eq!(scaled_estimate(30, &ctx), 30);

        ctx.project_size = SizeClass::Large;
        ctx.experience = ExperienceLevel::Beginner;
        assert_eq!(scaled_estimate(30, &ctx), 72);

        ctx.project_size = SizeClass::Small;
        ctx.experience = ExperienceLevel::Expert;
        assert_eq!(scaled_estimate(1, &ctx), 1);
    }

    #[test]
    fn complexity_grows_with_tasks_and_size() {
        let mut ctx = PlanningContext::default();
        let two = vec![task("a", &[]), task("b", &[])];
        let five: Vec<Task> = (0..5).map(|i| task(&i.to_string(), &[])).collect();

        assert_eq!(complexity(&two, &ctx), Complexity::Simple);
        assert_eq!(complexity(&five, &ctx), Complexity::Complex);

        ctx.project_size = SizeClass::Large;
        assert_eq!(complexity(&two, &ctx), Complexity::Moderate);
    }

    #[test]
    fn mutating_calls_raise_risk() {
        let ctx = PlanningContext::default();
        let read_only = vec![task("a", &["read", "list"])];
        assert_eq!(risk_level(&read_only, Complexity::Simple, &ctx), RiskLevel::Low);

        let mut shell = task("b", &[]);
        shell.tool_calls.push(ToolCall::new("c", "bash", json!({"command": "make"})));
        assert_eq!(risk_level(&[shell], Complexity::Simple, &ctx), RiskLevel::Medium);

        let writes = vec![task("c", &["write"])];
        assert_eq!(risk_level(&writes, Complexity::Complex, &ctx), RiskLevel::High);
    }

    #[test]
    fn confidence_is_bounded() {
        let mut ctx = PlanningContext::default();
        let model = confidence(DraftSource::Model, Complexity::Simple, RiskLevel::Low, &ctx);
        let heuristic = confidence(DraftSource::Heuristic, Complexity::Simple, RiskLevel::Low, &ctx);
        assert!(model > heuristic);

        ctx.verify_command = Some("make test".into());
        let verified = confidence(DraftSource::Model, Complexity::Simple, RiskLevel::Low, &ctx);
        assert!(verified <= 0.95);

        ctx.verify_command = None;
        ctx.experience = ExperienceLevel::Beginner;
        let low = confidence(DraftSource::Heuristic, Complexity::Complex, RiskLevel::High, &ctx);
        assert!((low - 0.35).abs() < 1e-9);
    }
}
