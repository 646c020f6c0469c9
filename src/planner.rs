use anyhow::{Result, bail};
use serde_json::json;
use tracing::{info, warn};

use crate::types::{ActionKind, PlanStep, RawAction, StructuredIntent, TaskKind};

/// How a plan was produced: from the intent's actions or a task template, or
/// from the fixed fallback plan after a planning failure.
#[derive(Debug, Clone)]
pub enum PlanOutcome {
    Planned(Vec<PlanStep>),
    Fallback(Vec<PlanStep>),
}

impl PlanOutcome {
    pub fn steps(&self) -> &[PlanStep] {
        match self {
            PlanOutcome::Planned(s) | PlanOutcome::Fallback(s) => s,
        }
    }

    pub fn into_steps(self) -> Vec<PlanStep> {
        match self {
            PlanOutcome::Planned(s) | PlanOutcome::Fallback(s) => s,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, PlanOutcome::Fallback(_))
    }
}

#[derive(Debug, Default)]
pub struct StepPlanner;

impl StepPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Turn an intent into an ordered, retry-annotated step list. A failure
    /// while building (e.g. the model emitted an action kind we do not know)
    /// yields the fixed fallback plan instead of an error.
    pub fn plan(&self, intent: &StructuredIntent) -> PlanOutcome {
        match self.build(intent) {
            Ok(steps) => {
                info!(task = %intent.task, steps = steps.len(), "planned execution steps");
                PlanOutcome::Planned(steps)
            }
            Err(err) => {
                warn!(task = %intent.task, error = %err, "planning failed, using fallback plan");
                PlanOutcome::Fallback(fallback_plan(intent))
            }
        }
    }

    fn build(&self, intent: &StructuredIntent) -> Result<Vec<PlanStep>> {
        let steps = if intent.actions.is_empty() {
            template_steps(intent.task)
        } else {
            convert_actions(&intent.actions)?
        };
        if steps.is_empty() {
            bail!("no steps produced for task {}", intent.task);
        }
        let steps = enhance(steps, intent);
        Ok(harden(steps))
    }
}

/// Convert model-supplied actions into steps. An unknown action kind is a
/// planning failure, which the caller turns into the fallback plan.
fn convert_actions(actions: &[RawAction]) -> Result<Vec<PlanStep>> {
    actions
        .iter()
        .map(|a| {
            let Some(kind) = ActionKind::parse(&a.action) else {
                bail!("unknown action kind: {:?}", a.action);
            };
            let mut step = PlanStep::new(kind);
            step.selector = a.selector.clone();
            step.value = a.value.clone();
            step.url = a.url.clone();
            step.timeout = a.timeout.unwrap_or(10);
            step.multiple = a.multiple;
            step.retries = a.retries.unwrap_or(3).max(1);
            Ok(step)
        })
        .collect()
}

/// Ordered skeleton of action kinds with default timeouts, per task kind.
fn template_steps(task: TaskKind) -> Vec<PlanStep> {
    let skeleton: &[(ActionKind, u64, bool)] = match task {
        TaskKind::Search => &[
            (ActionKind::Goto, 15, false),
            (ActionKind::Wait, 2, false),
            (ActionKind::Fill, 10, false),
            (ActionKind::Click, 10, false),
            (ActionKind::Wait, 5, false),
            (ActionKind::Extract, 10, true),
        ],
        TaskKind::Navigate => &[(ActionKind::Goto, 15, false), (ActionKind::Wait, 3, false)],
        TaskKind::Extract => &[
            (ActionKind::Goto, 15, false),
            (ActionKind::Wait, 3, false),
            (ActionKind::Extract, 10, true),
        ],
        TaskKind::FillForm => &[
            (ActionKind::Goto, 15, false),
            (ActionKind::Wait, 2, false),
            (ActionKind::Fill, 10, false),
            (ActionKind::Click, 10, false),
        ],
        TaskKind::Click => &[
            (ActionKind::Goto, 15, false),
            (ActionKind::Wait, 2, false),
            (ActionKind::Click, 10, false),
        ],
        TaskKind::Screenshot => &[
            (ActionKind::Goto, 15, false),
            (ActionKind::Wait, 3, false),
            (ActionKind::Screenshot, 5, false),
        ],
    };

    skeleton
        .iter()
        .map(|&(action, timeout, multiple)| {
            let mut step = PlanStep::new(action);
            step.timeout = timeout;
            step.multiple = multiple;
            step
        })
        .collect()
}

/// Fill in selectors, values and URLs the skeleton left open.
fn enhance(steps: Vec<PlanStep>, intent: &StructuredIntent) -> Vec<PlanStep> {
    steps
        .into_iter()
        .enumerate()
        .map(|(i, mut step)| {
            match step.action {
                ActionKind::Goto => {
                    if step.url.is_none() {
                        step.url = intent.target_url.clone();
                    }
                }
                ActionKind::Fill => {
                    step.selector = Some(resolve_selector(intent, "search_box"));
                    step.value = Some(intent.query.clone());
                }
                ActionKind::Click => {
                    step.selector = Some(resolve_selector(intent, "search_button"));
                }
                ActionKind::Extract => {
                    step.selector = Some(resolve_selector(intent, "results"));
                    step.multiple = true;
                }
                ActionKind::Wait | ActionKind::Screenshot => {}
            }
            step.metadata
                .insert("task".into(), json!(intent.task.as_str()));
            step.metadata.insert("query".into(), json!(intent.query));
            step.metadata.insert("step_number".into(), json!(i + 1));
            step
        })
        .collect()
}

/// Look up a named selector role, falling back to a fixed table of generic
/// comma-separated CSS alternatives.
fn resolve_selector(intent: &StructuredIntent, role: &str) -> String {
    if let Some(selector) = intent.selectors.get(role) {
        return selector.clone();
    }
    match role {
        "search_box" => "input[name=\"q\"], input[type=\"search\"], input[placeholder*=\"search\"]",
        "search_button" => "button[type=\"submit\"], input[type=\"submit\"], .search-button",
        "results" => ".result, .search-result, .product-item, .item",
        "title" => "h1, h2, h3, .title, .name",
        "price" => ".price, .cost, [class*=\"price\"]",
        "link" => "a, .link",
        _ => "body",
    }
    .to_string()
}

/// Raise retry budgets and timeouts for fragile actions, and insert a short
/// stabilization wait after every click and fill.
fn harden(steps: Vec<PlanStep>) -> Vec<PlanStep> {
    let mut hardened = Vec::with_capacity(steps.len());
    for mut step in steps {
        if matches!(
            step.action,
            ActionKind::Click | ActionKind::Fill | ActionKind::Extract
        ) {
            step.retries = step.retries.max(3);
        }
        if step.action == ActionKind::Goto {
            step.timeout = step.timeout.max(15);
        }

        let needs_settle = matches!(step.action, ActionKind::Click | ActionKind::Fill);
        hardened.push(step);
        if needs_settle {
            let mut wait = PlanStep::new(ActionKind::Wait);
            wait.timeout = 2;
            wait.metadata
                .insert("purpose".into(), json!("wait_after_action"));
            hardened.push(wait);
        }
    }
    hardened
}

/// Fixed plan used when planning itself fails.
fn fallback_plan(intent: &StructuredIntent) -> Vec<PlanStep> {
    let mark = |mut step: PlanStep| {
        step.metadata.insert("fallback".into(), json!(true));
        step
    };

    let mut goto = PlanStep::new(ActionKind::Goto);
    goto.url = Some(
        intent
            .target_url
            .clone()
            .unwrap_or_else(|| "https://www.google.com".into()),
    );
    goto.timeout = 15;

    let mut wait = PlanStep::new(ActionKind::Wait);
    wait.timeout = 3;

    let mut steps = vec![mark(goto), mark(wait)];

    if intent.task == TaskKind::Search {
        let mut fill = PlanStep::new(ActionKind::Fill);
        fill.selector = Some("input[name=\"q\"]".into());
        fill.value = Some(intent.query.clone());

        let mut click = PlanStep::new(ActionKind::Click);
        click.selector = Some("button[type=\"submit\"]".into());

        let mut settle = PlanStep::new(ActionKind::Wait);
        settle.timeout = 5;

        let mut extract = PlanStep::new(ActionKind::Extract);
        extract.selector = Some("body".into());
        extract.multiple = true;

        steps.extend([mark(fill), mark(click), mark(settle), mark(extract)]);
    }

    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::validate;
    use crate::types::Filters;
    use std::collections::HashMap;

    fn intent(task: TaskKind, actions: Vec<RawAction>) -> StructuredIntent {
        validate(StructuredIntent {
            task,
            query: "laptops under 50000".into(),
            filters: Filters::default(),
            count: 5,
            fields: vec!["title".into(), "url".into()],
            target_url: None,
            selectors: HashMap::new(),
            actions,
            raw_instruction: "search laptops under 50000".into(),
        })
    }

    #[test]
    fn plan_honors_retry_and_timeout_floors() {
        for task in [
            TaskKind::Search,
            TaskKind::Navigate,
            TaskKind::Extract,
            TaskKind::FillForm,
            TaskKind::Click,
            TaskKind::Screenshot,
        ] {
            let steps = StepPlanner::new().plan(&intent(task, vec![])).into_steps();
            assert!(!steps.is_empty());
            for step in &steps {
                assert!(step.retries >= 1);
                match step.action {
                    ActionKind::Click | ActionKind::Fill | ActionKind::Extract => {
                        assert!(step.retries >= 3)
                    }
                    ActionKind::Goto => {
                        assert!(step.timeout >= 15);
                        assert!(step.url.as_deref().is_some_and(|u| !u.is_empty()));
                    }
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn click_and_fill_are_followed_by_stabilization_waits() {
        let steps = StepPlanner::new()
            .plan(&intent(TaskKind::Search, vec![]))
            .into_steps();
        for (i, step) in steps.iter().enumerate() {
            if matches!(step.action, ActionKind::Click | ActionKind::Fill) {
                assert_eq!(steps[i + 1].action, ActionKind::Wait, "no wait after {i}");
            }
        }
    }

    #[test]
    fn explicit_actions_convert_directly() {
        let actions = vec![
            RawAction {
                action: "goto".into(),
                url: Some("https://shop.example".into()),
                ..Default::default()
            },
            RawAction {
                action: "extract".into(),
                ..Default::default()
            },
        ];
        let outcome = StepPlanner::new().plan(&intent(TaskKind::Extract, actions));
        assert!(!outcome.is_fallback());
        let steps = outcome.into_steps();
        assert_eq!(steps[0].action, ActionKind::Goto);
        assert_eq!(steps[0].url.as_deref(), Some("https://shop.example"));
        let extract = steps.iter().find(|s| s.action == ActionKind::Extract).unwrap();
        // Extraction always gets the resolved results-role selector.
        assert_eq!(
            extract.selector.as_deref(),
            Some(".result, .search-result, .product-item, .item")
        );
        assert!(extract.multiple);
    }

    #[test]
    fn unknown_action_kind_triggers_fallback_plan() {
        let actions = vec![RawAction {
            action: "teleport".into(),
            ..Default::default()
        }];
        let outcome = StepPlanner::new().plan(&intent(TaskKind::Search, actions));
        assert!(outcome.is_fallback());
        let steps = outcome.into_steps();
        assert_eq!(steps[0].action, ActionKind::Goto);
        assert!(steps.iter().any(|s| s.action == ActionKind::Extract));
        assert!(steps
            .iter()
            .all(|s| s.metadata.get("fallback") == Some(&json!(true))));
    }

    #[test]
    fn intent_selectors_win_over_fallback_table() {
        let mut custom = intent(TaskKind::Search, vec![]);
        custom.actions.clear();
        custom
            .selectors
            .insert("results".into(), "[data-testid=\"result\"]".into());
        let steps = StepPlanner::new().plan(&custom).into_steps();
        let extract = steps.iter().find(|s| s.action == ActionKind::Extract).unwrap();
        assert_eq!(extract.selector.as_deref(), Some("[data-testid=\"result\"]"));
    }
}
