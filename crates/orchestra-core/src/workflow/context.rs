//! Per-run execution context.
//!
//! `RunContext` holds the workflow input and the outputs of completed stages.
//! The engine only merges a level's outputs after the whole level finishes,
//! so stages never observe a sibling's output.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use super::template::{PathLookup, traverse};

#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub workflow_name: String,
    input: Value,
    stage_outputs: HashMap<String, Value>,
}

impl RunContext {
    pub fn new(run_id: Uuid, workflow_name: impl Into<String>, input: Value) -> Self {
        Self {
            run_id,
            workflow_name: workflow_name.into(),
            input,
            stage_outputs: HashMap::new(),
        }
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn set_stage_output(&mut self, stage_id: impl Into<String>, output: Value) {
        self.stage_outputs.insert(stage_id.into(), output);
    }

    pub fn stage_output(&self, stage_id: &str) -> Option<&Value> {
        self.stage_outputs.get(stage_id)
    }

    pub fn completed_stage_count(&self) -> usize {
        self.stage_outputs.len()
    }
}

impl PathLookup for RunContext {
    /// `workflow.input.<path>` reads the run input; `<stage>.output.<path>`
    /// reads a completed stage's output.
    fn lookup(&self, path: &[String]) -> Option<&Value> {
        let (root, rest) = path.split_first()?;
        let (field, rest) = rest.split_first()?;
        if root == "workflow" {
            return (field == "input").then(|| traverse(&self.input, rest)).flatten();
        }
        if field != "output" {
            return None;
        }
        traverse(self.stage_outputs.get(root.as_str())?, rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::template::resolve_input;
    use serde_json::json;

    fn ctx() -> RunContext {
        let mut ctx = RunContext::new(Uuid::nil(), "digest", json!({"topic": "rust"}));
        ctx.set_stage_output("s1", json!({"summary": "ok"}));
        ctx
    }

    fn path(p: &str) -> Vec<String> {
        p.split('.').map(String::from).collect()
    }

    #[test]
    fn looks_up_input_and_outputs() {
        let ctx = ctx();
        assert_eq!(ctx.lookup(&path("workflow.input.topic")), Some(&json!("rust")));
        assert_eq!(ctx.lookup(&path("s1.output.summary")), Some(&json!("ok")));
        assert_eq!(ctx.lookup(&path("s1.output")), Some(&json!({"summary": "ok"})));
        assert_eq!(ctx.lookup(&path("workflow.input")), Some(&json!({"topic": "rust"})));
    }

    #[test]
    fn rejects_other_roots_and_fields() {
        let ctx = ctx();
        assert_eq!(ctx.lookup(&path("workflow.output.topic")), None);
        assert_eq!(ctx.lookup(&path("s1.input.summary")), None);
        assert_eq!(ctx.lookup(&path("s2.output.summary")), None);
        assert_eq!(ctx.lookup(&path("s1")), None);
    }

    #[test]
    fn resolves_stage_template() {
        let out = resolve_input(&json!({"text": "${s1.output.summary}"}), &ctx());
        assert_eq!(out, json!({"text": "ok"}));
    }
}
