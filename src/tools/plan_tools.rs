use std::sync::Arc;

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{FunctionTool, Tool, tool_error_payload};
use crate::plan::{AppendOutcome, CompleteOutcome, NextStep, TaskPlanStore};

pub const CREATE_TASK_PLAN: &str = "create_task_plan";
pub const READ_TASK_PLAN: &str = "read_task_plan";
pub const MARK_TASK_COMPLETED: &str = "mark_task_completed";
pub const APPEND_TASK_STEP: &str = "append_task_step";

const NO_PLAN_MESSAGE: &str = "No active task plan. Create one with create_task_plan first.";

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreatePlanArgs {
    /// Ordered step descriptions.
    pub steps: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MarkCompletedArgs {
    /// Id of the step that was finished.
    pub step_id: u64,
    /// Short summary of what the step produced.
    #[serde(default)]
    pub result_summary: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AppendStepArgs {
    /// Description of the new step.
    pub step_description: String,
}

fn parse_args<T: for<'de> Deserialize<'de>>(tool: &str, args: Value) -> Result<T, Value> {
    serde_json::from_value(args).map_err(|err| {
        tool_error_payload("invalid_args", format!("invalid arguments for {tool}: {err}"))
    })
}

pub fn create_task_plan_response(store: &TaskPlanStore, args: Value) -> Value {
    let args = match parse_args::<CreatePlanArgs>(CREATE_TASK_PLAN, args) {
        Ok(args) => args,
        Err(payload) => return payload,
    };
    let steps = args
        .steps
        .into_iter()
        .map(|step| step.trim().to_string())
        .filter(|step| !step.is_empty())
        .collect::<Vec<_>>();
    if steps.is_empty() {
        return tool_error_payload("invalid_args", "'steps' must contain at least one step");
    }

    match store.create(steps) {
        Ok(plan) => json!({
            "status": "created",
            "total": plan.steps.len(),
            "steps": plan.steps.iter().map(|step| json!({"id": step.id, "desc": step.desc})).collect::<Vec<_>>(),
            "next": "Call read_task_plan to fetch the first step."
        }),
        Err(err) => tool_error_payload("plan_write_failed", format!("{err:#}")),
    }
}

pub fn read_task_plan_response(store: &TaskPlanStore) -> Value {
    match store.read_next() {
        Ok(NextStep::NoPlan) => json!({ "status": "no_plan", "message": NO_PLAN_MESSAGE }),
        Ok(NextStep::Pending {
            step,
            completed,
            total,
            remaining,
        }) => json!({
            "status": "in_progress",
            "progress": format!("{completed}/{total}"),
            "current_step": { "id": step.id, "desc": step.desc },
            "remaining_count": remaining,
            "instruction": "Execute only this step, then call mark_task_completed with its id."
        }),
        Ok(NextStep::Finished { completed, total }) => json!({
            "status": "completed",
            "progress": format!("{completed}/{total}"),
            "message": format!("All steps completed ({completed}/{total}). Report the final result and end with STATE: DONE.")
        }),
        Err(err) => tool_error_payload("plan_read_failed", format!("{err:#}")),
    }
}

pub fn mark_task_completed_response(store: &TaskPlanStore, args: Value) -> Value {
    let args = match parse_args::<MarkCompletedArgs>(MARK_TASK_COMPLETED, args) {
        Ok(args) => args,
        Err(payload) => return payload,
    };
    match store.complete(args.step_id, &args.result_summary) {
        Ok(CompleteOutcome::NoPlan) => json!({ "status": "no_plan", "message": NO_PLAN_MESSAGE }),
        Ok(CompleteOutcome::NotFound(id)) => json!({
            "status": "not_found",
            "message": format!("Step {id} not found in the current plan.")
        }),
        Ok(CompleteOutcome::Completed {
            id,
            already_completed,
        }) => json!({
            "status": "completed",
            "step_id": id,
            "already_completed": already_completed
        }),
        Err(err) => tool_error_payload("plan_write_failed", format!("{err:#}")),
    }
}

pub fn append_task_step_response(store: &TaskPlanStore, args: Value) -> Value {
    let args = match parse_args::<AppendStepArgs>(APPEND_TASK_STEP, args) {
        Ok(args) => args,
        Err(payload) => return payload,
    };
    if args.step_description.trim().is_empty() {
        return tool_error_payload("invalid_args", "'step_description' cannot be empty");
    }
    match store.append(&args.step_description) {
        Ok(AppendOutcome::NoPlan) => json!({ "status": "no_plan", "message": NO_PLAN_MESSAGE }),
        Ok(AppendOutcome::Appended(step)) => json!({
            "status": "appended",
            "step": { "id": step.id, "desc": step.desc }
        }),
        Err(err) => tool_error_payload("plan_write_failed", format!("{err:#}")),
    }
}

pub fn build_plan_tools(store: TaskPlanStore) -> Vec<Arc<dyn Tool>> {
    let create_store = store.clone();
    let create = FunctionTool::new(
        CREATE_TASK_PLAN,
        "Create a new task plan for a multi-step request, replacing any existing plan.\n\
         Use it before starting work that needs more than one step.",
        move |args| {
            let store = create_store.clone();
            async move { Ok(create_task_plan_response(&store, args)) }
        },
    )
    .with_schema::<CreatePlanArgs>();

    let read_store = store.clone();
    let read = FunctionTool::new(
        READ_TASK_PLAN,
        "Read the current task plan and return the next pending step with progress counts.",
        move |_args| {
            let store = read_store.clone();
            async move { Ok(read_task_plan_response(&store)) }
        },
    );

    let mark_store = store.clone();
    let mark = FunctionTool::new(
        MARK_TASK_COMPLETED,
        "Mark one task plan step as completed. Call it right after finishing the step.",
        move |args| {
            let store = mark_store.clone();
            async move { Ok(mark_task_completed_response(&store, args)) }
        },
    )
    .with_schema::<MarkCompletedArgs>();

    let append = FunctionTool::new(
        APPEND_TASK_STEP,
        "Append a step to the end of the current task plan.",
        move |args| {
            let store = store.clone();
            async move { Ok(append_task_step_response(&store, args)) }
        },
    )
    .with_schema::<AppendStepArgs>();

    vec![
        Arc::new(create),
        Arc::new(read),
        Arc::new(mark),
        Arc::new(append),
    ]
}
