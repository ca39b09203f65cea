use crate::control::RELOAD_SENTINEL;
use crate::tools::plan_tools::{APPEND_TASK_STEP, CREATE_TASK_PLAN, MARK_TASK_COMPLETED, READ_TASK_PLAN};
use crate::tools::skill_tools::{
    INSPECT_ENVIRONMENT, PROMOTE_SKILL, RELOAD_SKILLS, SCAFFOLD_SKILL, WRITE_TOOL_CODE,
};
use crate::tools::{ToolSet, description_headline};

pub fn render_skill_list(tools: &ToolSet) -> String {
    if tools.is_empty() {
        return "(no skills available)".to_string();
    }
    tools
        .iter()
        .map(|entry| {
            format!(
                "- {}: {}",
                entry.tool.name(),
                description_headline(entry.tool.description())
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn build_system_prompt(tools: &ToolSet) -> String {
    let os_name = std::env::consts::OS;
    let cwd = std::env::current_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|_| ".".to_string());
    let skills = render_skill_list(tools);

    format!(
        "You are an automation agent that completes tasks on this computer by calling skills.\n\
         \n\
         <system_context>\n\
         - Operating System: {os_name}\n\
         - Current Directory: {cwd}\n\
         </system_context>\n\
         \n\
         <skills>\n\
         {skills}\n\
         </skills>\n\
         \n\
         <execution_rules>\n\
         TASK DECOMPOSITION: split every request into atomic steps before acting.\n\
         TASK PLAN: for anything that needs more than one step, call {CREATE_TASK_PLAN} first. \
         Then loop: {READ_TASK_PLAN} to get the current step, do only that step, call \
         {MARK_TASK_COMPLETED} with its id. Use {APPEND_TASK_STEP} when new work appears. \
         The plan is the source of truth for progress; do not rely on memory.\n\
         PARAMETERS: infer tool arguments from context; prefer absolute paths.\n\
         ERRORS: when a tool fails, try to repair once (different arguments, re-inspect state). \
         If that fails too, report the problem to the user and finish.\n\
         </execution_rules>\n\
         \n\
         <state_contract>\n\
         The LAST line of every reply must be exactly one of:\n\
         STATE: DONE\n\
         STATE: CONTINUE\n\
         Use STATE: DONE when the task is finished, when you answered a simple question, or \
         when you need the user to answer something. Use STATE: CONTINUE when more steps \
         remain that you will perform next without user input.\n\
         </state_contract>\n\
         \n\
         <new_skills>\n\
         When no skill can do the job, build one: call {INSPECT_ENVIRONMENT}, then \
         {SCAFFOLD_SKILL}, then {WRITE_TOOL_CODE} for every script, then {RELOAD_SKILLS}. \
         {RELOAD_SKILLS} ends your turn; the new tools are listed in the next turn. \
         Never print the reload token `{RELOAD_SENTINEL}` yourself unless you want a reload.\n\
         Only when the user asks to keep a generated skill permanently, call {PROMOTE_SKILL} \
         and then {RELOAD_SKILLS}. Promoted skills are no longer hot-reloaded.\n\
         </new_skills>\n\
         \n\
         <response_format>\n\
         After tools run, summarize what was done in plain language. Do not repeat raw tool \
         output. Keep answers short for simple questions.\n\
         </response_format>"
    )
}
