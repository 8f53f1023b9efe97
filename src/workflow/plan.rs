use tracing::info;

use super::{
    AGENT_OPS, AGENT_PLANNER, PhaseContext, build_plan, classify_issue, create_commit,
    generate_branch_name, push_and_sync_pr,
};
use crate::error::Result;
use crate::state::{RunState, RunStatePatch, new_run_id};

pub const SUB_WORKFLOW: &str = "adw_plan";

/// Reuses the stored run when `adw_id` names one, otherwise starts a new run
/// record for the issue.
pub fn ensure_run_state(
    ctx: &PhaseContext<'_>,
    issue_number: &str,
    adw_id: Option<&str>,
) -> Result<RunState> {
    if let Some(existing) = adw_id.and_then(|id| ctx.states.load(id)) {
        info!(adw_id = %existing.adw_id, "resuming existing run");
        return Ok(existing);
    }
    let adw_id = adw_id.map(ToString::to_string).unwrap_or_else(new_run_id);
    let state = RunState::new(adw_id, Some(issue_number.to_string()));
    ctx.save_state(&state)?;
    info!(adw_id = %state.adw_id, issue_number, "created run state");
    Ok(state)
}

pub fn run_plan(
    ctx: &PhaseContext<'_>,
    issue_number: &str,
    adw_id: Option<&str>,
) -> Result<RunState> {
    let mut state = ensure_run_state(ctx, issue_number, adw_id)?;
    if state.issue_number.is_none() {
        state.issue_number = Some(issue_number.to_string());
    }
    state.append_sub_workflow(SUB_WORKFLOW);
    ctx.save_state(&state)?;

    ctx.comment(&state, AGENT_OPS, "✅ Starting planning phase");
    ctx.post_state_snapshot(&state, "📋 Run state");

    let issue = ctx.fetch_issue(&state)?;

    let issue_class = classify_issue(ctx, &state, &issue)
        .map_err(|err| ctx.fail(&state, AGENT_OPS, format!("Error classifying issue: {err}")))?;
    state.update(RunStatePatch {
        issue_class: Some(issue_class),
        ..RunStatePatch::default()
    });
    ctx.save_state(&state)?;
    ctx.comment(
        &state,
        AGENT_OPS,
        &format!("✅ Issue classified as: {}", issue_class.slash_command()),
    );

    let branch_name = generate_branch_name(ctx, &state, issue_class, &issue).map_err(|err| {
        ctx.fail(&state, AGENT_OPS, format!("Error generating branch name: {err}"))
    })?;
    ctx.git
        .create_branch(&branch_name, None)
        .map_err(|err| ctx.fail(&state, AGENT_OPS, format!("Error creating branch: {err}")))?;
    state.update(RunStatePatch {
        branch_name: Some(branch_name.clone()),
        ..RunStatePatch::default()
    });
    ctx.save_state(&state)?;
    ctx.comment(&state, AGENT_OPS, &format!("✅ Working on branch: {branch_name}"));

    let response = build_plan(ctx, &state, issue_class, &issue);
    if !response.success {
        return Err(ctx.fail(
            &state,
            AGENT_PLANNER,
            format!("Error building plan: {}", response.output),
        ));
    }
    ctx.comment_with_session(
        &state,
        AGENT_PLANNER,
        "✅ Implementation plan created",
        response.session_id.as_deref(),
    );

    let plan_file = response.output.trim().to_string();
    if plan_file.is_empty() {
        return Err(ctx.fail(&state, AGENT_OPS, "No plan file path returned from planning agent"));
    }
    if !ctx.resolve_path(None, &plan_file).exists() {
        return Err(ctx.fail(
            &state,
            AGENT_OPS,
            format!("Plan file does not exist: {plan_file}"),
        ));
    }
    state.update(RunStatePatch {
        plan_file: Some(plan_file.clone()),
        ..RunStatePatch::default()
    });
    ctx.save_state(&state)?;
    ctx.comment(&state, AGENT_OPS, &format!("✅ Plan file created: {plan_file}"));

    let message = create_commit(ctx, &state, AGENT_PLANNER, issue_class, &issue, None)
        .map_err(|err| ctx.fail(&state, AGENT_PLANNER, format!("Error committing plan: {err}")))?;
    ctx.comment(&state, AGENT_PLANNER, &format!("✅ Plan committed: {message}"));

    push_and_sync_pr(ctx, &state, &issue, None)
        .map_err(|err| ctx.fail(&state, AGENT_OPS, format!("Error pushing changes: {err}")))?;

    ctx.save_state(&state)?;
    ctx.comment(&state, AGENT_OPS, "✅ Planning phase completed");
    ctx.post_state_snapshot(&state, "📋 Final planning state");
    Ok(state)
}
