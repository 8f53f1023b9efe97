use super::{
    AGENT_IMPLEMENTOR, AGENT_OPS, PhaseContext, Workspace, classification_or, create_commit,
    implement_plan, push_and_sync_pr,
};
use crate::error::{AdwError, Result};
use crate::state::{IssueClass, RunState};

pub fn sub_workflow_name(workspace: Workspace) -> &'static str {
    match workspace {
        Workspace::Main => "adw_build",
        Workspace::Isolated => "adw_build_iso",
    }
}

pub fn run_build(
    ctx: &PhaseContext<'_>,
    issue_number: &str,
    adw_id: &str,
    workspace: Workspace,
) -> Result<RunState> {
    let Some(mut state) = ctx.states.load(adw_id) else {
        return Err(AdwError::Precondition(format!(
            "No state found for ADW ID: {adw_id}. Run the plan phase first"
        )));
    };
    if state.issue_number.is_none() {
        state.issue_number = Some(issue_number.to_string());
    }
    state.append_sub_workflow(sub_workflow_name(workspace));

    let Some(branch_name) = state.branch_name.clone() else {
        return Err(ctx.fail(
            &state,
            AGENT_OPS,
            "No branch name in state - run the plan phase first",
        ));
    };
    let Some(plan_file) = state.plan_file.clone() else {
        return Err(ctx.fail(
            &state,
            AGENT_OPS,
            "No plan file in state - run the plan phase first",
        ));
    };

    let cwd = ctx.working_dir(&mut state, workspace)?;
    if workspace == Workspace::Main {
        ctx.git.checkout(&branch_name, None).map_err(|err| {
            ctx.fail(&state, AGENT_OPS, format!("Failed to checkout branch {branch_name}: {err}"))
        })?;
    }
    ctx.save_state(&state)?;

    let start_message = match (&cwd, state.backend_port, state.frontend_port) {
        (Some(dir), Some(backend), Some(frontend)) => format!(
            "✅ Starting isolated implementation phase\n🏠 Worktree: {}\n🔌 Ports - Backend: {backend}, Frontend: {frontend}",
            dir.display()
        ),
        _ => "✅ Starting implementation phase".to_string(),
    };
    ctx.comment(&state, AGENT_OPS, &start_message);
    ctx.post_state_snapshot(&state, "📋 Run state");

    let issue = ctx.fetch_issue(&state)?;

    let response = implement_plan(ctx, &state, &plan_file, cwd.as_deref());
    if !response.success {
        return Err(ctx.fail(
            &state,
            AGENT_IMPLEMENTOR,
            format!("Error implementing solution: {}", response.output),
        ));
    }
    ctx.comment_with_session(
        &state,
        AGENT_IMPLEMENTOR,
        "✅ Solution implemented",
        response.session_id.as_deref(),
    );

    let issue_class = classification_or(ctx, &mut state, &issue, IssueClass::Feature);
    ctx.save_state(&state)?;

    let message = create_commit(
        ctx,
        &state,
        AGENT_IMPLEMENTOR,
        issue_class,
        &issue,
        cwd.as_deref(),
    )
    .map_err(|err| {
        ctx.fail(
            &state,
            AGENT_IMPLEMENTOR,
            format!("Error committing implementation: {err}"),
        )
    })?;
    ctx.comment(&state, AGENT_IMPLEMENTOR, &format!("✅ Implementation committed: {message}"));

    push_and_sync_pr(ctx, &state, &issue, cwd.as_deref())
        .map_err(|err| ctx.fail(&state, AGENT_OPS, format!("Error pushing changes: {err}")))?;

    ctx.save_state(&state)?;
    ctx.comment(&state, AGENT_OPS, "✅ Implementation phase completed");
    ctx.post_state_snapshot(&state, "📋 Final implementation state");
    Ok(state)
}
