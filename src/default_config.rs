pub const DEFAULT_CONFIG_TOML: &str = r#"
[storage]
agents_dir = "agents"

[agent]
program = "claude"
skip_permissions = true

[agent.retry]
max_retries = 3
delays_secs = [1, 3, 5]

[models]
default = "sonnet"

[models.commands."/classify_issue"]
base = "sonnet"
heavy = "sonnet"

[models.commands."/classify_adw"]
base = "sonnet"
heavy = "sonnet"

[models.commands."/generate_branch_name"]
base = "sonnet"
heavy = "sonnet"

[models.commands."/implement"]
base = "sonnet"
heavy = "opus"

[models.commands."/test"]
base = "sonnet"
heavy = "sonnet"

[models.commands."/resolve_failed_test"]
base = "sonnet"
heavy = "opus"

[models.commands."/test_e2e"]
base = "sonnet"
heavy = "sonnet"

[models.commands."/resolve_failed_e2e_test"]
base = "sonnet"
heavy = "opus"

[models.commands."/review"]
base = "sonnet"
heavy = "sonnet"

[models.commands."/document"]
base = "sonnet"
heavy = "opus"

[models.commands."/commit"]
base = "sonnet"
heavy = "sonnet"

[models.commands."/pull_request"]
base = "sonnet"
heavy = "sonnet"

[models.commands."/chore"]
base = "sonnet"
heavy = "opus"

[models.commands."/bug"]
base = "sonnet"
heavy = "opus"

[models.commands."/feature"]
base = "sonnet"
heavy = "opus"

[models.commands."/patch"]
base = "sonnet"
heavy = "opus"

[models.commands."/extract_test_requirements"]
base = "sonnet"
heavy = "sonnet"

[models.commands."/validate_test_batch"]
base = "sonnet"
heavy = "sonnet"

[models.commands."/create_test"]
base = "sonnet"
heavy = "opus"

[models.commands."/augment_test"]
base = "sonnet"
heavy = "opus"

[models.commands."/fix_test"]
base = "sonnet"
heavy = "opus"

[models.commands."/test_doctor"]
base = "sonnet"
heavy = "sonnet"

[testing]
max_unit_attempts = 4
max_e2e_attempts = 2
ensurance_concurrency = 5
max_fix_attempts = 2
test_command = "uv run pytest {file} -v --tb=short"
e2e_dir = ".claude/commands/e2e"
example_tests = ["app/server/tests/test_health.py", "app/server/tests/test_api.py"]
example_test_glob_dir = "app/server/tests"
test_doctor = true

[worktree]
backend_port = 9100
frontend_port = 9200

[knowledge_base]
root = "app_docs/testing"
"#;
