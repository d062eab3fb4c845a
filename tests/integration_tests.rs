//! End-to-end tests for the conveyor binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn conveyor(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("conveyor");
    cmd.current_dir(dir.path())
        .env_remove("CONVEYOR_DB")
        .env_remove("CONVEYOR_MAX_ATTEMPTS")
        .env_remove("RUST_LOG")
        .env("CONVEYOR_EXECUTOR_CMD", "cat > /dev/null; echo done");
    cmd
}

fn init_project() -> TempDir {
    let dir = TempDir::new().unwrap();
    conveyor(&dir).arg("init").assert().success();
    dir
}

fn write_plan(dir: &TempDir, steps: &[&str]) -> PathBuf {
    let mut plan = String::from("name = \"demo\"\ngates = []\n");
    for step in steps {
        plan.push_str(&format!(
            "\n[[steps]]\nname = \"{step}\"\nprompt = \"do {step}\"\nskip_qa = true\n"
        ));
    }
    let path = dir.path().join("plan.toml");
    fs::write(&path, plan).unwrap();
    path
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let dir = TempDir::new().unwrap();
        conveyor(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("action"))
            .stdout(predicate::str::contains("worker"));
    }

    #[test]
    fn test_init_creates_config_and_database() {
        let dir = TempDir::new().unwrap();
        conveyor(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized conveyor"));

        assert!(dir.path().join(".conveyor/conveyor.toml").exists());
        assert!(dir.path().join(".conveyor/conveyor.db").exists());

        conveyor(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }

    #[test]
    fn test_commands_require_init() {
        let dir = TempDir::new().unwrap();
        conveyor(&dir)
            .args(["list"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("conveyor init"));
    }

    #[test]
    fn test_config_validate_reports_problems() {
        let dir = init_project();
        conveyor(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("valid"));

        fs::write(
            dir.path().join(".conveyor/conveyor.toml"),
            "[qa]\npassing_threshold = 1.5\n",
        )
        .unwrap();
        conveyor(&dir)
            .args(["config", "validate"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("passing_threshold"));
    }

    #[test]
    fn test_project_add_rejects_duplicates() {
        let dir = init_project();
        conveyor(&dir)
            .args(["project", "add", "web", "--git-url", "git@example.com:web.git"])
            .assert()
            .success();
        conveyor(&dir)
            .args(["project", "add", "web"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("already exists"));
        conveyor(&dir)
            .args(["project", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("git@example.com:web.git"));
    }
}

mod protocol_flow {
    use super::*;

    #[test]
    fn test_create_start_and_drain_completes_run() {
        let dir = init_project();
        let plan = write_plan(&dir, &["setup", "build"]);

        conveyor(&dir)
            .args(["create", plan.to_str().unwrap(), "--start"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created protocol run 1"))
            .stdout(predicate::str::contains("running"));

        conveyor(&dir)
            .args(["worker", "--once"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Processed 2 job(s)"));

        conveyor(&dir)
            .args(["status", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("completed"));

        conveyor(&dir)
            .args(["events", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("protocol_completed"));
    }

    #[test]
    fn test_rejected_action_exits_nonzero_with_status() {
        let dir = init_project();
        let plan = write_plan(&dir, &["build"]);
        conveyor(&dir)
            .args(["create", plan.to_str().unwrap()])
            .assert()
            .success();

        conveyor(&dir)
            .args(["--json", "action", "1", "open-pr"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("\"success\": false"))
            .stdout(predicate::str::contains("\"status\": \"pending\""));

        conveyor(&dir)
            .args(["action", "1", "launch"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unknown action"));
    }

    #[test]
    fn test_pause_holds_queued_work() {
        let dir = init_project();
        let plan = write_plan(&dir, &["build"]);
        conveyor(&dir)
            .args(["create", plan.to_str().unwrap(), "--start"])
            .assert()
            .success();
        conveyor(&dir)
            .args(["action", "1", "pause"])
            .assert()
            .success()
            .stdout(predicate::str::contains("paused"));

        conveyor(&dir)
            .args(["worker", "--once"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Processed 0 job(s)"));

        conveyor(&dir)
            .args(["action", "1", "resume"])
            .assert()
            .success();
        conveyor(&dir)
            .args(["worker", "--once"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Processed 1 job(s)"));
    }

    #[test]
    fn test_blocker_raises_clarification_and_answer_resumes() {
        let dir = init_project();
        let plan = write_plan(&dir, &["deploy"]);
        conveyor(&dir)
            .args(["create", plan.to_str().unwrap(), "--start"])
            .assert()
            .success();

        conveyor(&dir)
            .env(
                "CONVEYOR_EXECUTOR_CMD",
                "cat > /dev/null; echo '<blocker>which region should we deploy to</blocker>'",
            )
            .args(["worker", "--once"])
            .assert()
            .success();

        conveyor(&dir)
            .args(["status", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("blocked"));

        conveyor(&dir)
            .args(["clarifications", "--open"])
            .assert()
            .success()
            .stdout(predicate::str::contains("blocking"))
            .stdout(predicate::str::contains("qa_feedback_1"));

        conveyor(&dir)
            .args(["answer", "1", "eu-west-1", "--by", "ops", "--resume"])
            .assert()
            .success()
            .stdout(predicate::str::contains("protocol resumed"));

        conveyor(&dir)
            .args(["worker", "--once"])
            .assert()
            .success();
        conveyor(&dir)
            .args(["--json", "status", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"status\": \"completed\""));
    }

    #[test]
    fn test_queue_stats_and_recover() {
        let dir = init_project();
        let plan = write_plan(&dir, &["build"]);
        conveyor(&dir)
            .args(["create", plan.to_str().unwrap(), "--start"])
            .assert()
            .success();

        conveyor(&dir)
            .args(["queue"])
            .assert()
            .success()
            .stdout(predicate::str::contains("queued"));

        conveyor(&dir)
            .args(["recover"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing to recover"));
    }
}
