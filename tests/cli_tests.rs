//! CLI smoke tests for the foreman binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use tempfile::TempDir;

fn foreman() -> Command {
    cargo_bin_cmd!("foreman")
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn init_project(dir: &TempDir) {
    foreman()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        foreman()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("trigger"))
            .stdout(predicate::str::contains("daemon"));
    }

    #[test]
    fn test_version() {
        foreman().arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_structure() {
        let dir = create_temp_project();

        foreman()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized foreman project"));

        assert!(dir.path().join(".foreman").exists());
        assert!(dir.path().join(".foreman/foreman.toml").exists());
        assert!(dir.path().join(".foreman/state.db").exists());
    }

    #[test]
    fn test_init_twice_does_not_overwrite() {
        let dir = create_temp_project();
        init_project(&dir);

        foreman()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
    }

    #[test]
    fn test_project_dir_flag() {
        let dir = create_temp_project();

        foreman()
            .arg("--project-dir")
            .arg(dir.path())
            .arg("init")
            .assert()
            .success();

        assert!(dir.path().join(".foreman/foreman.toml").exists());
    }
}

mod items {
    use super::*;

    #[test]
    fn test_list_uninitialized() {
        let dir = create_temp_project();

        foreman()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("not initialized"));
    }

    #[test]
    fn test_list_empty() {
        let dir = create_temp_project();
        init_project(&dir);

        foreman()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No tracked items"));
    }

    #[test]
    fn test_status_unknown_item() {
        let dir = create_temp_project();
        init_project(&dir);

        foreman()
            .current_dir(dir.path())
            .args(["status", "42"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No record for item 42"));
    }

    #[test]
    fn test_trigger_requires_repo_config() {
        let dir = create_temp_project();
        init_project(&dir);

        // github.repo is unset in the default config, so the engine must
        // refuse to start before touching any item.
        foreman()
            .current_dir(dir.path())
            .env_remove("GITHUB_TOKEN")
            .args(["trigger", "42"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("github.repo"));
    }
}

mod config {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();

        foreman()
            .current_dir(dir.path())
            .arg("config")
            .assert()
            .success()
            .stdout(predicate::str::contains("Default configuration"))
            .stdout(predicate::str::contains("max_parallel_tasks"));
    }

    #[test]
    fn test_config_show_after_init() {
        let dir = create_temp_project();
        init_project(&dir);

        foreman()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("foreman.toml"))
            .stdout(predicate::str::contains("needs-planning"));
    }

    #[test]
    fn test_config_validate_rejects_bad_values() {
        let dir = create_temp_project();
        init_project(&dir);

        let path = dir.path().join(".foreman/foreman.toml");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content = content.replace("max_parallel_tasks = 4", "max_parallel_tasks = 0");
        std::fs::write(&path, content).unwrap();

        foreman()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("invalid"));
    }

    #[test]
    fn test_config_init_standalone() {
        let dir = create_temp_project();

        foreman()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created foreman.toml"));

        assert!(dir.path().join(".foreman/foreman.toml").exists());
    }
}
