//! End-to-end CLI scenarios (spec §4.7, §6): each test shells out to the
//! built `ctl` binary against a throwaway bus database.

use assert_cmd::Command;
use predicates::str::contains;

fn cli(db_path: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("ctl").unwrap();
    cmd.env(ctl_config::ENV_BUS_DB_PATH, db_path.to_str().unwrap());
    cmd
}

#[test]
fn enqueue_prints_a_cmd_id_and_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("ctl.db");

    cli(&db_path)
        .args(["enqueue", "--cmd", "state.pause", "--args", "{}"])
        .assert()
        .success()
        .stdout(contains("-")); // a uuid
}

#[test]
fn drain_without_apply_lists_pending_commands() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("ctl.db");

    cli(&db_path)
        .args(["enqueue", "--cmd", "state.pause", "--args", "{}"])
        .assert()
        .success();

    cli(&db_path)
        .args(["drain"])
        .assert()
        .success()
        .stdout(contains("state.pause"))
        .stdout(contains("1 command(s) pending"));
}

#[test]
fn drain_with_apply_processes_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("ctl.db");

    cli(&db_path)
        .args(["enqueue", "--cmd", "state.pause", "--args", "{}"])
        .assert()
        .success();

    cli(&db_path)
        .current_dir(&dir)
        .args(["drain", "--apply"])
        .assert()
        .success()
        .stdout(contains("1 command(s) processed"));

    cli(&db_path)
        .args(["drain"])
        .assert()
        .success()
        .stdout(contains("0 command(s) pending"));
}

#[test]
fn stop_now_enqueues_the_kill_switch() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("ctl.db");

    cli(&db_path).args(["stop-now"]).assert().success();

    cli(&db_path)
        .args(["drain"])
        .assert()
        .success()
        .stdout(contains("stop.now"));
}

#[test]
fn health_fails_without_a_running_worker() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("ctl.db");

    cli(&db_path).args(["health"]).assert().code(2);
}
