#[cfg(test)]
mod test {
    use assert_cmd::prelude::*;
    use predicates::prelude::*;
    use std::path::Path;
    use std::process::Command;

    fn beads(workdir: &Path) -> Command {
        let mut cmd = Command::cargo_bin("beadscli").unwrap();
        cmd.arg("-C").arg(workdir);
        cmd
    }

    fn init(workdir: &Path) {
        beads(workdir).arg("init").assert().success();
    }

    /// Runs create and returns the generated issue id from stdout.
    fn create(workdir: &Path, title: &str) -> String {
        let output = beads(workdir)
            .args(["create", title])
            .output()
            .expect("create should run");
        assert!(output.status.success(), "create failed: {:?}", output);
        let stdout = String::from_utf8(output.stdout).unwrap();
        stdout.split_whitespace().next().expect("create prints the id").to_string()
    }

    #[test]
    fn help_lists_subcommands() -> Result<(), Box<dyn std::error::Error>> {
        let mut cmd = Command::cargo_bin("beadscli")?;
        cmd.arg("--help");
        cmd.assert()
            .success()
            .stdout(predicate::str::contains("sync"))
            .stdout(predicate::str::contains("create"))
            .stdout(predicate::str::contains("delete"));
        Ok(())
    }

    #[test]
    fn commands_outside_a_workspace_fail_with_hint() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        beads(dir.path())
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("NotAWorkspace"))
            .stderr(predicate::str::contains("init"));
        Ok(())
    }

    #[test]
    fn create_flushes_to_the_ledger() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        init(dir.path());
        let id = create(dir.path(), "wire up the codec");

        // The urgent flush wrote the ledger on the way out.
        let ledger = dir.path().join(".beads/issues.jsonl");
        let text = std::fs::read_to_string(&ledger)?;
        assert!(text.contains(&id));
        assert!(text.contains("wire up the codec"));

        beads(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("wire up the codec"));
        Ok(())
    }

    #[test]
    fn delete_leaves_a_tombstone_and_a_manifest_record() -> Result<(), Box<dyn std::error::Error>>
    {
        let dir = tempfile::tempdir()?;
        init(dir.path());
        let id = create(dir.path(), "short lived");

        beads(dir.path())
            .args(["delete", &id, "--reason", "duplicate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("tombstone"));

        let manifest = std::fs::read_to_string(dir.path().join(".beads/deletions.jsonl"))?;
        assert!(manifest.contains(&id));

        // Gone from the default list, still visible with --all.
        beads(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains(&id).not());
        beads(dir.path())
            .args(["list", "--all"])
            .assert()
            .success()
            .stdout(predicate::str::contains("tombstone"));
        Ok(())
    }

    #[test]
    fn sync_status_reports_mode_and_counts() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        init(dir.path());
        create(dir.path(), "track me");

        beads(dir.path())
            .args(["sync", "--status"])
            .assert()
            .success()
            .stdout(predicate::str::contains("mode:      local"))
            .stdout(predicate::str::contains("strategy:  newest"));
        Ok(())
    }

    #[test]
    fn export_and_import_only_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        init(dir.path());
        create(dir.path(), "round trip");

        beads(dir.path())
            .args(["sync", "--export-only"])
            .assert()
            .success()
            .stdout(predicate::str::contains("exported"));

        beads(dir.path())
            .args(["sync", "--import-only"])
            .assert()
            .success()
            .stdout(predicate::str::contains("nothing to import"));
        Ok(())
    }

    #[test]
    fn config_round_trip_and_validation() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        init(dir.path());

        beads(dir.path())
            .args(["config", "conflict.strategy", "theirs"])
            .assert()
            .success();
        beads(dir.path())
            .args(["config", "conflict.strategy"])
            .assert()
            .success()
            .stdout(predicate::str::contains("theirs"));

        beads(dir.path())
            .args(["config", "sync.remote", "ftp://nope"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("InvalidConfig"));
        Ok(())
    }

    #[test]
    fn update_and_show() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        init(dir.path());
        let id = create(dir.path(), "needs triage");

        beads(dir.path())
            .args(["update", &id, "--priority", "P1", "--status", "in_progress"])
            .assert()
            .success();

        beads(dir.path())
            .args(["show", &id])
            .assert()
            .success()
            .stdout(predicate::str::contains("in_progress"))
            .stdout(predicate::str::contains("P1"));
        Ok(())
    }
}
