//! Command line parsing into operations

use clap::Parser;
use plf_cli::commands::Operation;
use plf_cli::Cli;
use plf_migrate::SyncOptions;

fn parse(dir: &tempfile::TempDir, args: &[&str]) -> (Operation, plf_cli::commands::Context) {
    let work_dir = dir.path().to_string_lossy().into_owned();
    let mut argv = vec!["plf", "--work-dir", work_dir.as_str()];
    argv.extend_from_slice(args);
    Cli::try_parse_from(argv).unwrap().operation().unwrap()
}

#[test]
fn setup_commands_map_to_operations() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(
        parse(&dir, &["setup", "--runtime", "podman"]).0,
        Operation::Setup {
            runtime: Some("podman".into())
        }
    );
    assert_eq!(parse(&dir, &["resume"]).0, Operation::Resume);
    assert_eq!(parse(&dir, &["replay"]).0, Operation::Replay);
    assert_eq!(parse(&dir, &["status"]).0, Operation::Status);

    let (op, ctx) = parse(&dir, &["init", "--force", "--yes"]);
    assert!(matches!(op, Operation::Init { force: true, .. }));
    assert!(ctx.yes);
}

#[test]
fn dry_run_and_yes_reach_the_context() {
    let dir = tempfile::tempdir().unwrap();
    let (op, ctx) = parse(&dir, &["teardown", "--dry-run"]);
    assert_eq!(op, Operation::Teardown);
    assert!(ctx.dry_run);
    assert!(!ctx.yes);

    let (op, ctx) = parse(&dir, &["l2c", "cleanup", "-y"]);
    assert_eq!(op, Operation::Cleanup);
    assert!(ctx.yes);
    assert!(!ctx.dry_run);
}

#[test]
fn sync_flags_become_sync_options() {
    let dir = tempfile::tempdir().unwrap();
    let (op, _) = parse(&dir, &["l2c", "sync", "--force", "--skip-rewrite", "--dry-run"]);
    assert_eq!(
        op,
        Operation::Sync(SyncOptions {
            force: true,
            skip_rewrite: true
        })
    );
    let (op, _) = parse(&dir, &["l2c", "migrate"]);
    assert_eq!(op, Operation::Migrate(SyncOptions::default()));
}

#[test]
fn cloud_flags_are_accepted_after_the_subcommand() {
    let dir = tempfile::tempdir().unwrap();
    let (op, ctx) = parse(
        &dir,
        &["l2c", "register", "--prefix", "ops", "--database", "analytics"],
    );
    assert_eq!(op, Operation::Register);
    assert_eq!(ctx.cloud.prefix.as_deref(), Some("ops"));
    assert_eq!(ctx.cloud.database.as_deref(), Some("analytics"));
}

#[test]
fn prefix_and_no_prefix_conflict() {
    let err = Cli::try_parse_from(["plf", "l2c", "sync", "--prefix", "ops", "--no-prefix"]);
    assert!(err.is_err());
}

#[test]
fn every_l2c_command_parses() {
    let dir = tempfile::tempdir().unwrap();
    let expected = [
        ("inventory", Operation::Inventory),
        ("setup-cloud", Operation::SetupCloud),
        ("refresh", Operation::Refresh),
        ("clear", Operation::Clear),
        ("status", Operation::MigrationStatus),
    ];
    for (command, operation) in expected {
        assert_eq!(parse(&dir, &["l2c", command]).0, operation, "{command}");
    }
}

#[test]
fn missing_work_dir_is_a_validation_error() {
    let cli = Cli::try_parse_from(["plf", "--work-dir", "/definitely/not/here", "status"]).unwrap();
    assert!(matches!(cli.operation(), Err(plf_cli::Error::Validation { .. })));
}

#[test]
fn host_commands_parse() {
    use plf_cli::commands::host::OutputFormat;

    let dir = tempfile::tempdir().unwrap();
    assert_eq!(
        parse(&dir, &["doctor"]).0,
        Operation::Doctor {
            fix: false,
            output: OutputFormat::Text
        }
    );
    assert_eq!(
        parse(&dir, &["doctor", "--fix", "-o", "json"]).0,
        Operation::Doctor {
            fix: true,
            output: OutputFormat::Json
        }
    );
    assert_eq!(
        parse(&dir, &["runtime", "detect", "--json"]).0,
        Operation::RuntimeDetect { json: true }
    );
    assert_eq!(parse(&dir, &["runtime", "docker-host"]).0, Operation::DockerHost);
    assert_eq!(
        parse(&dir, &["cluster", "list"]).0,
        Operation::ClusterList {
            output: OutputFormat::Text
        }
    );
    assert_eq!(
        parse(&dir, &["cluster", "status", "--output", "json"]).0,
        Operation::ClusterStatus {
            output: OutputFormat::Json
        }
    );
}

#[test]
fn unknown_output_format_is_rejected() {
    let err = Cli::try_parse_from(["plf", "cluster", "list", "-o", "yaml"]);
    assert!(err.is_err());
}
