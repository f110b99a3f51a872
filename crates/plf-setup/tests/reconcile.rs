//! End-to-end reconciler behaviour against in-memory collaborators

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use plf_setup::{
    ClusterHandle, ClusterProvisioner, ClusterSpec, FileRunStore, MemoryRunStore, ProvisionError,
    ReadinessProbe, Reconciler, ReplayDecision, ResourceStatus, Run, RunConfig, RunStatus,
    RunStore, SetupError, SetupStep, StepExecutor,
};

/// Records every step and fails scripted steps a set number of times
#[derive(Default)]
struct ScriptedExecutor {
    calls: Mutex<Vec<SetupStep>>,
    failures: Mutex<HashMap<SetupStep, u32>>,
}

impl ScriptedExecutor {
    fn failing(step: SetupStep, times: u32) -> Self {
        let exec = Self::default();
        exec.failures.lock().unwrap().insert(step, times);
        exec
    }

    fn calls(&self) -> Vec<SetupStep> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(&self, step: SetupStep) -> plf_setup::Result<()> {
        self.calls.lock().unwrap().push(step);
        let mut failures = self.failures.lock().unwrap();
        if let Some(left) = failures.get_mut(&step) {
            if *left > 0 {
                *left -= 1;
                return Err(SetupError::command_failed(format!("{step} refused")));
            }
        }
        Ok(())
    }
}

/// Cluster provisioner backed by a set of running cluster names
#[derive(Default)]
struct FakeProvisioner {
    clusters: Mutex<Vec<String>>,
}

#[async_trait]
impl ClusterProvisioner for FakeProvisioner {
    async fn create(&self, spec: &ClusterSpec) -> Result<ClusterHandle, ProvisionError> {
        let mut clusters = self.clusters.lock().unwrap();
        if clusters.contains(&spec.name) {
            return Err(ProvisionError::AlreadyExists {
                name: spec.name.clone(),
            });
        }
        clusters.push(spec.name.clone());
        Ok(ClusterHandle {
            name: spec.name.clone(),
            servers_running: 1,
        })
    }

    async fn delete(&self, name: &str) -> Result<(), ProvisionError> {
        self.clusters.lock().unwrap().retain(|c| c != name);
        Ok(())
    }

    async fn wait_ready(
        &self,
        _name: &str,
        _probe: ReadinessProbe,
        _timeout: Duration,
    ) -> Result<(), ProvisionError> {
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ClusterHandle>, ProvisionError> {
        Ok(self
            .clusters
            .lock()
            .unwrap()
            .iter()
            .map(|name| ClusterHandle {
                name: name.clone(),
                servers_running: 1,
            })
            .collect())
    }
}

fn config() -> RunConfig {
    RunConfig {
        container_runtime: Some("docker".into()),
        cluster_name: "lakehouse".into(),
        project_name: "lakehouse".into(),
    }
}

fn done_ordinals(run: &Run) -> Vec<u8> {
    run.resources
        .iter()
        .filter(|r| r.status == ResourceStatus::Done)
        .map(|r| r.ordinal)
        .collect()
}

#[tokio::test]
async fn failure_at_catalog_service_then_successful_resume() {
    let executor = Arc::new(ScriptedExecutor::failing(SetupStep::DeployCatalogService, 1));
    let reconciler = Reconciler::new(
        MemoryRunStore::with_run(Run::new(config())),
        executor.clone(),
        Arc::new(FakeProvisioner::default()),
    );

    let err = reconciler.resume().await.unwrap_err();
    assert_eq!(err.failed_ordinal(), Some(4));
    assert!(err.to_string().contains("resource 4 (Polaris)"));

    let run = reconciler.status().unwrap();
    assert_eq!(run.status, RunStatus::InProgress);
    assert_eq!(done_ordinals(&run), vec![1, 2, 3]);

    let run = reconciler.resume().await.unwrap();
    assert_eq!(run.status, RunStatus::Complete);
    assert_eq!(done_ordinals(&run), vec![1, 2, 3, 4, 5, 6, 7]);

    // The failed step is re-attempted, earlier ones are not
    assert_eq!(
        executor.calls(),
        vec![
            SetupStep::CreateCluster,
            SetupStep::WaitForStorage,
            SetupStep::DeployCatalogService,
            SetupStep::DeployCatalogService,
            SetupStep::ConfigureCatalog,
            SetupStep::LoadDemoData,
        ]
    );
}

#[tokio::test]
async fn second_resume_is_a_no_op() {
    let executor = Arc::new(ScriptedExecutor::default());
    let reconciler = Reconciler::new(
        MemoryRunStore::with_run(Run::new(config())),
        executor.clone(),
        Arc::new(FakeProvisioner::default()),
    );

    let first = reconciler.resume().await.unwrap();
    let calls = executor.calls().len();
    let saves = reconciler.store().save_count();

    let second = reconciler.resume().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(executor.calls().len(), calls);
    assert_eq!(reconciler.store().save_count(), saves);
}

#[tokio::test]
async fn resources_complete_in_ordinal_order_except_the_principal() {
    let reconciler = Reconciler::new(
        MemoryRunStore::with_run(Run::new(config())),
        Arc::new(ScriptedExecutor::default()),
        Arc::new(FakeProvisioner::default()),
    );
    reconciler.resume().await.unwrap();

    let mut completion_order = Vec::new();
    let mut seen: Vec<u8> = Vec::new();
    for snapshot in reconciler.store().history() {
        for ordinal in done_ordinals(&snapshot) {
            if !seen.contains(&ordinal) {
                seen.push(ordinal);
                completion_order.push(ordinal);
            }
        }
        // Nothing regresses once DONE
        for ordinal in &seen {
            assert!(snapshot.is_done(*ordinal), "resource {ordinal} regressed");
        }
    }
    assert_eq!(completion_order, vec![1, 2, 3, 4, 6, 5, 7]);
}

#[tokio::test]
async fn every_saved_snapshot_resumes_to_complete() {
    let reconciler = Reconciler::new(
        MemoryRunStore::with_run(Run::new(config())),
        Arc::new(ScriptedExecutor::default()),
        Arc::new(FakeProvisioner::default()),
    );
    reconciler.resume().await.unwrap();

    // A kill right after any save leaves exactly that snapshot on disk
    for snapshot in reconciler.store().history() {
        assert!(snapshot
            .resources
            .iter()
            .all(|r| matches!(r.status, ResourceStatus::Pending | ResourceStatus::Done)));

        let executor = Arc::new(ScriptedExecutor::default());
        let restarted = Reconciler::new(
            MemoryRunStore::with_run(snapshot.clone()),
            executor.clone(),
            Arc::new(FakeProvisioner::default()),
        );
        let run = restarted.resume().await.unwrap();
        assert_eq!(run.status, RunStatus::Complete);

        for step in executor.calls() {
            assert!(step.is_pending(&snapshot), "{step} re-ran after it was recorded");
        }
    }
}

#[tokio::test]
async fn teardown_then_replay_then_setup() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = Arc::new(FakeProvisioner::default());
    let reconciler = Reconciler::new(
        FileRunStore::in_work_dir(dir.path()),
        Arc::new(ScriptedExecutor::default()),
        provisioner.clone(),
    );

    assert_eq!(reconciler.replay().await.unwrap(), ReplayDecision::FullSetupNeeded);

    reconciler.setup(config()).await.unwrap();
    // The fake executor does not create the cluster; the manifest claims it
    assert_eq!(reconciler.replay().await.unwrap(), ReplayDecision::Inconsistent);

    provisioner
        .create(&ClusterSpec {
            name: "lakehouse".into(),
            k3s_version: "v1.31.5-k3s1".into(),
            ports: vec![],
            manifests_dir: None,
        })
        .await
        .unwrap();
    assert_eq!(reconciler.replay().await.unwrap(), ReplayDecision::NothingToDo);

    let removed = reconciler.teardown().await.unwrap();
    assert_eq!(removed.status, RunStatus::Removed);
    assert!(removed.all_done());
    assert!(provisioner.list().await.unwrap().is_empty());
    assert_eq!(reconciler.replay().await.unwrap(), ReplayDecision::FullSetupNeeded);
    assert!(reconciler.resume().await.is_err());

    let fresh = reconciler.setup(config()).await.unwrap();
    assert_eq!(fresh.status, RunStatus::Complete);
}

#[tokio::test]
async fn hand_edited_manifest_is_honoured() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileRunStore::in_work_dir(dir.path());
    let mut run = Run::new(config());
    for ordinal in 1..=3 {
        run.mark_done(ordinal).unwrap();
    }
    store.save(&run).unwrap();

    let executor = Arc::new(ScriptedExecutor::default());
    let reconciler = Reconciler::new(store, executor.clone(), Arc::new(FakeProvisioner::default()));

    let plan = reconciler.plan().unwrap();
    assert_eq!(plan[0].step, SetupStep::DeployCatalogService);

    reconciler.resume().await.unwrap();
    assert_eq!(executor.calls()[0], SetupStep::DeployCatalogService);
}
