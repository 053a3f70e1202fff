//! Plan state manager
//!
//! Durable persistence and state transitions for plans:
//! - SQLite is the source of truth, the in-memory map is a read-through cache
//! - Blocking SQLite work runs on the blocking thread pool
//! - Read-modify-write updates are serialized through one async lock
//! - A per-plan lease keeps two executions off the same plan

use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::model::{
    PlanPatch, PlanResults, PlanStatePatch, TaskPatch, TaskPlan, TaskStatus,
};
use crate::error::{Result, StratumError};
use crate::storage::{Database, PlanStore, SharedDatabase};

/// Exclusive right to execute one plan. Released on drop.
#[derive(Debug)]
pub struct PlanLease {
    plan_id: String,
    leases: Arc<DashMap<String, ()>>,
}

impl PlanLease {
    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }
}

impl Drop for PlanLease {
    fn drop(&mut self) {
        self.leases.remove(&self.plan_id);
        tracing::debug!(plan_id = %self.plan_id, "Released plan lease");
    }
}

pub struct PlanStateManager {
    db: SharedDatabase,
    cache: DashMap<String, TaskPlan>,
    leases: Arc<DashMap<String, ()>>,
    write_lock: Mutex<()>,
}

impl PlanStateManager {
    pub fn new(db: SharedDatabase) -> Self {
        Self {
            db,
            cache: DashMap::new(),
            leases: Arc::new(DashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Open the database at `path` and wrap it
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Arc::new(Database::new(path)?)))
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&PlanStore<'_>) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        let joined = tokio::task::spawn_blocking(move || {
            let store = PlanStore::new(&db);
            f(&store)
        })
        .await
        .map_err(|e| anyhow::anyhow!("Storage task failed: {}", e))?;
        Ok(joined?)
    }

    /// Persist the full plan and refresh the cache
    pub async fn save_plan(&self, plan: &TaskPlan) -> Result<()> {
        let record = plan.clone();
        self.with_store(move |store| store.upsert_plan(&record))
            .await?;
        self.cache.insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    /// Cached copy if present, else the stored record. `None` if unknown.
    pub async fn load_plan(&self, plan_id: &str) -> Result<Option<TaskPlan>> {
        if let Some(plan) = self.cache.get(plan_id) {
            return Ok(Some(plan.clone()));
        }
        self.reload_plan(plan_id).await
    }

    /// Read from storage, bypassing and then refreshing the cache
    pub async fn reload_plan(&self, plan_id: &str) -> Result<Option<TaskPlan>> {
        let id = plan_id.to_string();
        let plan = self.with_store(move |store| store.get_plan(&id)).await?;
        match &plan {
            Some(plan) => {
                self.cache.insert(plan.id.clone(), plan.clone());
            }
            None => {
                self.cache.remove(plan_id);
            }
        }
        Ok(plan)
    }

    /// Stored record for a read-modify-write. Another process may have
    /// written since this process cached the plan.
    async fn require_plan(&self, plan_id: &str) -> Result<TaskPlan> {
        self.reload_plan(plan_id)
            .await?
            .ok_or_else(|| StratumError::not_found("plan", plan_id))
    }

    pub async fn update_plan_state(&self, plan_id: &str, patch: PlanStatePatch) -> Result<TaskPlan> {
        let _guard = self.write_lock.lock().await;
        let mut plan = self.require_plan(plan_id).await?;

        if let Some(status) = patch.status {
            if plan.status.is_finished() && status != plan.status {
                return Err(StratumError::Validation(format!(
                    "plan {} is already {}",
                    plan_id, plan.status
                )));
            }
            plan.status = status;
        }
        if patch.started.is_some() {
            plan.started = patch.started;
        }
        if patch.completed.is_some() {
            plan.completed = patch.completed;
        }
        plan.refresh_progress();

        self.save_plan(&plan).await?;
        tracing::info!(plan_id = %plan_id, status = %plan.status, "Updated plan state");
        Ok(plan)
    }

    pub async fn update_task_state(
        &self,
        plan_id: &str,
        task_id: &str,
        patch: TaskPatch,
    ) -> Result<TaskPlan> {
        let _guard = self.write_lock.lock().await;
        let mut plan = self.require_plan(plan_id).await?;

        let task = plan
            .task_mut(task_id)
            .ok_or_else(|| StratumError::not_found("task", task_id))?;

        if let Some(status) = patch.status {
            if task.status.is_terminal() && status != task.status {
                return Err(StratumError::Validation(format!(
                    "task {} is already {} and cannot become {}",
                    task_id, task.status, status
                )));
            }
            task.status = status;
        }
        if patch.started.is_some() {
            task.started = patch.started;
        }
        if patch.completed.is_some() {
            task.completed = patch.completed;
        }
        if patch.result.is_some() {
            task.result = patch.result;
        }
        if patch.error.is_some() {
            task.error = patch.error;
        }
        if let Some(retries) = patch.retries_attempted {
            task.retries_attempted = retries;
        }

        let status = task.status;
        if let Some(dependencies) = patch.dependencies {
            task.dependencies = dependencies;
            plan.rebuild_dependencies();
            plan.graph()?;
        }
        plan.refresh_progress();

        self.save_plan(&plan).await?;
        tracing::debug!(plan_id = %plan_id, task_id = %task_id, status = %status, "Updated task");
        Ok(plan)
    }

    /// Replace definition fields. A new task list is validated and the
    /// dependency projection rebuilt before persisting.
    pub async fn update_plan(&self, plan_id: &str, patch: PlanPatch) -> Result<TaskPlan> {
        let _guard = self.write_lock.lock().await;
        let mut plan = self.require_plan(plan_id).await?;

        if let Some(title) = patch.title {
            plan.title = title;
        }
        if let Some(description) = patch.description {
            plan.description = description;
        }
        if let Some(metadata) = patch.metadata {
            plan.metadata = metadata;
        }
        if let Some(risk_level) = patch.risk_level {
            plan.risk_level = risk_level;
        }
        if let Some(tasks) = patch.tasks {
            plan.tasks = tasks;
            plan.rebuild_dependencies();
            plan.graph()?;
            plan.estimated_duration = plan.tasks.iter().map(|t| t.estimated_duration).sum();
        }
        plan.refresh_progress();

        self.save_plan(&plan).await?;
        Ok(plan)
    }

    pub async fn save_plan_results(&self, results: &PlanResults) -> Result<()> {
        let record = results.clone();
        self.with_store(move |store| store.upsert_results(&record))
            .await?;
        tracing::info!(plan_id = %results.plan_id, "Saved plan results");
        Ok(())
    }

    pub async fn get_plan_results(&self, plan_id: &str) -> Result<Option<PlanResults>> {
        let id = plan_id.to_string();
        self.with_store(move |store| store.get_results(&id)).await
    }

    /// The plan if it can still make progress; `None` for completed or
    /// failed plans and for unknown ids.
    pub async fn resume_plan(&self, plan_id: &str) -> Result<Option<TaskPlan>> {
        let Some(plan) = self.reload_plan(plan_id).await? else {
            return Ok(None);
        };
        if plan.status.is_finished() {
            tracing::debug!(plan_id = %plan_id, status = %plan.status, "Plan is finished, not resumable");
            return Ok(None);
        }

        let remaining = plan
            .tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .count();
        tracing::info!(plan_id = %plan_id, remaining, "Resuming plan");
        Ok(Some(plan))
    }

    /// Every loadable plan; corrupt records are skipped and logged.
    pub async fn list_plans(&self) -> Result<Vec<TaskPlan>> {
        self.with_store(|store| {
            let mut plans = Vec::new();
            for id in store.list_ids()? {
                match store.get_plan(&id) {
                    Ok(Some(plan)) => plans.push(plan),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(plan_id = %id, error = %format!("{:#}", e), "Skipping unreadable plan record");
                    }
                }
            }
            Ok(plans)
        })
        .await
    }

    /// Plans that are neither completed nor failed
    pub async fn list_active_plans(&self) -> Result<Vec<TaskPlan>> {
        Ok(self
            .list_plans()
            .await?
            .into_iter()
            .filter(|p| !p.status.is_finished())
            .collect())
    }

    /// Remove a plan record. Results are kept unless `prune_results`.
    pub async fn delete_plan(&self, plan_id: &str, prune_results: bool) -> Result<bool> {
        if self.leases.contains_key(plan_id) {
            return Err(StratumError::PlanBusy(plan_id.to_string()));
        }
        let _guard = self.write_lock.lock().await;
        let id = plan_id.to_string();
        let removed = self
            .with_store(move |store| {
                let removed = store.delete_plan(&id)?;
                if prune_results {
                    store.delete_results(&id)?;
                }
                Ok(removed)
            })
            .await?;
        self.cache.remove(plan_id);
        Ok(removed)
    }

    /// Claim exclusive execution of a plan.
    pub fn acquire_lease(&self, plan_id: &str) -> Result<PlanLease> {
        use dashmap::mapref::entry::Entry;

        match self.leases.entry(plan_id.to_string()) {
            Entry::Occupied(_) => Err(StratumError::PlanBusy(plan_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
                tracing::debug!(plan_id = %plan_id, "Acquired plan lease");
                Ok(PlanLease {
                    plan_id: plan_id.to_string(),
                    leases: Arc::clone(&self.leases),
                })
            }
        }
    }

    pub fn is_leased(&self, plan_id: &str) -> bool {
        self.leases.contains_key(plan_id)
    }

    /// Drop the cached copy so the next load hits storage
    pub fn invalidate(&self, plan_id: &str) {
        self.cache.remove(plan_id);
    }

    /// Mark tasks left `in_progress` by an interrupted run as pending again.
    pub async fn reset_interrupted_tasks(&self, plan_id: &str) -> Result<TaskPlan> {
        let _guard = self.write_lock.lock().await;
        let mut plan = self.require_plan(plan_id).await?;

        let mut reset = 0;
        for task in plan
            .tasks
            .iter_mut()
            .filter(|t| matches!(t.status, TaskStatus::InProgress | TaskStatus::Cancelled | TaskStatus::Skipped))
        {
            task.status = TaskStatus::Pending;
            task.started = None;
            task.error = None;
            reset += 1;
        }

        if reset > 0 {
            plan.refresh_progress();
            self.save_plan(&plan).await?;
            tracing::info!(plan_id = %plan_id, reset, "Reset interrupted tasks");
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::model::{PlanStatus, PlanMetadata, PlanProgress, PlanningContext, RiskLevel, Task, TaskType};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn sample_plan(id: &str) -> TaskPlan {
        let a = Task::new("a", "Analyze", TaskType::Analysis);
        let mut b = Task::new("b", "Implement", TaskType::Implementation);
        b.dependencies = vec!["a".into()];
        let mut plan = TaskPlan {
            id: id.into(),
            title: "Sample".into(),
            description: "sample plan".into(),
            request: "do things".into(),
            tasks: vec![a, b],
            dependencies: BTreeMap::new(),
            estimated_duration: 30,
            status: PlanStatus::Planning,
            progress: PlanProgress::default(),
            created: Utc::now(),
            started: None,
            completed: None,
            metadata: PlanMetadata::default(),
            risk_level: RiskLevel::Low,
            context: PlanningContext::new("/tmp/project"),
        };
        plan.rebuild_dependencies();
        plan.refresh_progress();
        plan
    }

    fn manager(temp: &TempDir) -> PlanStateManager {
        PlanStateManager::open(&temp.path().join("plans.db")).unwrap()
    }

    #[tokio::test]
    async fn save_then_load_round_trips_from_storage() {
        let temp = TempDir::new().unwrap();
        let mut plan = sample_plan("p1");
        let started = Utc::now() - chrono::Duration::minutes(5);
        let finished = Utc::now();
        plan.status = PlanStatus::Failed;
        plan.started = Some(started);
        plan.completed = Some(finished);
        plan.risk_level = RiskLevel::High;
        plan.metadata.confidence = 0.85;
        plan.metadata.adaptations = vec!["used heuristic decomposition".into()];
        plan.tasks[0].status = TaskStatus::Completed;
        plan.tasks[0].started = Some(started);
        plan.tasks[0].completed = Some(finished);
        plan.tasks[0].result = Some(serde_json::json!({"files": 3}));
        plan.tasks[1].status = TaskStatus::Failed;
        plan.tasks[1].started = Some(started);
        plan.tasks[1].completed = Some(finished);
        plan.tasks[1].retries_attempted = 2;
        plan.refresh_progress();
        manager(&temp).save_plan(&plan).await.unwrap();

        // fresh manager, no cache
        let loaded = manager(&temp).load_plan("p1").await.unwrap().unwrap();
        assert_eq!(loaded, plan);
        assert_eq!(loaded.created, plan.created);
        assert_eq!(loaded.started, Some(started));
        assert_eq!(loaded.tasks[1].completed, Some(finished));
        assert_eq!(loaded.metadata.confidence, 0.85);
    }

    #[tokio::test]
    async fn updates_start_from_what_another_writer_stored() {
        let temp = TempDir::new().unwrap();
        let runner = manager(&temp);
        let other = manager(&temp);
        runner.save_plan(&sample_plan("p1")).await.unwrap();
        runner
            .update_plan_state("p1", PlanStatePatch::status(PlanStatus::Executing))
            .await
            .unwrap();

        other
            .update_plan_state("p1", PlanStatePatch::status(PlanStatus::Cancelled))
            .await
            .unwrap();
        let plan = runner
            .update_task_state("p1", "a", TaskPatch::status(TaskStatus::Completed))
            .await
            .unwrap();

        assert_eq!(plan.status, PlanStatus::Cancelled);
        let stored = other.reload_plan("p1").await.unwrap().unwrap();
        assert_eq!(stored.status, PlanStatus::Cancelled);
        assert_eq!(stored.task("a").unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn unknown_plan_is_none_not_error() {
        let temp = TempDir::new().unwrap();
        assert!(manager(&temp).load_plan("ghost").await.unwrap().is_none());
        assert!(matches!(
            manager(&temp)
                .update_plan_state("ghost", PlanStatePatch::status(PlanStatus::Executing))
                .await,
            Err(StratumError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn task_updates_refresh_progress_and_guard_terminal_states() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        mgr.save_plan(&sample_plan("p1")).await.unwrap();

        let plan = mgr
            .update_task_state("p1", "a", TaskPatch::status(TaskStatus::Completed))
            .await
            .unwrap();
        assert_eq!(plan.progress.completed, 1);
        assert_eq!(plan.progress.percentage, 50.0);

        let err = mgr
            .update_task_state("p1", "a", TaskPatch::status(TaskStatus::InProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, StratumError::Validation(_)));

        let err = mgr
            .update_task_state("p1", "zzz", TaskPatch::status(TaskStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, StratumError::NotFound { kind: "task", .. }));
    }

    #[tokio::test]
    async fn dependency_changes_rebuild_projection() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        mgr.save_plan(&sample_plan("p1")).await.unwrap();

        let plan = mgr
            .update_task_state(
                "p1",
                "b",
                TaskPatch {
                    dependencies: Some(vec![]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(plan.dependencies["b"].is_empty());

        let err = mgr
            .update_task_state(
                "p1",
                "a",
                TaskPatch {
                    dependencies: Some(vec!["a".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StratumError::CyclicDependency { .. }));
    }

    #[tokio::test]
    async fn update_plan_replaces_tasks() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        mgr.save_plan(&sample_plan("p1")).await.unwrap();

        let mut only = Task::new("solo", "Solo", TaskType::Review);
        only.estimated_duration = 12;
        let plan = mgr
            .update_plan(
                "p1",
                PlanPatch {
                    tasks: Some(vec![only]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(plan.progress.total, 1);
        assert_eq!(plan.estimated_duration, 12);
        assert_eq!(plan.dependencies.keys().collect::<Vec<_>>(), vec!["solo"]);
    }

    #[tokio::test]
    async fn resume_only_unfinished_plans() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);

        for (id, status) in [
            ("planning", PlanStatus::Planning),
            ("executing", PlanStatus::Executing),
            ("cancelled", PlanStatus::Cancelled),
            ("completed", PlanStatus::Completed),
            ("failed", PlanStatus::Failed),
        ] {
            let mut plan = sample_plan(id);
            plan.status = status;
            mgr.save_plan(&plan).await.unwrap();
        }

        assert!(mgr.resume_plan("planning").await.unwrap().is_some());
        assert!(mgr.resume_plan("executing").await.unwrap().is_some());
        assert!(mgr.resume_plan("cancelled").await.unwrap().is_some());
        assert!(mgr.resume_plan("completed").await.unwrap().is_none());
        assert!(mgr.resume_plan("failed").await.unwrap().is_none());

        let mut active: Vec<String> = mgr
            .list_active_plans()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        active.sort();
        assert_eq!(active, vec!["cancelled", "executing", "planning"]);
    }

    #[tokio::test]
    async fn listing_skips_corrupt_records() {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&temp.path().join("plans.db")).unwrap());
        db.conn()
            .execute(
                "INSERT INTO plans (id, title, status, content, created_at, updated_at)
                 VALUES ('broken', 'Broken', 'executing', '{\"id\": 5}', 'x', 'x')",
                [],
            )
            .unwrap();

        let mgr = PlanStateManager::new(db);
        mgr.save_plan(&sample_plan("good")).await.unwrap();

        let plans = mgr.list_active_plans().await.unwrap();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].id, "good");
    }

    #[tokio::test]
    async fn results_are_independent_of_plan_record() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        mgr.save_plan(&sample_plan("p1")).await.unwrap();

        let results = PlanResults {
            plan_id: "p1".into(),
            status: PlanStatus::Completed,
            task_outcomes: vec![],
            files_involved: vec!["src/lib.rs".into()],
            metrics: Default::default(),
            recorded_at: Utc::now(),
        };
        mgr.save_plan_results(&results).await.unwrap();

        assert!(mgr.delete_plan("p1", false).await.unwrap());
        assert!(mgr.load_plan("p1").await.unwrap().is_none());
        assert_eq!(mgr.get_plan_results("p1").await.unwrap(), Some(results));

        mgr.delete_plan("p1", true).await.unwrap();
        assert!(mgr.get_plan_results("p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_dropped() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);

        let lease = mgr.acquire_lease("p1").unwrap();
        assert_eq!(lease.plan_id(), "p1");
        assert!(matches!(
            mgr.acquire_lease("p1"),
            Err(StratumError::PlanBusy(_))
        ));
        assert!(mgr.acquire_lease("p2").is_ok());

        drop(lease);
        assert!(!mgr.is_leased("p1"));
        assert!(mgr.acquire_lease("p1").is_ok());
    }

    #[tokio::test]
    async fn legacy_date_wrappers_are_read() {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&temp.path().join("plans.db")).unwrap());
        let plan = sample_plan("legacy");

        let mut value = serde_json::to_value(&plan).unwrap();
        value["created"] = serde_json::json!({"type": "Date", "value": "2024-01-02T03:04:05Z"});
        db.conn()
            .execute(
                "INSERT INTO plans (id, title, status, content, created_at, updated_at)
                 VALUES ('legacy', 'Legacy', 'planning', ?1, 'x', 'x')",
                [value.to_string()],
            )
            .unwrap();

        let loaded = PlanStateManager::new(db)
            .load_plan("legacy")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.created.to_rfc3339(), "2024-01-02T03:04:05+00:00");
    }

    #[tokio::test]
    async fn interrupted_tasks_reset_to_pending() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        let mut plan = sample_plan("p1");
        plan.tasks[0].status = TaskStatus::Completed;
        plan.tasks[1].status = TaskStatus::InProgress;
        mgr.save_plan(&plan).await.unwrap();

        let plan = mgr.reset_interrupted_tasks("p1").await.unwrap();
        assert_eq!(plan.tasks[0].status, TaskStatus::Completed);
        assert_eq!(plan.tasks[1].status, TaskStatus::Pending);
    }
}
