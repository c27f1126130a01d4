//! Single-loop batch scheduler.
//!
//! One loop consumes coalesced ticks. Each iteration expires starved tasks,
//! then dispatches the best ready task (start reached, resources free,
//! lowest karma) or arms a one-shot wake-up for the next start. Dispatched
//! actions run on their own tasks; their completion updates the registry,
//! releases the reservation and ticks the loop again.
//!
//! Lock order: registry, then resource counters. Neither is held across an
//! await; events are published after the registry lock is released.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::action::{Recovered, Run, RunRecord};
use crate::core::events::{Event, PubSub};
use crate::core::resource_pool::{Resources, Spawn};
use crate::core::runner::Runner;
use crate::core::scope::{ExecScope, TaskCancel};
use crate::core::task::{by_karma, by_start, Status, Task};
use crate::core::tick::Ticker;
use crate::core::SchedulerError;
use crate::infra::store::JsonStore;
use crate::runtime::TokioSpawner;
use crate::util::clock;

/// Wake-up delay when nothing is scheduled in the future.
pub const IDLE_WAKEUP: Duration = Duration::from_secs(1);

/// Error recorded on tasks that waited past their maximum wait time.
pub const STARVED: &str = "max wait time exceeded";

/// Batch scheduler over a CPU/RAM budget.
pub struct Scheduler<S = TokioSpawner> {
    resources: Resources,
    tasks: RwLock<HashMap<Uuid, Task>>,
    runner: Arc<dyn Runner>,
    spawner: S,
    ticker: Ticker,
    pubsub: PubSub,
    store: Option<JsonStore>,
    running: AtomicBool,
    wakeup: Mutex<Option<DateTime<Utc>>>,
}

impl<S> std::fmt::Debug for Scheduler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("resources", &self.resources.snapshot())
            .field("tasks", &self.tasks.read().len())
            .field("home", &self.runner.home())
            .finish_non_exhaustive()
    }
}

impl<S> Scheduler<S>
where
    S: Spawn + Send + Sync + 'static,
{
    /// Scheduler without persistence.
    pub fn new(resources: Resources, runner: Arc<dyn Runner>, spawner: S) -> Self {
        Self {
            resources,
            tasks: RwLock::new(HashMap::new()),
            runner,
            spawner,
            ticker: Ticker::new(),
            pubsub: PubSub::new(),
            store: None,
            running: AtomicBool::new(false),
            wakeup: Mutex::new(None),
        }
    }

    /// Write every task change through to `store`.
    #[must_use]
    pub fn with_store(mut self, store: JsonStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Reload tasks from the store. Call before [`Self::start`].
    ///
    /// Runs of tasks stored as running are looked up again: live ones are
    /// followed under a fresh reservation, finished ones settle as done or
    /// error, and lost ones become errors. Periodic tasks that ended are
    /// re-armed. Returns the number of tasks loaded.
    pub async fn restore(self: &Arc<Self>) -> Result<usize, SchedulerError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let mut stored = store.tasks()?;
        stored.retain(|task| task.id.is_some());

        let loaded = stored.len();
        let mut resumed = Vec::new();
        for mut task in stored {
            let Some(id) = task.id else {
                continue;
            };
            let now = clock::now();
            let mut changed = false;
            if task.status == Status::Running {
                task.cancel = None;
                match self.runner.reattach(&task).await {
                    Recovered::Running(run) => resumed.push((id, run)),
                    recovered => settle_recovered(&mut task, recovered),
                }
                changed = true;
            }
            if task.has_cron() && task.status.is_terminal() && task.status != Status::Canceled {
                task.status = Status::Waiting;
                task.prepare_reschedule(now);
                tracing::info!(task = %id, next = %task.start, "periodic task re-armed");
                changed = true;
            }
            if changed {
                task.mtime = now.max(task.mtime);
                self.persist(&task);
            }
            self.tasks.write().insert(id, task);
        }

        let followed = resumed.len();
        for (id, run) in resumed {
            self.resume(id, run);
        }
        tracing::info!(tasks = loaded, followed, "restored tasks");
        self.ticker.ping();
        Ok(loaded)
    }

    /// Admit a task as waiting and return its new id.
    pub async fn add(&self, mut task: Task) -> Result<Uuid, SchedulerError> {
        if task.id.is_some() {
            return Err(SchedulerError::Conflict("task already has an id".into()));
        }
        self.resources.check(task.cpu, task.ram)?;
        if task.max_execution_time.is_zero() {
            return Err(SchedulerError::InvalidArgument(
                "max execution time must be positive".into(),
            ));
        }
        if task.action.is_none() {
            return Err(SchedulerError::InvalidArgument("task has no action".into()));
        }

        let id = Uuid::new_v4();
        task.id = Some(id);
        task.status = Status::Waiting;
        task.mtime = clock::now();
        task.cancel = None;
        {
            let mut tasks = self.tasks.write();
            self.persist(&task);
            tracing::info!(
                task = %id,
                owner = %task.owner,
                cpu = task.cpu,
                ram = task.ram,
                start = %task.start,
                "task added"
            );
            tasks.insert(id, task);
        }
        self.ticker.ping();
        self.pubsub.publish(Event::new("added", id)).await;
        Ok(id)
    }

    /// Snapshot of every task, earliest start first.
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.read().values().map(snapshot).collect();
        tasks.sort_by(by_start);
        tasks
    }

    /// Snapshot of `owner`'s tasks.
    pub fn filter(&self, owner: &str) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.owner == owner)
            .map(snapshot)
            .collect();
        tasks.sort_by(by_start);
        tasks
    }

    /// Snapshot of one task.
    pub fn get_task(&self, id: Uuid) -> Result<Task, SchedulerError> {
        self.tasks
            .read()
            .get(&id)
            .map(snapshot)
            .ok_or(SchedulerError::NotFound(id))
    }

    /// Number of tasks in the registry.
    pub fn length(&self) -> usize {
        self.tasks.read().len()
    }

    /// Root of the working directories.
    pub fn data_dir(&self) -> &Path {
        self.runner.home()
    }

    /// Resource accountant.
    pub const fn resources(&self) -> &Resources {
        &self.resources
    }

    /// Event bus.
    pub const fn pubsub(&self) -> &PubSub {
        &self.pubsub
    }

    /// Cancel a task. Terminal tasks are left untouched.
    pub async fn cancel(&self, id: Uuid) -> Result<(), SchedulerError> {
        {
            let mut tasks = self.tasks.write();
            let task = tasks.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;
            match task.status {
                Status::Running => {
                    if let Some(cancel) = task.cancel.take() {
                        cancel.cancel();
                    }
                }
                Status::Waiting => {}
                _ => return Ok(()),
            }
            task.status = Status::Canceled;
            task.mtime = clock::now().max(task.mtime);
            self.persist(task);
        }
        tracing::info!(task = %id, "task canceled");
        self.ticker.ping();
        self.pubsub.publish(Event::new(Status::Canceled.as_str(), id)).await;
        Ok(())
    }

    /// Cancel a task if needed and forget it.
    pub async fn delete(&self, id: Uuid) -> Result<(), SchedulerError> {
        {
            let mut tasks = self.tasks.write();
            let task = tasks.remove(&id).ok_or(SchedulerError::NotFound(id))?;
            if let Some(cancel) = &task.cancel {
                cancel.cancel();
            }
            if let Some(store) = &self.store {
                if let Err(err) = store.delete(id) {
                    tracing::error!(task = %id, error = %err, "store delete failed");
                }
            }
        }
        tracing::info!(task = %id, "task deleted");
        self.ticker.ping();
        self.pubsub.publish(Event::new("deleted", id)).await;
        Ok(())
    }

    /// Remove terminal tasks whose last change is older than `age`.
    pub fn flush(&self, age: Duration) -> usize {
        self.flush_at(clock::now(), age)
    }

    fn flush_at(&self, now: DateTime<Utc>, age: Duration) -> usize {
        let mut removed = Vec::new();
        self.tasks.write().retain(|id, task| {
            let expired = task.status.is_terminal() && clock::add(task.mtime, age) < now;
            if expired {
                removed.push(*id);
            }
            !expired
        });
        if let Some(store) = &self.store {
            for id in &removed {
                if let Err(err) = store.delete(*id) {
                    tracing::error!(task = %id, error = %err, "store delete failed");
                }
            }
        }
        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), age = ?age, "flushed tasks");
        }
        removed.len()
    }

    /// Spawn the main loop on the scheduler's spawner.
    pub fn start(self: &Arc<Self>, scope: &CancellationToken) {
        let this = Arc::clone(self);
        let scope = scope.clone();
        self.spawner.spawn(async move { this.run(scope).await });
    }

    /// Run the main loop until `scope` is cancelled.
    pub async fn run(self: Arc<Self>, scope: CancellationToken) {
        if self.running.swap(true, Ordering::AcqRel) {
            tracing::warn!("scheduler loop already running");
            return;
        }
        tracing::info!(
            cpu = self.resources.total_cpu(),
            ram = self.resources.total_ram(),
            "scheduler loop started"
        );
        self.ticker.ping();
        loop {
            tokio::select! {
                biased;
                () = scope.cancelled() => break,
                () = self.ticker.tick() => self.one_loop().await,
            }
        }
        if let Some(store) = &self.store {
            if let Err(err) = store.sync() {
                tracing::error!(error = %err, "store sync failed");
            }
        }
        self.running.store(false, Ordering::Release);
        tracing::info!("scheduler loop stopped");
    }

    async fn one_loop(self: &Arc<Self>) {
        let now = clock::now();
        for id in self.expire_starved(now) {
            self.pubsub.publish(Event::new(Status::Error.as_str(), id)).await;
        }

        let todos = self.ready_to_go(now);
        tracing::debug!(ready = todos.len(), "loop iteration");
        if let Some(&chosen) = todos.first() {
            if self.dispatch(chosen).await {
                self.ticker.ping();
                return;
            }
        }
        self.arm_wakeup(now);
    }

    fn expire_starved(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut expired = Vec::new();
        let mut tasks = self.tasks.write();
        for (id, task) in tasks.iter_mut() {
            if task.status != Status::Waiting || task.max_wait_time.is_zero() {
                continue;
            }
            if now > clock::add(task.start, task.max_wait_time) {
                task.status = Status::Error;
                task.error = Some(STARVED.to_string());
                task.mtime = now.max(task.mtime);
                self.persist(task);
                tracing::warn!(task = %id, "task starved");
                expired.push(*id);
            }
        }
        expired
    }

    fn ready_to_go(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let tasks = self.tasks.read();
        let mut ready: Vec<&Task> = tasks
            .values()
            .filter(|t| {
                t.status == Status::Waiting
                    && t.start <= now
                    && self.resources.is_doable(t.cpu, t.ram)
            })
            .collect();
        ready.sort_by(|a, b| by_karma(a, b).then_with(|| by_start(a, b)));
        ready.iter().filter_map(|t| t.id).collect()
    }

    fn next_start(&self) -> Option<DateTime<Utc>> {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status == Status::Waiting)
            .map(|t| t.start)
            .min()
    }

    fn arm_wakeup(self: &Arc<Self>, now: DateTime<Utc>) {
        let delay = match self.next_start() {
            Some(start) if start > now => clock::until(start),
            _ => IDLE_WAKEUP,
        };
        let at = clock::add(now, delay);
        {
            let mut pending = self.wakeup.lock();
            if matches!(*pending, Some(p) if p > now && p <= at) {
                return;
            }
            *pending = Some(at);
        }
        tracing::debug!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "wake-up armed");
        let this = Arc::clone(self);
        self.spawner.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut pending = this.wakeup.lock();
                if *pending == Some(at) {
                    *pending = None;
                }
            }
            this.ticker.ping();
        });
    }

    async fn dispatch(self: &Arc<Self>, id: Uuid) -> bool {
        let (task, exec, reservation) = {
            let mut tasks = self.tasks.write();
            let Some(task) = tasks.get_mut(&id) else {
                return false;
            };
            if task.status != Status::Waiting {
                return false;
            }
            let reservation = CancellationToken::new();
            let ticker = self.ticker.clone();
            if !self
                .resources
                .reserve(&reservation, task.cpu, task.ram, move || ticker.ping())
            {
                tracing::debug!(task = %id, "resources taken meanwhile");
                return false;
            }
            let exec = ExecScope::new(&reservation, task.max_execution_time);
            task.cancel = Some(TaskCancel::new(&reservation, &exec));
            task.status = Status::Running;
            task.mtime = clock::now().max(task.mtime);
            task.attempts += 1;
            task.error = None;
            self.persist(task);
            (task.clone(), exec, reservation)
        };

        let free = self.resources.snapshot();
        tracing::info!(
            task = %id,
            cpu = task.cpu,
            ram = task.ram,
            free_cpu = free.cpu,
            free_ram = free.ram,
            attempt = task.attempts,
            "task dispatched"
        );
        self.pubsub.publish(Event::new(Status::Running.as_str(), id)).await;

        let this = Arc::clone(self);
        self.spawner.spawn(async move {
            this.execute(id, task, exec, reservation).await;
        });
        true
    }

    async fn execute(
        self: Arc<Self>,
        id: Uuid,
        task: Task,
        exec: ExecScope,
        reservation: CancellationToken,
    ) {
        match self.runner.up(&task).await {
            Ok(run) => {
                self.record_run(id, run.record());
                self.follow(id, run, exec, reservation).await;
            }
            Err(err) => {
                tracing::error!(task = %id, error = %err, "action failed to start");
                self.complete(id, Err(err), None).await;
                reservation.cancel();
            }
        }
    }

    async fn follow(&self, id: Uuid, mut run: Run, exec: ExecScope, reservation: CancellationToken) {
        let result = run.wait(&exec).await;
        self.complete(id, result, Some(run.record())).await;
        reservation.cancel();
    }

    /// Follow a run found alive by [`Self::restore`] under a fresh
    /// reservation, with whatever execution time it has left.
    fn resume(self: &Arc<Self>, id: Uuid, mut run: Run) {
        let scopes = {
            let mut tasks = self.tasks.write();
            let Some(task) = tasks.get_mut(&id) else {
                return;
            };
            let reservation = CancellationToken::new();
            let ticker = self.ticker.clone();
            if self
                .resources
                .reserve(&reservation, task.cpu, task.ram, move || ticker.ping())
            {
                let left = task
                    .max_execution_time
                    .saturating_sub(clock::since(run.record().start));
                let exec = ExecScope::new(&reservation, left);
                task.cancel = Some(TaskCancel::new(&reservation, &exec));
                task.run = Some(run.record());
                Some((exec, reservation))
            } else {
                task.status = Status::Error;
                task.error = Some("no room left for the run after a restart".into());
                task.mtime = clock::now().max(task.mtime);
                self.persist(task);
                None
            }
        };

        match scopes {
            Some((exec, reservation)) => {
                tracing::info!(task = %id, "following recovered run");
                let this = Arc::clone(self);
                self.spawner.spawn(async move {
                    this.follow(id, run, exec, reservation).await;
                });
            }
            None => {
                tracing::warn!(task = %id, "recovered run exceeds the budget, tearing it down");
                self.spawner.spawn(async move {
                    if let Err(err) = run.down().await {
                        tracing::warn!(task = %id, error = %err, "teardown failed");
                    }
                });
            }
        }
    }

    fn record_run(&self, id: Uuid, record: RunRecord) {
        let mut tasks = self.tasks.write();
        if let Some(task) = tasks.get_mut(&id) {
            task.run = Some(record);
            self.persist(task);
        }
    }

    async fn complete(
        &self,
        id: Uuid,
        result: Result<Status, SchedulerError>,
        record: Option<RunRecord>,
    ) {
        let now = clock::now();
        let event = {
            let mut tasks = self.tasks.write();
            let Some(task) = tasks.get_mut(&id) else {
                tracing::debug!(task = %id, "completed task is gone");
                return;
            };
            task.cancel = None;
            if record.is_some() {
                task.run = record;
            }
            if task.status == Status::Running {
                let (status, error) = match result {
                    Ok(Status::Error) => (Status::Error, Some("action reported an error".to_string())),
                    Ok(status) => (status, None),
                    Err(err) => (Status::Error, Some(err.to_string())),
                };
                task.mtime = now.max(task.mtime);
                task.error = error;
                let event = if status == Status::Error && task.retry > 0 {
                    task.retry -= 1;
                    task.status = Status::Waiting;
                    tracing::warn!(task = %id, retries_left = task.retry, error = ?task.error, "task failed, retrying");
                    Event::new(Status::Waiting.as_str(), id)
                } else {
                    task.status = status;
                    tracing::info!(task = %id, status = %status, "task finished");
                    if task.has_cron() && status != Status::Canceled {
                        task.status = Status::Waiting;
                        task.prepare_reschedule(now);
                        tracing::info!(task = %id, next = %task.start, "periodic task re-armed");
                    }
                    Event::new(status.as_str(), id)
                };
                self.persist(task);
                Some(event)
            } else {
                self.persist(task);
                None
            }
        };
        self.ticker.ping();
        if let Some(event) = event {
            self.pubsub.publish(event).await;
        }
    }

    fn persist(&self, task: &Task) {
        if let Some(store) = &self.store {
            if let Err(err) = store.put(task) {
                tracing::error!(task = ?task.id, error = %err, "store write failed");
            }
        }
    }
}

/// Copy of `task` for callers; the scopes stay with the dispatcher.
fn snapshot(task: &Task) -> Task {
    let mut copy = task.clone();
    copy.cancel = None;
    copy
}

/// Terminal status of a stored running task whose run is not alive.
fn settle_recovered(task: &mut Task, recovered: Recovered) {
    let (status, error) = match recovered {
        Recovered::Exited(0) => (Status::Done, None),
        Recovered::Exited(code) => (Status::Error, Some(format!("exited with code {code} during a restart"))),
        Recovered::Dead => (Status::Error, Some("run died during a restart".to_string())),
        Recovered::Lost | Recovered::Running(_) => (Status::Error, Some("interrupted by a restart".to_string())),
    };
    tracing::info!(task = ?task.id, status = %status, "stored run settled");
    task.status = status;
    task.error = error;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::action::{Action, Dummy};
    use crate::core::runner::WorkdirRunner;

    fn scheduler(cpu: u32, ram: u32) -> Arc<Scheduler> {
        let runner = Arc::new(WorkdirRunner::new(std::env::temp_dir().join("batch-scheduler-unit")));
        Arc::new(Scheduler::new(
            Resources::new(cpu, ram),
            runner,
            TokioSpawner::current(),
        ))
    }

    fn dummy(secs: u64) -> Task {
        Task::new("alice", Action::Dummy(Dummy::new("t", Duration::from_millis(1))))
            .with_max_execution_time(Duration::from_secs(secs))
    }

    #[tokio::test]
    async fn add_rejects_bad_requests() {
        let s = scheduler(2, 2);
        assert!(matches!(
            s.add(dummy(1).with_resources(3, 1)).await,
            Err(SchedulerError::ResourceCapacity(_))
        ));
        assert!(matches!(
            s.add(dummy(1).with_resources(0, 1)).await,
            Err(SchedulerError::InvalidArgument(_))
        ));
        let mut with_id = dummy(1);
        with_id.id = Some(Uuid::new_v4());
        assert!(matches!(s.add(with_id).await, Err(SchedulerError::Conflict(_))));
        assert!(matches!(
            s.add(dummy(0)).await,
            Err(SchedulerError::InvalidArgument(_))
        ));
        assert_eq!(s.length(), 0);
    }

    #[tokio::test]
    async fn ready_tasks_sorted_by_karma() {
        let s = scheduler(4, 4);
        let long = s.add(dummy(10)).await.unwrap();
        let short = s.add(dummy(1)).await.unwrap();
        let future = s
            .add(dummy(1).with_start(clock::add(clock::now(), Duration::from_secs(60))))
            .await
            .unwrap();
        let ready = s.ready_to_go(clock::now());
        assert_eq!(ready, vec![short, long]);
        assert!(!ready.contains(&future));
        assert!(s.next_start().is_some());
    }

    #[tokio::test]
    async fn starved_tasks_become_errors() {
        let s = scheduler(1, 1);
        let mut task = dummy(1).with_start(clock::now() - chrono::TimeDelta::seconds(10));
        task.max_wait_time = Duration::from_secs(1);
        let id = s.add(task).await.unwrap();
        assert_eq!(s.expire_starved(clock::now()), vec![id]);
        let task = s.get_task(id).unwrap();
        assert_eq!(task.status, Status::Error);
        assert_eq!(task.error.as_deref(), Some(STARVED));
    }

    #[tokio::test]
    async fn flush_keeps_tasks_exactly_at_age() {
        let s = scheduler(1, 1);
        let id = s.add(dummy(1)).await.unwrap();
        s.cancel(id).await.unwrap();
        let mtime = s.get_task(id).unwrap().mtime;
        let age = Duration::from_secs(60);

        assert_eq!(s.flush_at(clock::add(mtime, age), age), 0);
        assert_eq!(s.length(), 1);
        assert_eq!(s.flush_at(clock::add(mtime, age + Duration::from_nanos(1)), age), 1);
        assert_eq!(s.length(), 0);
    }

    #[tokio::test]
    async fn snapshots_do_not_carry_scopes() {
        let s = scheduler(1, 1);
        s.start(&CancellationToken::new());
        let id = s
            .add(Task::new("alice", Action::Dummy(Dummy::new("t", Duration::from_secs(5)))))
            .await
            .unwrap();
        for _ in 0..200 {
            if s.tasks.read()[&id].status == Status::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(s.tasks.read()[&id].cancel.is_some());
        assert!(s.get_task(id).unwrap().cancel.is_none());
        assert!(s.list().iter().all(|t| t.cancel.is_none()));
        assert!(s.filter("alice").iter().all(|t| t.cancel.is_none()));
        s.cancel(id).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_and_flush_waiting_task() {
        let s = scheduler(1, 1);
        let id = s.add(dummy(1)).await.unwrap();
        assert_eq!(s.flush(Duration::ZERO), 0);
        s.cancel(id).await.unwrap();
        s.cancel(id).await.unwrap();
        assert_eq!(s.get_task(id).unwrap().status, Status::Canceled);
        assert_eq!(s.flush(Duration::from_secs(3600)), 0);
        assert_eq!(s.flush(Duration::ZERO), 1);
        assert!(matches!(s.cancel(id).await, Err(SchedulerError::NotFound(_))));
    }
}
