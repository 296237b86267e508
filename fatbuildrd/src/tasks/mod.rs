//! Task engine: queue, worker loop, lifecycle, and history.
//!
//! Grounded on `tasks/manager.py` (`ServerInstance`/worker loop) and
//! `tasks/__init__.py` (`RunnableTask` lifecycle: prerun/run/postrun/
//! terminate). `spec.md` §4.9 names the task kinds and the lifecycle;
//! `history.rs` implements the purge policies named in this crate's
//! `SPEC_FULL.md` §2 expansion.

pub mod history;
pub mod queue;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde::Serialize;
use snafu::{ResultExt, Snafu};

use crate::builds::{ArtifactBuild, BuildRequest};
use crate::config::Config;
use crate::console::{spawn_acceptor, Frame, TaskIo};
use crate::instances::RunningInstance;
use crate::timer::ServerTimer;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unable to create task workspace {path:?}: {source}"))]
    Workspace {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to persist task record {path:?}: {source}"))]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to serialize task record: {source}"))]
    Serialize { source: serde_yaml::Error },

    #[snafu(transparent)]
    Console { source: crate::console::Error },

    #[snafu(transparent)]
    History { source: history::Error },

    #[snafu(transparent)]
    Builds { source: crate::builds::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The work a task kind performs, declared data (`spec.md` §9's resolution
/// of "dynamic attribute lookup" into an explicit typed record).
pub enum TaskKind {
    Build(BuildRequest),
    ArtifactDelete {
        format: String,
        distribution: String,
        derivative: String,
        artifact: crate::registry::RegistryArtifact,
    },
    KeyringCreate { userid: String },
    KeyringRenew { duration: String },
    ImageCreate { format: String, force: bool },
    ImageUpdate { format: String },
    BuildEnvCreate { format: String, environment: String, architecture: String },
    BuildEnvUpdate { format: String, environment: String, architecture: String },
    HistoryPurge,
}

impl TaskKind {
    /// Matches `histid` groupings used by the `each` purge policy and the
    /// task name surfaced over the wire/in the hook environment.
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Build(_) => "build",
            TaskKind::ArtifactDelete { .. } => "artifact-delete",
            TaskKind::KeyringCreate { .. } => "keyring-create",
            TaskKind::KeyringRenew { .. } => "keyring-renew",
            TaskKind::ImageCreate { .. } => "image-create",
            TaskKind::ImageUpdate { .. } => "image-update",
            TaskKind::BuildEnvCreate { .. } => "build-env-create",
            TaskKind::BuildEnvUpdate { .. } => "build-env-update",
            TaskKind::HistoryPurge => "history-purge",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskResult {
    Success,
    Failed(String),
}

/// One task instance: an id, its kind-specific work, and submission
/// metadata. Mirrors `RunnableTask`'s archivable fields.
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub user: String,
    pub email: String,
    pub message: String,
    pub submission: i64,
}

impl Task {
    pub fn new(kind: TaskKind, user: impl Into<String>, email: impl Into<String>, message: impl Into<String>, submission: i64) -> Self {
        Task {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            user: user.into(),
            email: email.into(),
            message: message.into(),
            submission,
        }
    }

    fn workspace(&self, instance_workspace: &Path) -> PathBuf {
        instance_workspace.join(&self.id)
    }
}

#[derive(Serialize)]
struct TaskRecordForm {
    id: String,
    histid: String,
    submission: i64,
    result: String,
}

/// Runs a hook script synchronously at a task's `start`/`end`, per
/// `spec.md` §4.9. Failures are logged, never propagated.
fn run_hook(hook: Option<&Path>, instance: &RunningInstance, task: &Task, stage: &str, result: Option<&TaskResult>) {
    let Some(hook) = hook else { return };
    let result_str = match result {
        Some(TaskResult::Success) => "success",
        Some(TaskResult::Failed(_)) => "failed",
        None => "",
    };
    let expression = duct::cmd(hook.display().to_string(), Vec::<String>::new())
        .env("FATBUILDR_INSTANCE_ID", instance.instance.id())
        .env("FATBUILDR_INSTANCE_NAME", &instance.instance.def.name)
        .env("FATBUILDR_TASK_ID", &task.id)
        .env("FATBUILDR_TASK_NAME", task.kind.name())
        .env(
            "FATBUILDR_TASK_METADATA",
            base64::engine::general_purpose::STANDARD.encode(&task.message),
        )
        .env("FATBUILDR_TASK_STAGE", stage)
        .env("FATBUILDR_TASK_RESULT", result_str)
        .stdout_null()
        .stderr_null()
        .unchecked();

    let handle = match expression.start() {
        Ok(handle) => handle,
        Err(err) => {
            log::warn!("unable to spawn task hook at stage {stage}: {err}");
            return;
        }
    };

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        match handle.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) if std::time::Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Ok(None) => {
                log::warn!("task hook at stage {stage} timed out after 5s, killing it");
                let _ = handle.kill();
                return;
            }
            Err(err) => {
                log::warn!("task hook failed at stage {stage}: {err}");
                return;
            }
        }
    }
}

/// Runs one task to completion against a running instance, implementing
/// the five-step lifecycle in `spec.md` §4.9: prerun, run, result
/// classification, postrun, terminate.
pub fn run_task(config: &Config, instance: &RunningInstance, task: Task, timer: &ServerTimer) -> Result<TaskResult> {
    let workspace = task.workspace(&instance.workspace(config));
    std::fs::create_dir_all(&workspace).context(WorkspaceSnafu { path: workspace.clone() })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&workspace, std::fs::Permissions::from_mode(0o755))
            .context(WorkspaceSnafu { path: workspace.clone() })?;
    }

    let io = Arc::new(TaskIo::open(&workspace)?);
    let acceptor = spawn_acceptor(io.clone());
    timer.register_worker(instance.instance.id());

    run_hook(config.tasks.hook.as_deref(), instance, &task, "start", None);
    io.dispatch(&Frame::log(20, &format!("starting task {}", task.id)))?;

    let result = match run_kind(config, instance, &task, &workspace, &io) {
        Ok(()) => {
            io.dispatch(&Frame::log(20, "Task succeeded"))?;
            TaskResult::Success
        }
        Err(err) => {
            log::info!("Task failed");
            io.dispatch(&Frame::log(20, &format!("Task failed: {err}")))?;
            TaskResult::Failed(err.to_string())
        }
    };

    run_hook(config.tasks.hook.as_deref(), instance, &task, "end", Some(&result));

    io.close();
    let _ = acceptor.join();
    timer.unregister_worker(instance.instance.id());

    let record = TaskRecordForm {
        id: task.id.clone(),
        histid: task.kind.name().to_string(),
        submission: task.submission,
        result: match &result {
            TaskResult::Success => "success".to_string(),
            TaskResult::Failed(reason) => format!("failed: {reason}"),
        },
    };
    let serialized = serde_yaml::to_string(&record).context(SerializeSnafu)?;
    std::fs::write(workspace.join("task.yml"), serialized).context(PersistSnafu {
        path: workspace.join("task.yml"),
    })?;

    Ok(result)
}

fn run_kind(config: &Config, instance: &RunningInstance, task: &Task, workspace: &Path, io: &Arc<TaskIo>) -> std::result::Result<(), Box<dyn std::error::Error>> {
    match &task.kind {
        TaskKind::Build(request) => {
            let build = ArtifactBuild::new(config, instance, request.clone(), workspace.to_path_buf(), io.clone());
            build.run()?;
        }
        TaskKind::ArtifactDelete {
            format,
            distribution,
            derivative,
            artifact,
        } => {
            let registry = instance.registry(config, format)?;
            registry.delete_artifact(distribution, derivative, artifact)?;
        }
        TaskKind::KeyringCreate { userid } => {
            let mut keyring = crate::keyring::InstanceKeyring::new(config, instance.instance.id());
            keyring.create(userid)?;
        }
        TaskKind::KeyringRenew { duration } => {
            let mut keyring = crate::keyring::InstanceKeyring::new(config, instance.instance.id());
            keyring.load()?;
            keyring.renew(duration)?;
        }
        TaskKind::ImageCreate { format, force } => {
            let images = instance.images_manager(config);
            images.image(format).create(config, *force)?;
        }
        TaskKind::ImageUpdate { format } => {
            let images = instance.images_manager(config);
            images.image(format).update()?;
        }
        TaskKind::BuildEnvCreate { format, environment, architecture } => {
            let images = instance.images_manager(config);
            let image = images.image(format);
            let env = images.build_env(&image, environment, architecture, &instance.instance.pipelines);
            env.create()?;
        }
        TaskKind::BuildEnvUpdate { format, environment, architecture } => {
            let images = instance.images_manager(config);
            let image = images.image(format);
            let env = images.build_env(&image, environment, architecture, &instance.instance.pipelines);
            env.update()?;
        }
        TaskKind::HistoryPurge => {
            let policy = history::PurgePolicy::parse(&config.tasks.purge_policy, &config.tasks.purge_value)?;
            let now = chrono::Utc::now().timestamp();
            let removed = policy.purge(&instance.workspace(config), now)?;
            log::info!("purged {removed} task workspaces");
        }
    }
    Ok(())
}

/// Per-instance worker loop: repeatedly pulls a task id from the queue
/// (timeout-bounded so it can observe shutdown), runs it to completion,
/// and consults the shutdown timer between iterations.
pub fn worker_loop(config: &Config, instance: &RunningInstance, timer: &Arc<ServerTimer>, stopping: &std::sync::atomic::AtomicBool, pending: &std::sync::Mutex<std::collections::HashMap<String, Task>>) {
    // Crash recovery: any id left in the persisted snapshot at startup has
    // no corresponding `Task` (tasks are not themselves persisted, only
    // their ids) so its orphaned workspace is simply removed.
    for id in instance.queue.snapshot_ids() {
        let dir = instance.workspace(config).join(&id);
        if dir.exists() {
            log::info!("removing orphaned workspace {dir:?} from a previous crash");
            let _ = std::fs::remove_dir_all(&dir);
        }
    }
    let _ = instance.queue.clear_snapshot();

    while !stopping.load(std::sync::atomic::Ordering::SeqCst) {
        match instance.queue.get(Duration::from_secs(60)) {
            Ok(Some(id)) => {
                let task = pending.lock().unwrap().remove(&id);
                if let Some(task) = task {
                    if let Err(err) = run_task(config, instance, task, timer) {
                        log::error!("task {id} terminated with an engine error: {err}");
                    }
                }
            }
            Ok(None) => {}
            Err(err) => log::warn!("task queue error: {err}"),
        }
    }
}
