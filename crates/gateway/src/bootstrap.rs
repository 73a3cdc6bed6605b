//! AppState construction and background-task spawning.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;

use ab_domain::config::{Config, ConfigSeverity};
use ab_memory::MemoryService;
use ab_providers::{LlmProvider, OpenAiProvider};

use crate::channels::ChannelRegistry;
use crate::eventlog::EventLog;
use crate::runtime::cancel::CancelMap;
use crate::runtime::permissions::{PermissionBroker, PolicyStore};
use crate::runtime::runs::RunStore;
use crate::runtime::scheduler::ScheduleStore;
use crate::runtime::tasks::TaskStore;
use crate::runtime::workers::WorkerManager;
use crate::sessions::SessionManager;
use crate::skills::SkillSet;
use crate::state::AppState;

/// Validate config, initialize every subsystem, and return fully-wired
/// shared state.
pub fn build_app_state(config: Arc<Config>, config_path: PathBuf) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Event log ────────────────────────────────────────────────────
    let event_log = Arc::new(
        EventLog::open(&config.data.dir, config.logs.rotation("events"))
            .context("opening event log")?,
    );
    tracing::info!(last_seq = event_log.last_seq(), "event log ready");

    // ── Memory service ───────────────────────────────────────────────
    let memory = Arc::new(
        MemoryService::open(config.memory.clone(), config.llm.extraction_model())
            .context("opening memory service")?,
    );
    tracing::info!(dir = %config.memory.dir.display(), "memory service ready");

    // ── LLM provider ─────────────────────────────────────────────────
    let provider: Option<Arc<dyn LlmProvider>> = match OpenAiProvider::from_config(&config.llm) {
        Ok(p) => Some(Arc::new(p)),
        Err(e) => {
            tracing::warn!(error = %e, "no LLM provider — model-backed requests will fail");
            None
        }
    };

    // ── Policy + broker ──────────────────────────────────────────────
    let policy =
        Arc::new(PolicyStore::new(&config.permissions).context("compiling permission policy")?);
    let broker = Arc::new(PermissionBroker::new());
    tracing::info!("permission broker ready");

    // ── Schedules ────────────────────────────────────────────────────
    let schedules = Arc::new(
        ScheduleStore::load(&config.data.dir, &config.scheduler.timezone)
            .context("loading schedules")?,
    );

    // ── Task snapshot ────────────────────────────────────────────────
    let tasks = Arc::new(TaskStore::load(&config.data.dir).context("loading task snapshot")?);

    // ── Skills ───────────────────────────────────────────────────────
    let skills = Arc::new(SkillSet::load(&config.skills));

    let state = AppState {
        started_at: Utc::now(),
        event_log,
        memory,
        provider,
        policy,
        broker,
        runs: Arc::new(RunStore::new()),
        sessions: Arc::new(SessionManager::new(config.sessions.queue_soft_cap)),
        channels: Arc::new(ChannelRegistry::new()),
        cancels: Arc::new(CancelMap::new()),
        schedules,
        workers: Arc::new(WorkerManager::new(
            config.workers.max_depth,
            config.workers.max_retained,
        )),
        tasks,
        skills,
        config_path: Arc::new(config_path),
        config,
    };
    Ok(state)
}

/// Spawn the long-running background tasks: the supervisor loop and every
/// enabled adapter.
pub fn spawn_background_tasks(state: &AppState) {
    crate::supervisor::spawn(state.clone());
    crate::adapters::spawn_enabled(state);
    tracing::info!("background tasks spawned");
}
