use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use ab_domain::config::Config;
use ab_memory::MemoryService;
use ab_providers::LlmProvider;

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

/// Shared application state threaded through every handler and task.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub config_path: Arc<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub event_log: Arc<EventLog>,
    pub memory: Arc<MemoryService>,
    /// `None` when no API key is configured — the gateway still boots and
    /// serves everything that doesn't need a model.
    pub provider: Option<Arc<dyn LlmProvider>>,
    pub policy: Arc<PolicyStore>,
    pub broker: Arc<PermissionBroker>,
    pub runs: Arc<RunStore>,
    pub sessions: Arc<SessionManager>,
    pub channels: Arc<ChannelRegistry>,
    pub cancels: Arc<CancelMap>,
    pub schedules: Arc<ScheduleStore>,
    pub workers: Arc<WorkerManager>,
    pub tasks: Arc<TaskStore>,
    pub skills: Arc<SkillSet>,
}
