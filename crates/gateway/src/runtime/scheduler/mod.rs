//! Scheduler — persisted timers that admit synthetic runs.
//!
//! `next_run_at` always advances deterministically from the previous
//! boundary (never from `now`), under the skip policy: after a long pause
//! the schedule jumps to the first future boundary and fires once, not in
//! a burst. A schedule-level lock skips a tick while the previous run of
//! the same schedule is still non-terminal.

pub mod cron;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use ab_domain::error::{Error, Result};
use ab_domain::event::{new_schedule_id, RunKind};

use self::cron::{cron_is_valid, cron_next_tz, parse_tz};
use crate::runtime::runs::Run;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// When the schedule fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Every `seconds`, anchored to the previous boundary.
    Interval { seconds: u64 },
    /// Every day at `HH:MM` in the schedule's timezone.
    Daily { time: String },
    /// 5-field cron expression, evaluated in the schedule's timezone.
    Cron { expr: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub schedule_id: String,
    pub spec: ScheduleSpec,
    /// Literal text fed as the run input on every fire.
    pub prompt: String,
    pub enabled: bool,
    pub timezone: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run_id: Option<String>,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    /// Ticks skipped because the previous run was still live.
    #[serde(default)]
    pub missed_count: u64,
}

impl Schedule {
    /// The first boundary strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let tz = parse_tz(&self.timezone);
        match &self.spec {
            ScheduleSpec::Interval { seconds } => {
                Some(after + chrono::Duration::seconds(*seconds as i64))
            }
            ScheduleSpec::Daily { time } => {
                let t = NaiveTime::parse_from_str(time, "%H:%M").ok()?;
                let local = after.with_timezone(&tz);
                let mut candidate_date = local.date_naive();
                for _ in 0..3 {
                    let naive = candidate_date.and_time(t);
                    let mapped = match tz.from_local_datetime(&naive) {
                        chrono::LocalResult::Single(dt) => Some(dt),
                        chrono::LocalResult::Ambiguous(earliest, _) => Some(earliest),
                        chrono::LocalResult::None => None, // DST gap, try next day
                    };
                    if let Some(dt) = mapped {
                        let utc = dt.with_timezone(&Utc);
                        if utc > after {
                            return Some(utc);
                        }
                    }
                    candidate_date = candidate_date.succ_opt()?;
                }
                None
            }
            ScheduleSpec::Cron { expr } => cron_next_tz(expr, &after, tz),
        }
    }

    /// Skip policy: advance from the current `next_run_at` in whole
    /// boundaries until it lands in the future. Deterministic — catch-up
    /// after a pause fires once, never a burst.
    pub fn advance_past(&mut self, now: DateTime<Utc>) {
        // Interval boundaries can be jumped arithmetically.
        if let ScheduleSpec::Interval { seconds } = &self.spec {
            if self.next_run_at <= now {
                let period = (*seconds).max(1) as i64;
                let behind = (now - self.next_run_at).num_seconds();
                let steps = behind / period + 1;
                self.next_run_at += chrono::Duration::seconds(steps * period);
            }
            return;
        }
        let mut guard = 0;
        while self.next_run_at <= now {
            match self.next_after(self.next_run_at) {
                Some(next) => self.next_run_at = next,
                None => break,
            }
            guard += 1;
            if guard > 100_000 {
                break;
            }
        }
    }

    /// Restart catch-up: collapse a backlog of missed boundaries into a
    /// single due fire at the most recent one. The first tick after restart
    /// fires exactly once; `record_fire` then advances past `now`.
    pub fn catch_up(&mut self, now: DateTime<Utc>) {
        if self.next_run_at > now {
            return;
        }
        if let ScheduleSpec::Interval { seconds } = &self.spec {
            let period = (*seconds).max(1) as i64;
            let behind = (now - self.next_run_at).num_seconds();
            let steps = behind / period;
            self.next_run_at += chrono::Duration::seconds(steps * period);
            return;
        }
        loop {
            match self.next_after(self.next_run_at) {
                Some(n) if n <= now => self.next_run_at = n,
                _ => break,
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        match &self.spec {
            ScheduleSpec::Interval { seconds } if *seconds == 0 => {
                Err(Error::Protocol("interval seconds must be positive".into()))
            }
            ScheduleSpec::Daily { time } => {
                NaiveTime::parse_from_str(time, "%H:%M")
                    .map(|_| ())
                    .map_err(|_| Error::Protocol(format!("bad daily time {time:?}, want HH:MM")))
            }
            ScheduleSpec::Cron { expr } if !cron_is_valid(expr) => {
                Err(Error::Protocol(format!("bad cron expression {expr:?}")))
            }
            _ => Ok(()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ScheduleStore {
    inner: RwLock<HashMap<String, Schedule>>,
    persist_path: PathBuf,
}

impl ScheduleStore {
    pub fn load(data_dir: &Path, default_tz: &str) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let persist_path = data_dir.join("schedules.json");
        let mut map = HashMap::new();
        if persist_path.exists() {
            let raw = std::fs::read_to_string(&persist_path)?;
            if let Ok(schedules) = serde_json::from_str::<Vec<Schedule>>(&raw) {
                for s in schedules {
                    map.insert(s.schedule_id.clone(), s);
                }
            }
        }

        // Restart catch-up: a backlog of missed boundaries collapses into
        // one due fire before the first tick runs.
        let now = Utc::now();
        for s in map.values_mut() {
            if s.timezone.is_empty() {
                s.timezone = default_tz.to_string();
            }
            s.catch_up(now);
        }

        let store = Self {
            inner: RwLock::new(map),
            persist_path,
        };
        Ok(store)
    }

    async fn persist(&self) {
        let snapshot: Vec<Schedule> = self.inner.read().await.values().cloned().collect();
        let path = self.persist_path.clone();
        let _ = tokio::task::spawn_blocking(move || {
            match serde_json::to_string_pretty(&snapshot) {
                Ok(json) => {
                    let tmp = path.with_extension("json.tmp");
                    if std::fs::write(&tmp, json).and_then(|_| std::fs::rename(&tmp, &path)).is_err()
                    {
                        tracing::warn!("failed to persist schedules");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to serialize schedules"),
            }
        })
        .await;
    }

    pub async fn create(
        &self,
        spec: ScheduleSpec,
        prompt: String,
        timezone: String,
        enabled: bool,
    ) -> Result<Schedule> {
        let now = Utc::now();
        let mut schedule = Schedule {
            schedule_id: new_schedule_id(),
            spec,
            prompt,
            enabled,
            timezone,
            created_at: now,
            last_run_id: None,
            last_run_at: None,
            next_run_at: now,
            missed_count: 0,
        };
        schedule.validate()?;
        schedule.next_run_at = schedule
            .next_after(now)
            .ok_or_else(|| Error::Protocol("schedule never fires".into()))?;

        self.inner
            .write()
            .await
            .insert(schedule.schedule_id.clone(), schedule.clone());
        self.persist().await;
        Ok(schedule)
    }

    pub async fn update<F>(&self, schedule_id: &str, f: F) -> Option<Schedule>
    where
        F: FnOnce(&mut Schedule),
    {
        let updated = {
            let mut map = self.inner.write().await;
            let s = map.get_mut(schedule_id)?;
            f(s);
            Some(s.clone())
        };
        if updated.is_some() {
            self.persist().await;
        }
        updated
    }

    pub async fn delete(&self, schedule_id: &str) -> bool {
        let removed = self.inner.write().await.remove(schedule_id).is_some();
        if removed {
            self.persist().await;
        }
        removed
    }

    pub async fn get(&self, schedule_id: &str) -> Option<Schedule> {
        self.inner.read().await.get(schedule_id).cloned()
    }

    pub async fn list(&self) -> Vec<Schedule> {
        let mut out: Vec<Schedule> = self.inner.read().await.values().cloned().collect();
        out.sort_by_key(|s| s.next_run_at);
        out
    }

    pub async fn due(&self, now: DateTime<Utc>) -> Vec<Schedule> {
        self.inner
            .read()
            .await
            .values()
            .filter(|s| s.enabled && s.next_run_at <= now)
            .cloned()
            .collect()
    }

    /// Record a fire: remember the run, then advance `next_run_at` from its
    /// previous value under the skip policy. Strictly increases.
    pub async fn record_fire(&self, schedule_id: &str, run_id: &str, now: DateTime<Utc>) {
        self.update(schedule_id, |s| {
            s.last_run_id = Some(run_id.to_string());
            s.last_run_at = Some(now);
            s.advance_past(now);
        })
        .await;
    }

    /// Record a skipped tick (previous run still live).
    pub async fn record_missed(&self, schedule_id: &str, now: DateTime<Utc>) {
        self.update(schedule_id, |s| {
            s.missed_count += 1;
            s.advance_past(now);
        })
        .await;
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tick
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Evaluate due schedules and admit a run for each. Called by the
/// supervisor on every tick.
pub async fn tick(state: &AppState) {
    let now = Utc::now();
    for schedule in state.schedules.due(now).await {
        // Schedule-level lock: one live run per schedule.
        let previous_live = schedule
            .last_run_id
            .as_deref()
            .and_then(|id| state.runs.get(id))
            .map(|r| !r.state.is_terminal())
            .unwrap_or(false);
        if previous_live {
            tracing::debug!(schedule_id = %schedule.schedule_id, "previous run still live, skipping tick");
            state.schedules.record_missed(&schedule.schedule_id, now).await;
            continue;
        }

        let run = Run::new(
            format!("scheduler:{}", schedule.schedule_id),
            None,
            format!("schedule:{}", schedule.schedule_id),
            RunKind::Scheduled,
            schedule.prompt.clone(),
        );
        match state.sessions.admit(state, run) {
            Ok((run_id, _)) => {
                tracing::info!(schedule_id = %schedule.schedule_id, run_id = %run_id, "schedule fired");
                state
                    .schedules
                    .record_fire(&schedule.schedule_id, &run_id, now)
                    .await;
            }
            Err(e) => {
                tracing::warn!(schedule_id = %schedule.schedule_id, error = %e, "schedule admission failed");
                state.schedules.record_missed(&schedule.schedule_id, now).await;
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
