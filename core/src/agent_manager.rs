//! Agent Manager (§4.5): agent lifecycle, task queue, distribution
//! strategy, performance counters.
//!
//! `DistributionStrategy` is a trait object, grounded on the teacher's
//! `Capability`/`LLMCapability` trait-object pattern in
//! `core/src/agent/runtime/capability.rs`. The task queue is a
//! `tokio::sync::Mutex<VecDeque<Task>>` with a capacity check, grounded on
//! `core/src/agent/runtime/workers.rs`'s `WorkerRuntime`
//! (`RwLock<HashMap<..>>` job table shape).

use crate::error::{HubError, Result};
use crate::event_bus::{AgentEvent, EventBus, HubEvent};
use crate::ids::{AgentId, IdGenerator, TaskId};
use crate::types::{Agent, AgentCounters, Task, TaskStatus};
use chrono::Utc;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// EMA smoothing factor for successRate/errorRate, configurable per §6
/// (default 0.2, per §4.5).
#[derive(Debug, Clone, Copy)]
pub struct AgentManagerConfig {
    pub task_queue_capacity: usize,
    pub ema_smoothing: f64,
    pub intervention_error_rate_threshold: f64,
}

impl Default for AgentManagerConfig {
    fn default() -> Self {
        Self {
            task_queue_capacity: 100,
            ema_smoothing: 0.2,
            intervention_error_rate_threshold: 0.5,
        }
    }
}

/// A capability pair {selectAgent, shouldIntervene} (§4.5, §9 Strategy
/// polymorphism note). Implementations may be added without touching
/// callers, mirroring the teacher's `Capability` trait-object idiom.
pub trait DistributionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Picks the best candidate from `agents` (already filtered to active
    /// agents by the caller). Returns `None` if no candidate qualifies.
    fn select_agent<'a>(&self, agents: &[&'a Agent]) -> Option<&'a Agent>;

    /// Whether the fallback strategy should be used for this assignment,
    /// e.g. "any candidate's errorRate > threshold" (§4.5).
    fn should_intervene(&self, agents: &[&Agent]) -> bool;
}

pub struct LeastLoaded {
    pub intervention_error_rate_threshold: f64,
}

impl DistributionStrategy for LeastLoaded {
    fn name(&self) -> &'static str {
        "least_loaded"
    }

    fn select_agent<'a>(&self, agents: &[&'a Agent]) -> Option<&'a Agent> {
        agents
            .iter()
            .copied()
            .min_by(|a, b| {
                let load_a = a.counters.tasks_assigned as i64 - a.counters.tasks_completed as i64;
                let load_b = b.counters.tasks_assigned as i64 - b.counters.tasks_completed as i64;
                load_a
                    .cmp(&load_b)
                    .then(b.counters.quality_score.partial_cmp(&a.counters.quality_score).unwrap_or(std::cmp::Ordering::Equal))
                    .then(a.id.as_str().cmp(b.id.as_str()))
            })
    }

    fn should_intervene(&self, agents: &[&Agent]) -> bool {
        agents.iter().any(|a| a.counters.error_rate > self.intervention_error_rate_threshold)
    }
}

pub struct PerformanceWeighted;

impl DistributionStrategy for PerformanceWeighted {
    fn name(&self) -> &'static str {
        "performance_weighted"
    }

    fn select_agent<'a>(&self, agents: &[&'a Agent]) -> Option<&'a Agent> {
        agents.iter().copied().max_by(|a, b| {
            let score_a = a.counters.success_rate - a.counters.error_rate;
            let score_b = b.counters.success_rate - b.counters.error_rate;
            score_a
                .partial_cmp(&score_b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.as_str().cmp(b.id.as_str()))
        })
    }

    fn should_intervene(&self, _agents: &[&Agent]) -> bool {
        false
    }
}

pub struct AgentManager {
    agents: RwLock<HashMap<AgentId, Agent>>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    queue: tokio::sync::Mutex<VecDeque<TaskId>>,
    config: AgentManagerConfig,
    primary_strategy: Box<dyn DistributionStrategy>,
    fallback_strategy: Box<dyn DistributionStrategy>,
    ids: IdGenerator<crate::ids::SystemClock>,
    event_bus: Arc<EventBus>,
}

impl AgentManager {
    pub fn new(config: AgentManagerConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            queue: tokio::sync::Mutex::new(VecDeque::new()),
            primary_strategy: Box::new(LeastLoaded {
                intervention_error_rate_threshold: config.intervention_error_rate_threshold,
            }),
            fallback_strategy: Box::new(PerformanceWeighted),
            config,
            ids: IdGenerator::system(),
            event_bus,
        }
    }

    pub async fn add(&self, agent: Agent) {
        self.agents.write().await.insert(agent.id.clone(), agent);
    }

    pub async fn remove(&self, agent_id: &AgentId) -> Result<()> {
        let mut agents = self.agents.write().await;
        agents
            .get_mut(agent_id)
            .ok_or_else(|| HubError::NotFound { what: format!("agent {}", agent_id) })?
            .is_active = false;
        Ok(())
    }

    pub async fn update(&self, agent_id: &AgentId, f: impl FnOnce(&mut Agent)) -> Result<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(agent_id)
            .ok_or_else(|| HubError::NotFound { what: format!("agent {}", agent_id) })?;
        f(agent);
        agent.updated_at = Utc::now();
        Ok(())
    }

    pub async fn get(&self, agent_id: &AgentId) -> Result<Agent> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| HubError::NotFound { what: format!("agent {}", agent_id) })
    }

    pub async fn list_active(&self) -> Vec<Agent> {
        self.agents.read().await.values().filter(|a| a.is_active).cloned().collect()
    }

    /// Picks an agent for a new task using the configured strategy pair,
    /// applying the fallback when `should_intervene` fires (§4.5).
    pub async fn select_agent(&self) -> Result<AgentId> {
        let agents = self.agents.read().await;
        let active: Vec<&Agent> = agents.values().filter(|a| a.is_active).collect();
        if active.is_empty() {
            return Err(HubError::NotFound { what: "no active agents".into() });
        }
        let chosen = if self.primary_strategy.should_intervene(&active) {
            self.fallback_strategy.select_agent(&active)
        } else {
            self.primary_strategy.select_agent(&active)
        };
        chosen
            .map(|a| a.id.clone())
            .ok_or_else(|| HubError::NotFound { what: "no candidate agent".into() })
    }

    /// Enqueues a task for `agent_id`. Fails with `QueueFull` over capacity,
    /// with `NotFound` if the agent was removed (§4.5).
    pub async fn assign_task(&self, agent_id: &AgentId, task_type: impl Into<String>, description: impl Into<String>, priority: i32) -> Result<TaskId> {
        {
            let agents = self.agents.read().await;
            let agent = agents
                .get(agent_id)
                .ok_or_else(|| HubError::NotFound { what: format!("agent {}", agent_id) })?;
            if !agent.is_active {
                return Err(HubError::NotFound { what: format!("agent {}", agent_id) });
            }
        }

        let mut queue = self.queue.lock().await;
        if queue.len() >= self.config.task_queue_capacity {
            return Err(HubError::QueueFull { capacity: self.config.task_queue_capacity });
        }

        let task_id = TaskId::new(self.ids.mint());
        let task = Task {
            id: task_id.clone(),
            assignee_id: agent_id.clone(),
            task_type: task_type.into(),
            description: description.into(),
            priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            metadata: Default::default(),
        };
        self.tasks.write().await.insert(task_id.clone(), task);
        queue.push_back(task_id.clone());

        self.update(agent_id, |a| a.counters.tasks_assigned += 1).await?;

        self.event_bus
            .publish(HubEvent::Agent(AgentEvent {
                type_tag: "task_assigned".into(),
                timestamp: Utc::now(),
                producer_id: "agent_manager".into(),
                agent_id: agent_id.clone(),
                payload: json!({ "task_id": task_id.to_string() }),
            }))
            .await;

        Ok(task_id)
    }

    pub async fn start_task(&self, task_id: &TaskId) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| HubError::NotFound { what: format!("task {}", task_id) })?;
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        Ok(())
    }

    /// Marks a task terminal and updates EMA performance counters for its
    /// assignee (§4.5). `quality` is an optional caller-supplied score.
    pub async fn complete_task(
        &self,
        task_id: &TaskId,
        outcome: TaskStatus,
        latency_ms: f64,
        result_or_error: std::result::Result<String, String>,
        quality: Option<f64>,
    ) -> Result<()> {
        if !outcome.is_terminal() {
            return Err(HubError::InvalidArgument { message: "complete_task requires a terminal status".into() });
        }

        let assignee = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| HubError::NotFound { what: format!("task {}", task_id) })?;
            task.status = outcome;
            task.completed_at = Some(Utc::now());
            match result_or_error {
                Ok(r) => task.result = Some(r),
                Err(e) => task.error = Some(e),
            }
            task.assignee_id.clone()
        };

        let success = matches!(outcome, TaskStatus::Completed);
        let alpha = self.config.ema_smoothing;
        self.update(&assignee, |agent| {
            agent.counters.tasks_completed += 1;
            let sample_success = if success { 1.0 } else { 0.0 };
            let sample_error = if success { 0.0 } else { 1.0 };
            agent.counters.success_rate = agent.counters.success_rate * (1.0 - alpha) + sample_success * alpha;
            agent.counters.error_rate = agent.counters.error_rate * (1.0 - alpha) + sample_error * alpha;
            agent.counters.avg_latency_ms = agent.counters.avg_latency_ms * (1.0 - alpha) + latency_ms * alpha;
            if let Some(q) = quality {
                agent.counters.quality_score = q.clamp(0.0, 1.0);
            }
            agent.counters.last_seen = Some(Utc::now());
        })
        .await?;

        let tag = if success { "task_completed" } else { "task_failed" };
        self.event_bus
            .publish(HubEvent::Agent(AgentEvent {
                type_tag: tag.into(),
                timestamp: Utc::now(),
                producer_id: "agent_manager".into(),
                agent_id: assignee,
                payload: json!({ "task_id": task_id.to_string(), "latency_ms": latency_ms }),
            }))
            .await;

        Ok(())
    }

    pub async fn query_performance(&self, agent_id: &AgentId) -> Result<AgentCounters> {
        self.get(agent_id).await.map(|a| a.counters)
    }
}
