use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StateError;
use crate::models::{AgentStatus, InvestigationKind, InvestigationStatus, RunStatus, TaskInfo};

pub fn validate_transition(subject: &str, from: RunStatus, to: RunStatus) -> Result<(), StateError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StateError::IllegalTransition {
            subject: subject.to_string(),
            from,
            to,
        })
    }
}

pub fn allowed_transitions(from: RunStatus) -> &'static [RunStatus] {
    use RunStatus::*;
    match from {
        Pending => &[Running, Error],
        Running => &[Complete, Error],
        Complete | Error => &[],
    }
}

fn progress_rank(status: RunStatus) -> u8 {
    match status {
        RunStatus::Pending => 0,
        RunStatus::Running => 1,
        RunStatus::Complete | RunStatus::Error => 2,
    }
}

/// True when an observed status change moves backwards: toward `pending`,
/// or away from a terminal state. Skipping states between two observations
/// is not a regression.
#[must_use]
pub fn is_regression(from: RunStatus, to: RunStatus) -> bool {
    progress_rank(to) < progress_rank(from) || (from.is_terminal() && from != to)
}

#[must_use]
pub fn aggregate(agents: &[AgentStatus]) -> RunStatus {
    if agents.iter().any(|agent| agent.status == RunStatus::Error) {
        RunStatus::Error
    } else if !agents.is_empty() && agents.iter().all(|agent| agent.status == RunStatus::Complete) {
        RunStatus::Complete
    } else if agents.iter().any(|agent| agent.status != RunStatus::Pending) {
        RunStatus::Running
    } else {
        RunStatus::Pending
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    Started {
        agent_id: String,
        at: DateTime<Utc>,
    },
    TaskCompleted {
        agent_id: String,
        task: TaskInfo,
    },
    Completed {
        agent_id: String,
        at: DateTime<Utc>,
    },
    Failed {
        agent_id: String,
        message: String,
        at: DateTime<Utc>,
    },
}

impl InvestigationStatus {
    pub fn new(
        investigation_id: impl Into<String>,
        agents: &[(&str, &str)],
        started_at: DateTime<Utc>,
    ) -> Result<Self, StateError> {
        if agents.is_empty() {
            return Err(StateError::NoAgents);
        }

        Ok(Self {
            investigation_id: investigation_id.into(),
            status: RunStatus::Pending,
            started_at,
            completed_at: None,
            agents: agents
                .iter()
                .map(|(agent_id, agent_name)| AgentStatus {
                    agent_id: (*agent_id).to_string(),
                    agent_name: (*agent_name).to_string(),
                    status: RunStatus::Pending,
                    started_at: None,
                    completed_at: None,
                    tasks: Vec::new(),
                    error: None,
                })
                .collect(),
            final_report: None,
            error: None,
        })
    }

    pub fn for_kind(
        investigation_id: impl Into<String>,
        kind: InvestigationKind,
        started_at: DateTime<Utc>,
    ) -> Result<Self, StateError> {
        Self::new(investigation_id, kind.roster(), started_at)
    }

    #[must_use]
    pub fn agent(&self, agent_id: &str) -> Option<&AgentStatus> {
        self.agents.iter().find(|agent| agent.agent_id == agent_id)
    }

    fn agent_mut(&mut self, agent_id: &str) -> Result<&mut AgentStatus, StateError> {
        self.agents
            .iter_mut()
            .find(|agent| agent.agent_id == agent_id)
            .ok_or_else(|| StateError::UnknownAgent(agent_id.to_string()))
    }

    pub fn apply(&mut self, event: AgentEvent) -> Result<RunStatus, StateError> {
        match event {
            AgentEvent::Started { agent_id, at } => self.start_agent(&agent_id, at),
            AgentEvent::TaskCompleted { agent_id, task } => self.record_task(&agent_id, task),
            AgentEvent::Completed { agent_id, at } => self.complete_agent(&agent_id, at),
            AgentEvent::Failed {
                agent_id,
                message,
                at,
            } => self.fail_agent(&agent_id, message, at),
        }
    }

    /// An agent already running, for example one started by
    /// [`Self::complete_agent`], is left untouched.
    pub fn start_agent(&mut self, agent_id: &str, at: DateTime<Utc>) -> Result<RunStatus, StateError> {
        self.ensure_open()?;
        let agent = self.agent_mut(agent_id)?;
        if agent.status == RunStatus::Running {
            return Ok(self.status);
        }
        validate_transition(agent_id, agent.status, RunStatus::Running)?;
        agent.status = RunStatus::Running;
        agent.started_at = Some(at);
        Ok(self.reaggregate(at))
    }

    /// Appends a finished task. Tasks are kept in completion order and never
    /// rewritten.
    pub fn record_task(&mut self, agent_id: &str, task: TaskInfo) -> Result<RunStatus, StateError> {
        self.ensure_open()?;
        let agent = self.agent_mut(agent_id)?;
        if agent.status != RunStatus::Running {
            return Err(StateError::AgentNotRunning(agent_id.to_string()));
        }
        agent.tasks.push(task);
        Ok(self.status)
    }

    /// Completes an agent and starts the next pending one, so agents run as a
    /// sequential pipeline.
    pub fn complete_agent(&mut self, agent_id: &str, at: DateTime<Utc>) -> Result<RunStatus, StateError> {
        self.ensure_open()?;
        let agent = self.agent_mut(agent_id)?;
        validate_transition(agent_id, agent.status, RunStatus::Complete)?;
        agent.status = RunStatus::Complete;
        agent.completed_at = Some(at);

        if let Some(next) = self
            .agents
            .iter_mut()
            .find(|agent| agent.status == RunStatus::Pending)
        {
            next.status = RunStatus::Running;
            next.started_at = Some(at);
        }
        Ok(self.reaggregate(at))
    }

    /// Fails an agent and, with it, the investigation. Sibling agents are
    /// left as they are; their work is abandoned rather than cancelled.
    pub fn fail_agent(
        &mut self,
        agent_id: &str,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<RunStatus, StateError> {
        self.ensure_open()?;
        let message = message.into();
        let agent = self.agent_mut(agent_id)?;
        validate_transition(agent_id, agent.status, RunStatus::Error)?;
        agent.status = RunStatus::Error;
        agent.completed_at = Some(at);
        agent.error = Some(message.clone());
        self.error = Some(format!("{agent_id}: {message}"));
        Ok(self.reaggregate(at))
    }

    pub fn attach_report(&mut self, report: impl Into<String>) -> Result<(), StateError> {
        if self.status != RunStatus::Complete {
            return Err(StateError::ReportBeforeCompletion(self.status));
        }
        self.final_report = Some(report.into());
        Ok(())
    }

    #[must_use]
    pub fn progress(&self) -> f64 {
        if self.agents.is_empty() {
            return 0.0;
        }
        let complete = self
            .agents
            .iter()
            .filter(|agent| agent.status == RunStatus::Complete)
            .count();
        complete as f64 / self.agents.len() as f64
    }

    #[must_use]
    pub fn running_agent(&self) -> Option<&AgentStatus> {
        self.agents
            .iter()
            .find(|agent| agent.status == RunStatus::Running)
    }

    pub fn validate(&self) -> Result<(), StateError> {
        let terminal = self.status.is_terminal();
        if terminal != self.completed_at.is_some() {
            return Err(StateError::Inconsistent(format!(
                "status {} with completed_at {}",
                self.status,
                if self.completed_at.is_some() { "set" } else { "unset" }
            )));
        }
        if self.final_report.is_some() && self.status != RunStatus::Complete {
            return Err(StateError::Inconsistent(format!(
                "final report present while status is {}",
                self.status
            )));
        }
        if self.status == RunStatus::Complete
            && self.agents.iter().any(|agent| agent.status != RunStatus::Complete)
        {
            return Err(StateError::Inconsistent(
                "complete investigation with unfinished agents".to_string(),
            ));
        }
        if self.status != RunStatus::Error
            && self.agents.iter().any(|agent| agent.status == RunStatus::Error)
        {
            return Err(StateError::Inconsistent(format!(
                "agent error while investigation is {}",
                self.status
            )));
        }
        Ok(())
    }

    /// Compares a newer snapshot of the same investigation against this one
    /// and reports every agent (or the investigation itself) that moved
    /// backwards.
    #[must_use]
    pub fn regressions(&self, newer: &InvestigationStatus) -> Vec<String> {
        let mut found = Vec::new();
        if is_regression(self.status, newer.status) {
            found.push(format!(
                "investigation {} -> {}",
                self.status, newer.status
            ));
        }
        for previous in &self.agents {
            if let Some(current) = newer.agent(&previous.agent_id) {
                if is_regression(previous.status, current.status) {
                    found.push(format!(
                        "agent {} {} -> {}",
                        previous.agent_id, previous.status, current.status
                    ));
                }
                if current.tasks.len() < previous.tasks.len() {
                    found.push(format!("agent {} lost completed tasks", previous.agent_id));
                }
            }
        }
        found
    }

    fn ensure_open(&self) -> Result<(), StateError> {
        if self.status.is_terminal() {
            return Err(StateError::IllegalTransition {
                subject: self.investigation_id.clone(),
                from: self.status,
                to: self.status,
            });
        }
        Ok(())
    }

    fn reaggregate(&mut self, at: DateTime<Utc>) -> RunStatus {
        self.status = aggregate(&self.agents);
        if self.status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(at);
        }
        self.status
    }
}
