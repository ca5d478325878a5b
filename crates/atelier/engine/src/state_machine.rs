//! Routing table: which transition follows which state
//!
//! Routing is data, not code. A rule names the resting state it leaves,
//! the resting state it reaches, the agent that does the work in between
//! (if any), and whether it is a human-approval gate.

use atelier_types::{AgentRole, WorkflowState};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRule {
    pub from: WorkflowState,
    pub to: WorkflowState,
    /// Agent invoked while the run sits in the role's working state
    pub agent_role: Option<AgentRole>,
    /// The rule may only fire with human approval when the run asks for it
    #[serde(default)]
    pub requires_human: bool,
}

impl TransitionRule {
    pub fn new(from: WorkflowState, to: WorkflowState) -> Self {
        Self {
            from,
            to,
            agent_role: None,
            requires_human: false,
        }
    }

    pub fn via(mut self, role: AgentRole) -> Self {
        self.agent_role = Some(role);
        self
    }

    pub fn gated(mut self) -> Self {
        self.requires_human = true;
        self
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoutingTable {
    rules: Vec<TransitionRule>,
}

impl RoutingTable {
    pub fn new(rules: Vec<TransitionRule>) -> Self {
        Self { rules }
    }

    /// Plan, critique, human gate, execute
    pub fn standard() -> Self {
        use WorkflowState::*;
        Self::new(vec![
            TransitionRule::new(Created, Planned).via(AgentRole::Planner),
            TransitionRule::new(Planned, Critiqued).via(AgentRole::Critic),
            TransitionRule::new(Critiqued, Approved).gated(),
            TransitionRule::new(Proposed, Approved).gated(),
            TransitionRule::new(Approved, Completed).via(AgentRole::Executor),
        ])
    }

    pub fn push(&mut self, rule: TransitionRule) {
        self.rules.push(rule);
    }

    /// First rule leaving `state`
    pub fn get_next_state(&self, state: WorkflowState) -> Option<&TransitionRule> {
        self.rules.iter().find(|r| r.from == state)
    }

    pub fn rules(&self) -> &[TransitionRule] {
        &self.rules
    }

    /// Rules leaving a terminal or working state can never fire
    pub fn unreachable_rules(&self) -> Vec<&TransitionRule> {
        self.rules
            .iter()
            .filter(|r| r.from.is_terminal() || r.from.is_transient())
            .collect()
    }
}
