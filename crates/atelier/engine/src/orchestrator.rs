//! Orchestrator: drives a run one transition at a time
//!
//! `advance()` is the only way a run moves. Each call:
//! 1. takes the run's lock flag (a concurrent call sees `Busy` and changes
//!    nothing),
//! 2. looks up the routing rule for the current state,
//! 3. stops at PROPOSED if the rule is a human gate and the run asks for
//!    approval that was not given,
//! 4. otherwise invokes the rule's agent on a working copy of the context,
//! 5. merges the agent's output back and settles into the next resting
//!    state, FAILED, or the stop/cancel state requested meanwhile.
//!
//! The lock flag is cleared on every path, including agent panics and a
//! dropped `advance()` future.

use crate::agents::{
    panic_message, Agent, AgentRegistry, CriticAgent, ExecutionGuard, ExecutorAgent,
    FailSoftCritic, GuardedAgent, PlannerAgent, PLANNER_BREAKER,
};
use crate::backends::{PlannerBackend, SimulatedToolBackend, TemplatePlanner, ToolExecutionBackend};
use crate::config::EngineConfig;
use crate::events::EventBroadcaster;
use crate::handle::RunHandle;
use crate::parallel::ParallelExecutor;
use crate::state_machine::{RoutingTable, TransitionRule};
use atelier_guard::{determinism, GuardrailEngine, OperationCatalog};
use atelier_resilience::CircuitBreakerRegistry;
use atelier_types::{
    AgentRole, EventType, Plan, RunId, WorkflowContext, WorkflowError, WorkflowResult,
    WorkflowState,
};
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What a call to `advance()` did
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// Moved from one resting state to the next
    Transitioned {
        from: WorkflowState,
        to: WorkflowState,
    },
    /// Parked at PROPOSED until a human approves
    AwaitingApproval,
    /// Another transition is in flight; nothing changed
    Busy,
    /// The run had already finished; nothing changed
    Terminal { state: WorkflowState },
    /// The run moved to FAILED
    Failed { error: String },
    /// A stop or cancel request was honoured
    Halted { state: WorkflowState },
}

impl AdvanceOutcome {
    /// Whether another `advance()` could make progress without outside input
    pub fn can_continue(&self) -> bool {
        matches!(self, AdvanceOutcome::Transitioned { to, .. } if !to.is_terminal())
    }
}

type PendingEvents = Vec<(EventType, Value)>;

enum Begin {
    Settled(AdvanceOutcome),
    Proceed {
        rule: TransitionRule,
        from: WorkflowState,
        working: WorkflowContext,
    },
}

/// Clears the lock flag if a transition is abandoned before it settles
struct TransitionGuard<'a> {
    handle: &'a RunHandle,
    from: WorkflowState,
    armed: bool,
}

impl<'a> TransitionGuard<'a> {
    fn new(handle: &'a RunHandle, from: WorkflowState) -> Self {
        Self {
            handle,
            from,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut ctx = self.handle.lock();
        if ctx.locked {
            warn!(run_id = %ctx.run_id, from = %self.from, "Transition abandoned, failing run");
            ctx.locked = false;
            if !ctx.is_terminal() {
                ctx.fail(format!(
                    "transition from {} was interrupted before completion",
                    self.from
                ));
            }
        }
    }
}

pub struct Orchestrator {
    routing: RoutingTable,
    agents: AgentRegistry,
    guardrails: Arc<GuardrailEngine>,
    events: Arc<EventBroadcaster>,
    breakers: Arc<CircuitBreakerRegistry>,
    model_version: String,
}

impl Orchestrator {
    pub fn new(
        routing: RoutingTable,
        agents: AgentRegistry,
        guardrails: Arc<GuardrailEngine>,
        events: Arc<EventBroadcaster>,
        breakers: Arc<CircuitBreakerRegistry>,
        model_version: impl Into<String>,
    ) -> Self {
        Self {
            routing,
            agents,
            guardrails,
            events,
            breakers,
            model_version: model_version.into(),
        }
    }

    pub fn builder(config: EngineConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn guardrails(&self) -> &Arc<GuardrailEngine> {
        &self.guardrails
    }

    pub fn events(&self) -> &Arc<EventBroadcaster> {
        &self.events
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    fn publish(&self, run_id: &RunId, events: PendingEvents) {
        for (event_type, payload) in events {
            self.events.emit(event_type, run_id, payload);
        }
    }

    // ── Advance ──────────────────────────────────────────────────────

    /// Perform at most one transition. Never returns an error: failures
    /// are recorded on the run and reported as [`AdvanceOutcome::Failed`].
    pub async fn advance(&self, handle: &RunHandle, human_approved: bool) -> AdvanceOutcome {
        let run_id = handle.run_id().clone();

        let mut events = PendingEvents::new();
        let begun = {
            let mut ctx = handle.lock();
            self.begin(&mut ctx, human_approved, &mut events)
        };
        self.publish(&run_id, events);

        let (rule, from, mut working) = match begun {
            Begin::Settled(outcome) => return outcome,
            Begin::Proceed {
                rule,
                from,
                working,
            } => (rule, from, working),
        };
        let mut guard = TransitionGuard::new(handle, from);

        let result = match rule.agent_role {
            Some(role) => self.invoke(role, &mut working, handle).await,
            None => Ok(()),
        };

        let mut events = PendingEvents::new();
        let outcome = {
            let mut ctx = handle.lock();
            ctx.plan = working.plan;
            ctx.critique = working.critique;
            ctx.result = working.result;
            ctx.metadata = working.metadata;
            ctx.plan_overridden = working.plan_overridden;

            let requested = handle.cancel_signal().requested();
            let outcome = self.settle(&mut ctx, &rule, from, result, requested, &mut events);
            ctx.locked = false;
            guard.disarm();
            outcome
        };
        self.publish(&run_id, events);
        outcome
    }

    /// Checks and lock acquisition, all under the context mutex
    fn begin(
        &self,
        ctx: &mut WorkflowContext,
        human_approved: bool,
        events: &mut PendingEvents,
    ) -> Begin {
        if ctx.locked {
            debug!(run_id = %ctx.run_id, state = %ctx.state, "Transition in flight, advance ignored");
            return Begin::Settled(AdvanceOutcome::Busy);
        }
        if ctx.is_terminal() {
            warn!(run_id = %ctx.run_id, state = %ctx.state, "Advance on finished run ignored");
            return Begin::Settled(AdvanceOutcome::Terminal { state: ctx.state });
        }

        let from = ctx.state;
        let Some(rule) = self.routing.get_next_state(from).cloned() else {
            let error = WorkflowError::NoRoute(from).to_string();
            error!(run_id = %ctx.run_id, state = %from, "{}", error);
            ctx.fail(error.clone());
            events.push((EventType::Error, json!({"error": error, "state": from})));
            events.push(state_changed(from, WorkflowState::Failed));
            return Begin::Settled(AdvanceOutcome::Failed { error });
        };

        if rule.requires_human && ctx.requires_human_approval() && !human_approved {
            if from != WorkflowState::Proposed {
                ctx.set_state(WorkflowState::Proposed);
                info!(run_id = %ctx.run_id, "Run awaiting human approval");
                events.push(state_changed(from, WorkflowState::Proposed));
                events.push((EventType::Blocked, blocked_payload(ctx)));
            }
            return Begin::Settled(AdvanceOutcome::AwaitingApproval);
        }

        ctx.locked = true;
        if rule.requires_human {
            events.push((
                EventType::Approved,
                json!({
                    "human_approved": human_approved,
                    "plan_overridden": ctx.plan_overridden,
                }),
            ));
        }
        if let Some(role) = rule.agent_role {
            let working_state = role.working_state();
            ctx.set_state(working_state);
            events.push(state_changed(from, working_state));
            events.push(start_event(role, ctx));
        }
        debug!(run_id = %ctx.run_id, from = %from, to = %rule.to, "Transition started");

        Begin::Proceed {
            rule,
            from,
            working: ctx.clone(),
        }
    }

    async fn invoke(
        &self,
        role: AgentRole,
        working: &mut WorkflowContext,
        handle: &RunHandle,
    ) -> WorkflowResult<()> {
        let agent: Arc<dyn Agent> = self
            .agents
            .get(role)
            .ok_or(WorkflowError::AgentUnavailable(role))?;
        let cancel = handle.cancel_signal();

        match AssertUnwindSafe(agent.run(working, cancel))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(WorkflowError::Internal(format!(
                "{} agent panicked: {}",
                role,
                panic_message(panic.as_ref())
            ))),
        }
    }

    /// Resting state after the agent returned
    fn settle(
        &self,
        ctx: &mut WorkflowContext,
        rule: &TransitionRule,
        from: WorkflowState,
        result: WorkflowResult<()>,
        requested: Option<WorkflowState>,
        events: &mut PendingEvents,
    ) -> AdvanceOutcome {
        let current = ctx.state;

        if let Some(role) = rule.agent_role {
            if result.is_ok() || role == AgentRole::Executor {
                if let Some(event) = finish_event(role, ctx) {
                    events.push(event);
                }
            }
        }

        match (result, requested) {
            (Err(e), _) => {
                let error = e.to_string();
                error!(run_id = %ctx.run_id, from = %from, "Transition failed: {}", error);
                ctx.fail(error.clone());
                events.push((EventType::Error, json!({"error": error, "state": current})));
                events.push(state_changed(current, WorkflowState::Failed));
                AdvanceOutcome::Failed { error }
            }
            (Ok(()), Some(halt)) => {
                info!(run_id = %ctx.run_id, state = %halt, "Run halted on request");
                ctx.set_state(halt);
                events.push(state_changed(current, halt));
                events.push((EventType::Stopped, json!({"state": halt, "during": from})));
                AdvanceOutcome::Halted { state: halt }
            }
            (Ok(()), None) => {
                ctx.set_state(rule.to);
                info!(run_id = %ctx.run_id, from = %from, to = %rule.to, "Transition complete");
                events.push(state_changed(current, rule.to));
                if rule.to == WorkflowState::Completed {
                    let success = ctx.result.as_ref().map(|r| r.success).unwrap_or(true);
                    events.push((
                        EventType::WorkflowComplete,
                        json!({"state": rule.to, "success": success}),
                    ));
                }
                AdvanceOutcome::Transitioned { from, to: rule.to }
            }
        }
    }

    /// Advance until the run finishes, parks for approval, or fails
    pub async fn run_until_settled(&self, handle: &RunHandle, human_approved: bool) -> AdvanceOutcome {
        // Every rule fires at most once per run in a well-formed table
        let bound = self.routing.rules().len() + 1;
        let mut outcome = self.advance(handle, human_approved).await;
        for _ in 0..bound {
            if !outcome.can_continue() {
                break;
            }
            outcome = self.advance(handle, human_approved).await;
        }
        outcome
    }

    // ── Human decisions ──────────────────────────────────────────────

    /// Approve a run waiting at the human gate, optionally replacing its
    /// plan first. The replacement is validated under the relaxed ceiling
    /// and applied at most once; a rejected replacement changes nothing.
    pub async fn approve(
        &self,
        handle: &RunHandle,
        override_plan: Option<Plan>,
    ) -> WorkflowResult<AdvanceOutcome> {
        if let Some(plan) = override_plan {
            self.apply_override(handle, plan)?;
        }
        Ok(self.advance(handle, true).await)
    }

    fn apply_override(&self, handle: &RunHandle, mut plan: Plan) -> WorkflowResult<()> {
        let mut ctx = handle.lock();
        if ctx.is_terminal() {
            return Err(WorkflowError::Terminal(ctx.state));
        }
        if ctx.locked || !matches!(ctx.state, WorkflowState::Critiqued | WorkflowState::Proposed) {
            return Err(WorkflowError::InvalidState {
                state: ctx.state,
                action: "override the plan of",
            });
        }
        if ctx.plan_overridden {
            return Err(WorkflowError::OverrideAlreadyApplied);
        }
        if let Err(e) = self.guardrails.validate_override(&plan) {
            warn!(run_id = %ctx.run_id, code = %e.code, "Plan override rejected: {}", e.message);
            return Err(WorkflowError::OverrideRejected(e));
        }

        if plan.estimated_cost_usd <= 0.0 {
            plan.estimated_cost_usd = self.guardrails.recompute_cost(&plan);
        }
        let seed = ctx
            .plan
            .as_ref()
            .filter(|p| p.determinism.locked)
            .map(|p| p.determinism.seed)
            .unwrap_or_else(|| determinism::derive_seed(ctx.run_id.as_str()));
        determinism::lock_plan(&mut plan, seed, self.model_version.as_str());
        plan.metadata.insert("override".into(), Value::Bool(true));

        info!(
            run_id = %ctx.run_id,
            steps = plan.steps.len(),
            estimated_cost_usd = plan.estimated_cost_usd,
            "Plan overridden by human"
        );
        let payload = json!({"override": true, "plan": &plan});
        ctx.plan = Some(plan);
        ctx.plan_overridden = true;
        ctx.touch();
        let run_id = ctx.run_id.clone();
        drop(ctx);

        self.events.emit(EventType::Plan, &run_id, payload);
        Ok(())
    }

    /// Request STOPPED. Returns whether the run stopped immediately (it was
    /// idle) rather than after its in-flight transition.
    pub fn stop(&self, handle: &RunHandle) -> WorkflowResult<bool> {
        self.halt(handle, WorkflowState::Stopped)
    }

    /// Request CANCELLED; see [`Orchestrator::stop`]
    pub fn cancel(&self, handle: &RunHandle) -> WorkflowResult<bool> {
        self.halt(handle, WorkflowState::Cancelled)
    }

    fn halt(&self, handle: &RunHandle, target: WorkflowState) -> WorkflowResult<bool> {
        let mut events = PendingEvents::new();
        let immediate = {
            let mut ctx = handle.lock();
            if ctx.is_terminal() {
                return Err(WorkflowError::Terminal(ctx.state));
            }
            handle.cancel_signal().request(target);
            if ctx.locked {
                info!(run_id = %ctx.run_id, state = %target, "Halt requested, settling after current transition");
                false
            } else {
                let from = ctx.state;
                ctx.set_state(target);
                info!(run_id = %ctx.run_id, state = %target, "Run halted");
                events.push(state_changed(from, target));
                events.push((EventType::Stopped, json!({"state": target, "during": from})));
                true
            }
        };
        self.publish(handle.run_id(), events);
        Ok(immediate)
    }
}

fn state_changed(from: WorkflowState, to: WorkflowState) -> (EventType, Value) {
    (EventType::StateChanged, json!({"from": from, "to": to}))
}

fn start_event(role: AgentRole, ctx: &WorkflowContext) -> (EventType, Value) {
    match role {
        AgentRole::Planner => (
            EventType::PlannerStart,
            json!({"intent": ctx.intent(), "constraints": ctx.constraints()}),
        ),
        AgentRole::Critic => (
            EventType::CriticStart,
            json!({"steps": ctx.plan.as_ref().map(|p| p.steps.len())}),
        ),
        AgentRole::Executor => (
            EventType::ExecutorStart,
            json!({
                "steps": ctx.plan.as_ref().map(|p| p.steps.len()),
                "plan_overridden": ctx.plan_overridden,
            }),
        ),
    }
}

fn finish_event(role: AgentRole, ctx: &WorkflowContext) -> Option<(EventType, Value)> {
    let payload = match role {
        AgentRole::Planner => serde_json::to_value(ctx.plan.as_ref()?).ok()?,
        AgentRole::Critic => serde_json::to_value(ctx.critique.as_ref()?).ok()?,
        AgentRole::Executor => serde_json::to_value(ctx.result.as_ref()?).ok()?,
    };
    let event_type = match role {
        AgentRole::Planner => EventType::Plan,
        AgentRole::Critic => EventType::Critique,
        AgentRole::Executor => EventType::Result,
    };
    Some((event_type, payload))
}

fn blocked_payload(ctx: &WorkflowContext) -> Value {
    let critique = ctx.critique.as_ref();
    json!({
        "estimated_cost_usd": ctx.plan.as_ref().map(|p| p.estimated_cost_usd),
        "requires_hitl": true,
        "ok": critique.map(|c| c.ok),
        "issues": critique.map(|c| &c.issues),
        "suggestions": critique.map(|c| &c.suggestions),
    })
}

// ── Builder ──────────────────────────────────────────────────────────

/// Assembles an orchestrator with the standard agents. Anything not
/// supplied falls back to the in-process implementation.
pub struct OrchestratorBuilder {
    config: EngineConfig,
    catalog: OperationCatalog,
    routing: RoutingTable,
    planner: Option<Arc<dyn PlannerBackend>>,
    tools: Option<Arc<dyn ToolExecutionBackend>>,
    events: Option<Arc<EventBroadcaster>>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    extra_agents: Vec<Arc<dyn Agent>>,
}

impl OrchestratorBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            catalog: OperationCatalog::standard(),
            routing: RoutingTable::standard(),
            planner: None,
            tools: None,
            events: None,
            breakers: None,
            extra_agents: Vec::new(),
        }
    }

    pub fn catalog(mut self, catalog: OperationCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn routing(mut self, routing: RoutingTable) -> Self {
        self.routing = routing;
        self
    }

    pub fn planner(mut self, planner: Arc<dyn PlannerBackend>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn tools(mut self, tools: Arc<dyn ToolExecutionBackend>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn events(mut self, events: Arc<EventBroadcaster>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    /// Register an agent after the standard ones, replacing the standard
    /// agent for its role
    pub fn agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.extra_agents.push(agent);
        self
    }

    pub fn build(self) -> Orchestrator {
        let config = self.config;
        let catalog = self.catalog;
        let guardrails = Arc::new(GuardrailEngine::new(
            config.guardrail_config(),
            catalog.clone(),
        ));
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(EventBroadcaster::local(config.event_history_size)));
        let breakers = self.breakers.unwrap_or_else(|| {
            Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker_config()))
        });
        let planner_backend = self
            .planner
            .unwrap_or_else(|| Arc::new(TemplatePlanner::new(catalog.clone())) as Arc<dyn PlannerBackend>);
        let tools = self
            .tools
            .unwrap_or_else(|| Arc::new(SimulatedToolBackend::new()) as Arc<dyn ToolExecutionBackend>);

        let planner = PlannerAgent::new(
            planner_backend,
            catalog.clone(),
            breakers.get(PLANNER_BREAKER),
        )
        .with_retry(config.retry_config())
        .with_timeout(config.planner_timeout())
        .with_model_version(config.model_version.as_str());

        let executor = ExecutorAgent::new(
            tools,
            catalog,
            breakers.clone(),
            ParallelExecutor::new(config.max_parallel_tasks).with_retry(config.retry_config()),
            events.clone(),
        )
        .with_step_timeout(config.step_timeout());

        let mut agents = AgentRegistry::new()
            .with(Arc::new(planner))
            .with(Arc::new(CriticAgent::new(guardrails.clone())))
            .with(Arc::new(GuardedAgent::new(
                Arc::new(ExecutionGuard::new(guardrails.clone())),
                Arc::new(executor),
            )));
        for agent in self.extra_agents {
            agents.register(agent);
        }
        if let Some(critic) = agents.get(AgentRole::Critic) {
            agents.register(Arc::new(FailSoftCritic::new(critic)));
        }

        Orchestrator::new(
            self.routing,
            agents,
            guardrails,
            events,
            breakers,
            config.model_version,
        )
    }
}
