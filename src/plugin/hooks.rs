//! Ordered, failure-isolated dispatch of workflow hooks.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::HookExecutionError;

use super::capability::{HookContext, HookPhase, HookStatus, WorkflowHook};

/// A hook plugin's slot in one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookRegistration {
    pub phase: HookPhase,
    pub plugin_id: String,
    /// Lower runs earlier.
    pub priority: i32,
    pub critical: bool,
    /// Install order; breaks priority ties.
    pub sequence: u64,
    /// Overrides the dispatcher default when set.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
}

/// What happened to one hook during a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerPluginOutcome {
    pub plugin_id: String,
    pub status: OutcomeStatus,
    pub critical: bool,
    pub detail: String,
    pub error: Option<HookExecutionError>,
    pub elapsed: Duration,
}

/// Aggregated result of dispatching one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: HookPhase,
    /// In invocation order.
    pub outcomes: Vec<PerPluginOutcome>,
}

impl PhaseReport {
    /// False when any critical hook failed.
    pub fn is_success(&self) -> bool {
        self.failed_critical().is_empty()
    }

    pub fn failed_critical(&self) -> Vec<&PerPluginOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.critical && o.status == OutcomeStatus::Failed)
            .collect()
    }

    pub fn failures(&self) -> Vec<&PerPluginOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Failed)
            .collect()
    }

    pub fn plugin_ids(&self) -> Vec<&str> {
        self.outcomes.iter().map(|o| o.plugin_id.as_str()).collect()
    }
}

/// Per-phase ordered hook lists.
///
/// The dispatcher never owns hook instances; it holds plugin ids and asks
/// the caller to resolve them at dispatch time.
pub struct HookDispatcher {
    default_timeout: Duration,
    phases: RwLock<BTreeMap<HookPhase, Vec<HookRegistration>>>,
}

impl HookDispatcher {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            phases: RwLock::new(BTreeMap::new()),
        }
    }

    /// Add a registration, replacing any existing one for the same plugin
    /// and phase.
    pub fn register(&self, registration: HookRegistration) {
        let mut phases = self.phases.write().unwrap_or_else(PoisonError::into_inner);
        let list = phases.entry(registration.phase).or_default();
        list.retain(|r| r.plugin_id != registration.plugin_id);
        debug!(
            plugin = %registration.plugin_id,
            phase = %registration.phase,
            priority = registration.priority,
            "Registered hook"
        );
        list.push(registration);
        list.sort_by_key(|r| (r.priority, r.sequence));
    }

    /// Returns whether a registration was removed.
    pub fn unregister(&self, plugin_id: &str, phase: HookPhase) -> bool {
        let mut phases = self.phases.write().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = phases.get_mut(&phase) else {
            return false;
        };
        let before = list.len();
        list.retain(|r| r.plugin_id != plugin_id);
        before != list.len()
    }

    pub fn unregister_all(&self, plugin_id: &str) {
        for phase in HookPhase::ALL {
            self.unregister(plugin_id, phase);
        }
    }

    /// Snapshot of a phase's registrations in invocation order.
    pub fn registrations(&self, phase: HookPhase) -> Vec<HookRegistration> {
        self.phases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&phase)
            .cloned()
            .unwrap_or_default()
    }

    /// Every registration held for one plugin.
    pub fn registrations_for(&self, plugin_id: &str) -> Vec<HookRegistration> {
        self.phases
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .flatten()
            .filter(|r| r.plugin_id == plugin_id)
            .cloned()
            .collect()
    }

    /// Run every hook registered for `phase`, one at a time, in priority
    /// order.
    ///
    /// Errors, panics and timeouts are confined to the outcome of the hook
    /// that caused them; the remaining hooks still run.
    pub async fn dispatch<F>(
        &self,
        phase: HookPhase,
        context: &HookContext,
        resolve: F,
    ) -> PhaseReport
    where
        F: Fn(&str) -> Option<Arc<dyn WorkflowHook>>,
    {
        let registrations = self.registrations(phase);
        let mut outcomes = Vec::with_capacity(registrations.len());

        for registration in registrations {
            let outcome = match resolve(&registration.plugin_id) {
                Some(hook) => self.invoke(&registration, hook, context).await,
                None => failed(&registration, HookExecutionError::NotLoaded, Duration::ZERO),
            };

            match &outcome.error {
                Some(error) if registration.critical => {
                    warn!(plugin = %registration.plugin_id, phase = %phase, "Critical hook failed: {}", error)
                }
                Some(error) => {
                    warn!(plugin = %registration.plugin_id, phase = %phase, "Hook failed: {}", error)
                }
                None => {}
            }
            outcomes.push(outcome);
        }

        let report = PhaseReport { phase, outcomes };
        info!(
            phase = %phase,
            hooks = report.outcomes.len(),
            failed = report.failures().len(),
            "Dispatched hooks"
        );
        report
    }

    async fn invoke(
        &self,
        registration: &HookRegistration,
        hook: Arc<dyn WorkflowHook>,
        context: &HookContext,
    ) -> PerPluginOutcome {
        let limit = registration.timeout.unwrap_or(self.default_timeout);
        let phase = registration.phase;
        let context = context.clone();
        let start = Instant::now();

        // A separate task so a panicking hook surfaces as a JoinError.
        let mut handle = tokio::spawn(async move { hook.run(phase, &context).await });

        let result = match timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                return failed(
                    registration,
                    HookExecutionError::TimedOut(limit),
                    start.elapsed(),
                );
            }
        };
        let elapsed = start.elapsed();

        match result {
            Ok(Ok(outcome)) => match outcome.status {
                HookStatus::Passed => succeeded(registration, outcome.detail, elapsed),
                HookStatus::Warning => {
                    warn!(plugin = %registration.plugin_id, phase = %phase, "Hook warning: {}", outcome.detail);
                    succeeded(registration, outcome.detail, elapsed)
                }
                HookStatus::Failed => failed(
                    registration,
                    HookExecutionError::Rejected(outcome.detail),
                    elapsed,
                ),
            },
            Ok(Err(e)) => failed(registration, HookExecutionError::Failed(e.to_string()), elapsed),
            Err(join) if join.is_panic() => failed(registration, HookExecutionError::Panicked, elapsed),
            Err(join) => failed(
                registration,
                HookExecutionError::Failed(join.to_string()),
                elapsed,
            ),
        }
    }
}

fn succeeded(registration: &HookRegistration, detail: String, elapsed: Duration) -> PerPluginOutcome {
    PerPluginOutcome {
        plugin_id: registration.plugin_id.clone(),
        status: OutcomeStatus::Succeeded,
        critical: registration.critical,
        detail,
        error: None,
        elapsed,
    }
}

fn failed(
    registration: &HookRegistration,
    error: HookExecutionError,
    elapsed: Duration,
) -> PerPluginOutcome {
    PerPluginOutcome {
        plugin_id: registration.plugin_id.clone(),
        status: OutcomeStatus::Failed,
        critical: registration.critical,
        detail: error.to_string(),
        error: Some(error),
        elapsed,
    }
}
