//! Cluster scenarios exercised by the simulation harness.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// MC-001: One model, several workers, results flow end to end
    SteadyState,

    /// MC-002: Model swapped mid-run, statistics reset
    ModelSwap,

    /// MC-003: Model TTL runs out, generation halts on its own
    ModelExpiry,

    /// MC-004: Worker joins long after the model was published
    LateWorker,

    /// MC-005: Workers learn of a swap only through mismatched scenarios
    StaleWorker,

    /// MC-006: Formula that cannot be evaluated
    BrokenFormula,

    /// MC-007: Publish failures on the scenario and result queues
    TransientFaults,

    /// MC-008: Swap to a model that fails validation
    InvalidModel,

    /// MC-009: No model is ever published
    WorkerStarvation,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SteadyState,
            ScenarioId::ModelSwap,
            ScenarioId::ModelExpiry,
            ScenarioId::LateWorker,
            ScenarioId::StaleWorker,
            ScenarioId::BrokenFormula,
            ScenarioId::TransientFaults,
            ScenarioId::InvalidModel,
            ScenarioId::WorkerStarvation,
        ]
    }

    /// Returns the scenarios where something goes wrong on purpose.
    pub fn faults() -> Vec<ScenarioId> {
        Self::all().into_iter().filter(|s| s.is_fault()).collect()
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SteadyState => "steady_state",
            ScenarioId::ModelSwap => "model_swap",
            ScenarioId::ModelExpiry => "model_expiry",
            ScenarioId::LateWorker => "late_worker",
            ScenarioId::StaleWorker => "stale_worker",
            ScenarioId::BrokenFormula => "broken_formula",
            ScenarioId::TransientFaults => "transient_faults",
            ScenarioId::InvalidModel => "invalid_model",
            ScenarioId::WorkerStarvation => "worker_starvation",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SteadyState => "3 workers evaluate 'beneficio' until shutdown",
            ScenarioId::ModelSwap => "Swap 'beneficio' for 'area' halfway, monitor resets",
            ScenarioId::ModelExpiry => "5s model TTL, generation stops within one check period",
            ScenarioId::LateWorker => "A worker starts 10s late and still acquires the model",
            ScenarioId::StaleWorker => "Swap to 'tiempo', no result is computed under a stale model",
            ScenarioId::BrokenFormula => "Unparseable formula, every scenario dropped",
            ScenarioId::TransientFaults => "5 failed publishes per queue, nothing lost",
            ScenarioId::InvalidModel => "Swap to a model without variables, generation stays stopped",
            ScenarioId::WorkerStarvation => "No model, worker gives up after its polling budget",
        }
    }

    /// Returns true if faults are injected or errors expected.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            ScenarioId::BrokenFormula
                | ScenarioId::TransientFaults
                | ScenarioId::InvalidModel
                | ScenarioId::WorkerStarvation
        )
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl serde::Serialize for ScenarioId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "steady_state" | "steadystate" | "mc-001" => Ok(ScenarioId::SteadyState),
            "model_swap" | "modelswap" | "mc-002" => Ok(ScenarioId::ModelSwap),
            "model_expiry" | "modelexpiry" | "mc-003" => Ok(ScenarioId::ModelExpiry),
            "late_worker" | "lateworker" | "mc-004" => Ok(ScenarioId::LateWorker),
            "stale_worker" | "staleworker" | "mc-005" => Ok(ScenarioId::StaleWorker),
            "broken_formula" | "brokenformula" | "mc-006" => Ok(ScenarioId::BrokenFormula),
            "transient_faults" | "transientfaults" | "mc-007" => Ok(ScenarioId::TransientFaults),
            "invalid_model" | "invalidmodel" | "mc-008" => Ok(ScenarioId::InvalidModel),
            "worker_starvation" | "workerstarvation" | "mc-009" => Ok(ScenarioId::WorkerStarvation),
            // Groups
            "faults" => Err("Use --faults flag for fault scenarios".to_string()),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
