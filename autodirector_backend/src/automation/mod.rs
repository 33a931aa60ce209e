pub mod config;
pub mod engine;
pub mod executor;
pub mod queue;
pub mod router;
pub mod trigger;
pub mod types;

pub use config::{AutomationConfig, AutomationConfigPatch};
pub use engine::{AutomationEngine, EngineEvent, EngineState};
pub use executor::{ActionExecutor, HttpActionExecutor, LoggingActionExecutor};
pub use queue::{PriorityQueue, QueueStats, QueuedDecision};
pub use router::{DecisionRouter, Disposition, DropReason, RouteDecision};
pub use trigger::{TriggerCondition, TriggerEvaluator, TriggerRule};
pub use types::{
    ActionResult, ActionType, AutomationEvent, CandidateAction, EventResolution, ExecutionMode,
    OperatorAction, Outcome, Priority, TriggerType,
};
