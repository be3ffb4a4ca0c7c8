//! ---
//! agent_section: "07-fault-injection"
//! agent_subsection: "module"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Fault injection engine and safety validation."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
//! Controlled fault injection for resilience testing.
//!
//! The [`Scheduler`] rolls against each enabled failure type once per cycle and
//! hands selected ones to an [`Injector`]. Every externally supplied parameter
//! passes the [`safety`] validators first, and every host change is tracked so
//! the [`LifecycleManager`] can undo it.

pub mod command;
pub mod context;
pub mod error;
pub mod injectors;
pub mod lifecycle;
pub mod outcome;
pub mod process_table;
pub mod runtime;
pub mod safety;
pub mod scheduler;
pub mod tasks;

pub use command::{CommandOutput, CommandRunner, CommandStatus, CommandVerdict, SystemCommandRunner};
pub use context::InjectionContext;
pub use error::AgentError;
pub use injectors::network::{cleanup_network_rules, CleanupError, CleanupOutcome};
pub use injectors::{
    CpuInjector, HostBindings, Injector, InjectorSet, MemoryInjector, NetworkInjector,
    ProcessInjector,
};
pub use lifecycle::{ActiveResourceSet, CleanupSummary, LifecycleManager};
pub use outcome::{Dispatch, InjectionOutcome};
pub use process_table::{ProcessInfo, ProcessSignal, ProcessTable, SignalError, SystemProcessTable};
pub use runtime::{configured_interface, AgentRuntime};
pub use safety::{LinkProbe, LinkStatus, ProcessSafetyPolicy, Rejection};
pub use scheduler::{CycleEntry, CycleReport, Scheduler};
pub use tasks::{TaskId, TaskRegistry};
