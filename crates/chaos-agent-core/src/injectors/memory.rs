//! ---
//! agent_section: "07-fault-injection"
//! agent_subsection: "module"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Fault injection engine and safety validation."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---
use std::collections::TryReserveError;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chaos_agent_common::{FailureKind, FailureSpec};
use chaos_agent_logging::{agent_info, agent_warn};
use chaos_agent_metrics::InjectionMetrics;
use thiserror::Error;

use super::Injector;
use crate::context::InjectionContext;
use crate::error::AgentError;
use crate::outcome::{conclude, Dispatch, InjectionOutcome};
use crate::tasks::TaskRegistry;

pub const BLOCK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
#[error("allocated {allocated} of {requested} MB before the allocator refused: {source}")]
pub struct AllocationError {
    pub allocated: u64,
    pub requested: u64,
    #[source]
    pub source: TryReserveError,
}

/// Memory actually held by a pressure run. Released on drop.
#[derive(Debug)]
pub struct Ballast {
    blocks: Vec<Vec<u8>>,
}

impl Ballast {
    pub fn megabytes(&self) -> usize {
        self.blocks.len()
    }
}

/// Allocate `mb` one-megabyte blocks, each filled with a distinct byte pattern
/// so the pages are committed rather than lazily mapped.
///
/// On failure everything allocated so far is released before returning.
pub fn allocate(mb: u64) -> Result<Ballast, AllocationError> {
    let fail = |allocated: usize, source| AllocationError {
        allocated: allocated as u64,
        requested: mb,
        source,
    };
    let count = usize::try_from(mb).unwrap_or(usize::MAX);
    let mut blocks: Vec<Vec<u8>> = Vec::new();
    blocks.try_reserve_exact(count).map_err(|err| fail(0, err))?;
    for index in 0..count {
        let mut block = Vec::new();
        block
            .try_reserve_exact(BLOCK_SIZE)
            .map_err(|err| fail(index, err))?;
        let seed = (index as u8).wrapping_mul(31);
        block.extend((0..BLOCK_SIZE).map(|offset| seed.wrapping_add(offset as u8)));
        blocks.push(block);
    }
    Ok(Ballast { blocks })
}

/// Holds allocated memory in the background; the cycle never waits for it.
#[derive(Debug)]
pub struct MemoryInjector {
    metrics: InjectionMetrics,
    tasks: Arc<TaskRegistry>,
}

impl MemoryInjector {
    pub fn new(metrics: InjectionMetrics, tasks: Arc<TaskRegistry>) -> Self {
        Self { metrics, tasks }
    }
}

#[async_trait]
impl Injector for MemoryInjector {
    fn kind(&self) -> FailureKind {
        FailureKind::Memory
    }

    async fn inject(&self, spec: &FailureSpec, ctx: &InjectionContext) -> Result<Dispatch, AgentError> {
        let log = ctx.log(FailureKind::Memory);
        let mb = spec.mb;
        let hold = spec.duration;

        if ctx.dry_run() {
            agent_info!(
                context = log,
                mb,
                duration_s = hold.as_secs_f64(),
                "dry run: would allocate {} MB",
                mb
            );
            let outcome = InjectionOutcome::skipped("dry run");
            return Ok(Dispatch::Completed(conclude(&self.metrics, FailureKind::Memory, ctx, outcome)));
        }

        let active = self.metrics.begin(FailureKind::Memory.as_str());
        let metrics = self.metrics.clone();
        let task_ctx = ctx.clone();
        let pressure = async move {
            let _active = active;
            let outcome = hold_memory(mb, hold, &task_ctx).await;
            conclude(&metrics, FailureKind::Memory, &task_ctx, outcome);
        };

        match self.tasks.try_spawn(format!("memory-{mb}mb"), pressure) {
            Ok(task_id) => {
                agent_info!(
                    context = log,
                    task_id,
                    mb,
                    duration_s = hold.as_secs_f64(),
                    "allocating {} MB in the background",
                    mb
                );
                Ok(Dispatch::Detached { task_id })
            }
            Err(full) => {
                agent_warn!(context = log, limit = full.limit, "memory injection refused");
                let outcome = InjectionOutcome::skipped(full.to_string());
                Ok(Dispatch::Completed(conclude(&self.metrics, FailureKind::Memory, ctx, outcome)))
            }
        }
    }
}

async fn hold_memory(mb: u64, hold: Duration, ctx: &InjectionContext) -> InjectionOutcome {
    let ballast = match tokio::task::spawn_blocking(move || allocate(mb)).await {
        Ok(Ok(ballast)) => ballast,
        Ok(Err(err)) => return InjectionOutcome::failed(err.to_string()),
        Err(err) => return InjectionOutcome::failed(format!("allocation task ended abnormally: {err}")),
    };
    agent_info!(
        context = ctx.log(FailureKind::Memory),
        mb = ballast.megabytes(),
        "holding allocated memory"
    );
    tokio::time::sleep(hold).await;
    drop(ballast);
    InjectionOutcome::Success
}
