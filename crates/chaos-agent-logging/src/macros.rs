//! ---
//! agent_section: "03-observability"
//! agent_subsection: "module"
//! agent_type: "source"
//! agent_scope: "code"
//! agent_description: "Structured logging adapters and sinks."
//! agent_version: "v0.0.0-prealpha"
//! agent_owner: "tbd"
//! ---

#[doc(hidden)]
#[macro_export]
macro_rules! __agent_event {
    ($lvl:expr, $ctx:expr, $($rest:tt)+) => {{
        let ctx = &$ctx;
        $crate::tracing::event!(
            $lvl,
            correlation_id = ctx.correlation_id.unwrap_or(""),
            cycle = ctx.cycle.unwrap_or_default(),
            failure_type = ctx.failure_type.unwrap_or(""),
            dry_run = ctx.dry_run,
            $($rest)+
        );
    }};
}

/// Emit an informational log enriched with the cycle context.
#[macro_export]
macro_rules! agent_info {
    (context = $ctx:expr, $($rest:tt)+) => {
        $crate::__agent_event!($crate::tracing::Level::INFO, $ctx, $($rest)+)
    };
    ($($rest:tt)+) => {
        $crate::__agent_event!($crate::tracing::Level::INFO, $crate::LogContext::default(), $($rest)+)
    };
}

/// Emit a debug log enriched with the cycle context.
#[macro_export]
macro_rules! agent_debug {
    (context = $ctx:expr, $($rest:tt)+) => {
        $crate::__agent_event!($crate::tracing::Level::DEBUG, $ctx, $($rest)+)
    };
    ($($rest:tt)+) => {
        $crate::__agent_event!($crate::tracing::Level::DEBUG, $crate::LogContext::default(), $($rest)+)
    };
}

/// Emit a warning enriched with the cycle context.
#[macro_export]
macro_rules! agent_warn {
    (context = $ctx:expr, $($rest:tt)+) => {
        $crate::__agent_event!($crate::tracing::Level::WARN, $ctx, $($rest)+)
    };
    ($($rest:tt)+) => {
        $crate::__agent_event!($crate::tracing::Level::WARN, $crate::LogContext::default(), $($rest)+)
    };
}

/// Emit an error log enriched with the cycle context.
#[macro_export]
macro_rules! agent_error {
    (context = $ctx:expr, $($rest:tt)+) => {
        $crate::__agent_event!($crate::tracing::Level::ERROR, $ctx, $($rest)+)
    };
    ($($rest:tt)+) => {
        $crate::__agent_event!($crate::tracing::Level::ERROR, $crate::LogContext::default(), $($rest)+)
    };
}
