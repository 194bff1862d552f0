use tracing::trace;

// Counters are emitted as trace events under `research.metrics`.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "research.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "research.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn provider_call(provider: &str, outcome: &'static str, elapsed_ms: u128) {
    trace!(
        target = "research.metrics",
        provider = provider,
        outcome = outcome,
        elapsed_ms = elapsed_ms as u64,
        "provider_call"
    );
}

pub fn surface_outcome(outcome: &'static str) {
    trace!(
        target = "research.metrics",
        outcome = outcome,
        "surface_outcome_inc"
    );
}

pub fn run_finished(status: &'static str, elapsed_ms: u128) {
    trace!(
        target = "research.metrics",
        status = status,
        elapsed_ms = elapsed_ms as u64,
        "run_finished"
    );
}
