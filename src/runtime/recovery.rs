//! Background loop that resumes instances whose durable delay came due.

use super::Orchestrator;
use super::executor::{ExecutionInput, panic_message};
use crate::providers::RunnableInstance;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

pub(super) async fn recovery_loop(orchestrator: Arc<Orchestrator>) {
    tracing::debug!(
        target: "durohost::recovery",
        definition = %orchestrator.definition_name,
        "Recovery loop started"
    );
    while orchestrator.is_running() {
        if let Err(panic) = AssertUnwindSafe(poll_once(&orchestrator)).catch_unwind().await {
            if !orchestrator.is_running() {
                break;
            }
            let reason = panic_message(&panic);
            tracing::error!(
                target: "durohost::recovery",
                definition = %orchestrator.definition_name,
                panic = %reason,
                "Recovery poll panicked; restarting"
            );
            tokio::select! {
                biased;
                _ = orchestrator.stop_signal.notified() => break,
                _ = tokio::time::sleep(orchestrator.options.recovery_restart_delay) => {}
            }
        }
    }
    tracing::debug!(
        target: "durohost::recovery",
        definition = %orchestrator.definition_name,
        "Recovery loop exited"
    );
}

async fn poll_once(orchestrator: &Arc<Orchestrator>) {
    let options = &orchestrator.options;
    let runnable = tokio::select! {
        biased;
        _ = orchestrator.stop_signal.notified() => return,
        found = orchestrator.store.wait_for_runnable(options.recovery_poll_timeout) => found,
    };
    if !runnable || !orchestrator.is_running() {
        return;
    }
    if let Some(claimed) = orchestrator.store.try_claim_runnable(options.claim_timeout).await {
        spawn_resume(orchestrator, claimed);
    }
}

fn spawn_resume(orchestrator: &Arc<Orchestrator>, claimed: RunnableInstance) {
    let guard = orchestrator.in_flight.enter();
    let orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        let _in_flight = guard;
        let instance_id = claimed.record.instance_id;
        let result = orchestrator
            .executor
            .run(claimed.record, ExecutionInput::TimerElapsed)
            .await
            .and_then(|outcome| outcome.into_error(instance_id));
        match result {
            Ok(outcome) => tracing::debug!(
                target: "durohost::recovery",
                instance_id = %instance_id,
                owner_id = %claimed.owner,
                status = %outcome.status(),
                "Recovered instance ran"
            ),
            Err(e) => tracing::warn!(
                target: "durohost::recovery",
                instance_id = %instance_id,
                owner_id = %claimed.owner,
                error = %e,
                "Recovered instance failed"
            ),
        }
    });
}
