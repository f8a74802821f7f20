//! Approval requests: the human-in-the-loop half of the policy gate.

use crate::intent::Intent;
use crate::kernel::{fresh_id, millis, single, Kernel};
use apiary_core::{EntityKind, Event, EventKind, KernelError, Result, SYSTEM_ACTOR};
use apiary_derive::machine::ApprovalState;
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;

impl Kernel {
    /// Ask for permission to perform `action` within a Run.
    pub fn request_approval(
        &self,
        actor: &str,
        run_id: &str,
        action: EventKind,
        reason: &str,
    ) -> Result<Event> {
        let approval_id = fresh_id("apr");
        single(self.submit(
            Intent::new(
                EventKind::ApprovalRequested,
                actor,
                json!({"approval_id": approval_id, "action": action.as_str(), "reason": reason}),
            )
            .in_run(run_id),
        )?)
    }

    /// Approve or reject a pending request.
    pub fn decide_approval(
        &self,
        actor: &str,
        approval_id: &str,
        approve: bool,
        reason: Option<&str>,
    ) -> Result<Event> {
        let run_id = self.approval_run(approval_id)?;
        let kind = if approve {
            EventKind::ApprovalApproved
        } else {
            EventKind::ApprovalRejected
        };
        let mut payload = json!({"approval_id": approval_id});
        if let Some(reason) = reason {
            payload["reason"] = json!(reason);
        }
        single(self.submit(Intent::new(kind, actor, payload).in_run(&run_id))?)
    }

    /// Wait until the request leaves `pending`. On timeout the request is
    /// expired and an `operation.timeout` is recorded.
    pub async fn await_approval(&self, approval_id: &str, timeout: Duration) -> Result<ApprovalState> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let state = self.approval_state(approval_id)?;
            if state != ApprovalState::Pending {
                return Ok(state);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.expire_approval(approval_id, timeout);
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    /// Wait with the configured approval timeout.
    pub async fn await_approval_default(&self, approval_id: &str) -> Result<ApprovalState> {
        let timeout = Duration::from_secs(self.config().thresholds.approval_timeout_secs);
        self.await_approval(approval_id, timeout).await
    }

    fn expire_approval(&self, approval_id: &str, waited: Duration) -> Result<ApprovalState> {
        let run_id = self.approval_run(approval_id)?;
        tracing::warn!(approval = approval_id, waited_ms = millis(waited), "approval timed out");
        let expired = self.record(
            Some(&run_id),
            vec![
                Intent::new(
                    EventKind::OperationTimeout,
                    SYSTEM_ACTOR,
                    json!({
                        "target_id": approval_id,
                        "operation": "approval.wait",
                        "timeout_ms": millis(waited),
                    }),
                )
                .in_run(&run_id),
                Intent::new(
                    EventKind::ApprovalExpired,
                    SYSTEM_ACTOR,
                    json!({"approval_id": approval_id, "reason": "timed out"}),
                )
                .in_run(&run_id),
            ],
        );
        match expired {
            Ok(_) => Ok(ApprovalState::Expired),
            // Decided between the last check and the write.
            Err(KernelError::InvalidStateTransition { .. }) => self.approval_state(approval_id),
            Err(e) => Err(e),
        }
    }

    fn approval_state(&self, approval_id: &str) -> Result<ApprovalState> {
        self.world()?
            .approvals
            .get(approval_id)
            .map(|a| a.state)
            .ok_or_else(|| not_found(approval_id))
    }

    fn approval_run(&self, approval_id: &str) -> Result<String> {
        self.world()?
            .approvals
            .get(approval_id)
            .map(|a| a.run_id.clone())
            .ok_or_else(|| not_found(approval_id))
    }
}

fn not_found(approval_id: &str) -> KernelError {
    KernelError::NotFound {
        entity: EntityKind::ApprovalRequest,
        id: approval_id.to_string(),
    }
}
