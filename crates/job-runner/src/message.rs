// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messages exchanged on the internal queues.
//!
//! Two unidirectional queues connect the three execution contexts:
//!
//! - orchestrator-ward: `Submit` (gateway), `Finished`/`FinishedSpecial`
//!   (runtime watchers) and `Cancel` (signal handler);
//! - gateway-ward: `Output` and `Prov` (orchestrator).
//!
//! Watchers never touch orchestrator state directly, they only enqueue.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::job::JobParams;

/// A message on one of the internal queues.
#[derive(Debug, Clone)]
pub enum Message {
    /// Run a (sub)job with the given parameters.
    Submit {
        /// Server-generated job id.
        job_id: String,
        /// Method and parameters to run.
        params: JobParams,
    },
    /// A container unit of work has terminated.
    Finished {
        /// Job id of the terminated unit.
        job_id: String,
        /// Output if the backend already knows it; containers report through output.json.
        output: Option<Value>,
    },
    /// A special (batch/WDL) unit of work has terminated.
    FinishedSpecial {
        /// Job id of the terminated unit.
        job_id: String,
        /// Result payload.
        result: Value,
    },
    /// Tear everything down.
    Cancel,
    /// Completed output for a job, forwarded to the gateway.
    Output {
        /// Job id the payload belongs to.
        job_id: String,
        /// Result or error payload.
        payload: Value,
    },
    /// Latest provenance snapshot, forwarded to the gateway.
    Prov(Value),
}

impl Message {
    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Submit { .. } => "submit",
            Message::Finished { .. } => "finished",
            Message::FinishedSpecial { .. } => "finished_special",
            Message::Cancel => "cancel",
            Message::Output { .. } => "output",
            Message::Prov(_) => "prov",
        }
    }
}

/// Sending half of a message queue.
pub type MessageSender = mpsc::UnboundedSender<Message>;

/// Receiving half of a message queue.
pub type MessageReceiver = mpsc::UnboundedReceiver<Message>;

/// Create a new message queue.
pub fn queue() -> (MessageSender, MessageReceiver) {
    mpsc::unbounded_channel()
}

/// Publish a message on every queue, ignoring queues whose receiver is gone.
pub fn broadcast(queues: &[MessageSender], message: Message) {
    for queue in queues {
        if queue.send(message.clone()).is_err() {
            tracing::debug!(kind = message.kind(), "Queue receiver dropped, message discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_reaches_every_queue() {
        let (tx1, mut rx1) = queue();
        let (tx2, mut rx2) = queue();

        broadcast(
            &[tx1, tx2],
            Message::Finished {
                job_id: "job-1".to_string(),
                output: None,
            },
        );

        assert!(matches!(rx1.try_recv(), Ok(Message::Finished { job_id, .. }) if job_id == "job-1"));
        assert!(matches!(rx2.try_recv(), Ok(Message::Finished { job_id, .. }) if job_id == "job-1"));
    }

    #[test]
    fn test_broadcast_skips_closed_queue() {
        let (tx1, rx1) = queue();
        let (tx2, mut rx2) = queue();
        drop(rx1);

        broadcast(&[tx1, tx2], Message::Cancel);

        assert!(matches!(rx2.try_recv(), Ok(Message::Cancel)));
    }
}
