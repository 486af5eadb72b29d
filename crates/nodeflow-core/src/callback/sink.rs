//! In-process notify sink.
//!
//! Background work started by a step handler (the sync step's polling loop,
//! for example) reports its terminal result as a `Completion` on this
//! channel. The pump feeds every completion into `CallbackProtocol::notify`,
//! the same entry point external executors reach over HTTP.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use nodeflow_types::callback::ResultPayload;

use super::protocol::CallbackProtocol;
use crate::repository::callback::CallbackRepository;
use crate::repository::node_execution::NodeExecutionRepository;

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub callback_id: String,
    pub payload: ResultPayload,
}

pub type CompletionSender = mpsc::UnboundedSender<Completion>;
pub type CompletionReceiver = mpsc::UnboundedReceiver<Completion>;

pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    mpsc::unbounded_channel()
}

/// Deliver completions until every sender is dropped or `cancel` fires.
pub async fn run_completion_pump<R, C>(
    protocol: Arc<CallbackProtocol<R, C>>,
    mut completions: CompletionReceiver,
    cancel: CancellationToken,
) where
    R: NodeExecutionRepository,
    C: CallbackRepository,
{
    info!("completion pump started");
    loop {
        let completion = tokio::select! {
            _ = cancel.cancelled() => break,
            next = completions.recv() => match next {
                Some(completion) => completion,
                None => break,
            },
        };
        match protocol
            .notify(&completion.callback_id, completion.payload)
            .await
        {
            Ok(outcome) => {
                debug!(callback_id = %completion.callback_id, outcome = ?outcome, "completion delivered")
            }
            Err(e) => {
                warn!(callback_id = %completion.callback_id, error = %e, "completion delivery failed")
            }
        }
    }
    info!("completion pump stopped");
}
