//! Participant side of the heartbeat channel.
//!
//! Gateways and predictors answer the trainer through the same loop: accept
//! a channel, read one envelope at a time, hand the message to a
//! [`ControlHandler`] and send back whatever it returns.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use policy_sync_core::traits::Role;
use policy_sync_net::protocol::{Envelope, SyncMessage};
use policy_sync_net::traits::{ChannelListener, HeartbeatChannel, RecvMode};

/// How long a served channel waits per receive before checking again
pub(crate) const SERVE_POLL: Duration = Duration::from_millis(500);

/// Reacts to control messages from the trainer
#[async_trait]
pub trait ControlHandler: Send + Sync {
    /// Role reported in logs
    fn role(&self) -> Role;

    /// Handle one message; `Some` is sent back as the reply
    async fn handle(&self, message: SyncMessage) -> Option<SyncMessage>;
}

/// Serve one channel until it closes or errors
pub async fn serve_channel<H>(handler: Arc<H>, mut channel: Box<dyn HeartbeatChannel>)
where
    H: ControlHandler + ?Sized,
{
    let peer = channel.endpoint().clone();
    let role = handler.role();
    loop {
        let envelope = match channel.recv(RecvMode::Timeout(SERVE_POLL)).await {
            Ok(Some(env)) => env,
            Ok(None) => continue,
            Err(e) => {
                tracing::info!(%role, %peer, error = %e, "control channel ended");
                return;
            }
        };
        tracing::trace!(
            %role,
            round = envelope.round,
            seq = envelope.sequence,
            kind = envelope.message.message_type().as_str(),
            "control message"
        );
        let Envelope {
            round,
            sequence,
            message,
            ..
        } = envelope;
        if let Some(reply) = handler.handle(message).await {
            let reply = Envelope::new(reply).with_round(round).with_sequence(sequence);
            if let Err(e) = channel.send(&reply).await {
                tracing::warn!(%role, %peer, error = %e, "failed to send reply");
                return;
            }
        }
    }
}

/// Accept channels on `listener` and serve each on its own task.
///
/// Returns when the listener fails; abort the task to stop serving.
pub async fn serve_participant<H, L>(handler: Arc<H>, listener: L)
where
    H: ControlHandler + ?Sized + 'static,
    L: ChannelListener,
{
    let local = listener.local_endpoint();
    tracing::info!(role = %handler.role(), %local, "serving control channel");
    loop {
        match listener.accept().await {
            Ok(channel) => {
                tokio::spawn(serve_channel(Arc::clone(&handler), channel));
            }
            Err(e) => {
                tracing::warn!(role = %handler.role(), %local, error = %e, "listener stopped");
                return;
            }
        }
    }
}
