// Outbound collaborators. Both run off the publish path: a failure is
// logged and counted, never surfaced to the publisher.
use async_trait::async_trait;
use herald_common::Message;
use std::fmt::Debug;
use std::net::IpAddr;
use std::sync::Arc;

/// Topic that relay keepalives are addressed to. Not a valid publish topic,
/// so it never collides with user traffic.
pub const RELAY_CONTROL_TOPIC: &str = "~control";

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("relay unavailable: {0}")]
    Unavailable(String),
    #[error("relay rejected message: {0}")]
    Rejected(String),
}

/// Forwards published messages to an upstream push gateway.
#[async_trait]
pub trait PushRelay: Debug + Send + Sync {
    async fn forward(&self, topic: &str, message: &Message) -> Result<(), RelayError>;
}

/// Sends a published message to an e-mail recipient on a visitor's behalf.
#[async_trait]
pub trait Mailer: Debug + Send + Sync {
    async fn send(&self, sender: IpAddr, to: &str, message: &Message) -> Result<(), RelayError>;
}

pub(crate) fn spawn_forward(relay: Arc<dyn PushRelay>, message: Arc<Message>) {
    tokio::spawn(async move {
        if let Err(err) = relay.forward(&message.topic, &message).await {
            metrics::counter!("herald_relay_failures_total").increment(1);
            tracing::warn!(topic = %message.topic, id = %message.id, error = %err, "push relay failed");
        }
    });
}

pub(crate) fn spawn_mail(mailer: Arc<dyn Mailer>, sender: IpAddr, to: String, message: Arc<Message>) {
    tokio::spawn(async move {
        if let Err(err) = mailer.send(sender, &to, &message).await {
            metrics::counter!("herald_mail_failures_total").increment(1);
            tracing::warn!(topic = %message.topic, id = %message.id, error = %err, "e-mail delivery failed");
        }
    });
}
