//! Outbound message dispatch: picks the transport for each message and funnels
//! every terminal outcome through one cleanup path.

mod dispatcher;
mod message;

pub use dispatcher::{
    DispatchDisposition, DispatchStats, Dispatcher, DispatcherBuilder, NoReplies, ReplyRegistry,
    SendCompletion, NO_TRANSPORT_BAN, NO_TRANSPORT_BAN_LOCAL,
};
pub use message::{Job, MessageId, OutboundMessage};

use thiserror::Error;

use crate::transport::TransportId;

/// Why a message could not be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchFailure {
    #[error("target is permanently banned")]
    Banned,
    #[error("target is this router")]
    SelfSend,
    #[error("message expired")]
    Expired,
    /// No transport bid on the first attempt: there is no known path to the peer.
    #[error("no transport available for target")]
    NoTransports,
    #[error("all transports failed")]
    AllTransportsFailed,
    #[error("transport {transport} failed to send")]
    TransportFailed { transport: TransportId },
}

impl DispatchFailure {
    /// Retrying can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Banned | Self::SelfSend)
    }

    /// A later attempt, possibly over another transport, may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoTransports | Self::AllTransportsFailed | Self::TransportFailed { .. }
        )
    }
}
