//! Gateway client: authenticated duplex connection, reconnection, RPCs.

pub mod client;
pub mod protocol;

pub use client::{ConnectionState, GatewayClient, GatewayEvent};
pub use protocol::{
    Attachment, ClientFrame, HistoryMessage, RequestOp, SendAccepted, ServerFrame, SessionInfo,
    SpawnParams, SpawnedSession,
};
