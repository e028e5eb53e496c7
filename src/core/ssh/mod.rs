mod client;

pub use client::{
    classify_exit, pump, ChannelClose, ChannelOutcome, ConnectionSession, RemoteTarget,
    SshTransport, Transport,
};
