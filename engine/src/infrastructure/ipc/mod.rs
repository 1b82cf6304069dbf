//! Agent/child handshake channels over unix domain sockets

pub mod connection;
pub mod protocol;

pub use connection::{IpcConnection, IpcError, Role};
pub use protocol::{
    channel_path, request_exit, send_heartbeat, signal_initialization_done, wait_for_exit_request,
    wait_for_heartbeat, wait_for_initialization, ChannelKind, ChildChannels, ProtocolMessage,
};
