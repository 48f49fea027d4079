pub mod control_channel;
pub mod endpoint_addr;
pub mod session;
pub mod session_messages;
