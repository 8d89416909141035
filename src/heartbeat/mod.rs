pub mod service;

pub use service::{HEARTBEAT_PROMPT, HeartbeatCallback, HeartbeatService};
