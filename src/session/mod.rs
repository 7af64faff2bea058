//! Session lifecycle support
//!
//! Reconnection scheduling for dropped transports. The scheduler never touches the
//! network itself; the owning [`crate::ssh::Connection`] performs each attempt and
//! reports the outcome back.

mod reconnect;

pub use reconnect::{
    ReconnectEvent, ReconnectSnapshot, ReconnectState, ReconnectionManager, ReconnectionPolicy,
};
