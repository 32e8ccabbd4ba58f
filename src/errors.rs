use std::net::SocketAddr;

use uuid::Uuid;

use crate::session::SessionState;
use crate::sync::SyncPolicy;

/// All error types that can occur when discovering or controlling bulbs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to serialize data to JSON.
    #[error("failed to dump json: {0:?}")]
    JsonDump(serde_json::Error),

    /// Failed to deserialize JSON data.
    #[error("failed to load json: {0:?}")]
    JsonLoad(serde_json::Error),

    /// A socket operation failed while running an SSDP discovery pass.
    #[error("discovery socket {action} error: {err:?}")]
    DiscoverySocket { action: String, err: std::io::Error },

    /// Every discovery attempt failed; wraps the last cause.
    #[error("discovery failed after {attempts} attempts: {source}")]
    DiscoveryExhausted { attempts: u32, source: Box<Error> },

    /// The mDNS daemon could not be started or browsed.
    #[error("mdns daemon error: {0}")]
    MdnsDaemon(String),

    /// The operation was cancelled before it could complete.
    #[error("operation cancelled")]
    Cancelled,

    /// Opening a TCP connection to a bulb failed.
    #[error("connect to {addr} failed: {err:?}")]
    Connect { addr: SocketAddr, err: std::io::Error },

    /// Opening a TCP connection to a bulb did not complete in time.
    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),

    /// The transport dropped while requests were pending or being written.
    #[error("connection lost")]
    ConnectionLost,

    /// A command was issued on a session that is not ready.
    #[error("session is {0}, not ready")]
    NotReady(SessionState),

    /// An incoming line was not a valid protocol frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// The bulb reported a failure result for a command.
    #[error("device error {code}: {message}")]
    Device { code: i64, message: String },

    /// No response arrived for a command within the response timeout.
    #[error("response timeout")]
    ResponseTimeout,

    /// A group's master address is not in its member list.
    #[error("master {master} is not a member of group {group}")]
    MasterNotMember { group: String, master: SocketAddr },

    /// The group's policy cannot operate without a master device.
    #[error("policy {policy} requires a master for group {group}")]
    MasterRequired { group: String, policy: SyncPolicy },

    /// A group must have at least one member.
    #[error("group {0} has no members")]
    EmptyGroup(String),

    /// A member address appears more than once in a group definition.
    #[error("duplicate member {member} in group {group}")]
    DuplicateMember { group: String, member: SocketAddr },

    /// The specified group does not exist.
    #[error("group not found {0}")]
    GroupNotFound(Uuid),
}

impl Error {
    /// Create a new discovery socket error
    pub fn discovery_socket(action: &str, err: std::io::Error) -> Self {
        Error::DiscoverySocket {
            action: action.to_string(),
            err,
        }
    }

    /// Create a new connect error
    pub fn connect(addr: SocketAddr, err: std::io::Error) -> Self {
        Error::Connect { addr, err }
    }

    /// Create a new device error
    pub fn device(code: i64, message: &str) -> Self {
        Error::Device {
            code,
            message: message.to_string(),
        }
    }

    /// Create a new master-not-member error
    pub fn master_not_member(group: &str, master: SocketAddr) -> Self {
        Error::MasterNotMember {
            group: group.to_string(),
            master,
        }
    }
}

/// Hacky implementation of PartialEq for testing
#[cfg(test)]
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}
