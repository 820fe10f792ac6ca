use fle_runtime::{DecodeError, ProcedureError};
use fle_schema::StateError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::transport::TransportError;

const COMMAND_DISPLAY_LEN: usize = 120;

/// Failures surfaced to session callers.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not connect to {address}:{port}: {source}")]
    Connection {
        address: String,
        port: u16,
        #[source]
        source: TransportError,
    },
    #[error("timed out running `{command}`{}", agent_suffix(.agent))]
    Timeout {
        command: String,
        agent: Option<usize>,
    },
    #[error("could not decode reply to `{command}`: {source}")]
    Decode {
        command: String,
        #[source]
        source: DecodeError,
    },
    #[error("{procedure} failed{}: {message}", agent_suffix(.agent))]
    Runtime {
        agent: Option<usize>,
        procedure: String,
        message: String,
    },
    /// The simulation does not hold the procedure, or the invocation
    /// machinery itself is missing.
    #[error("{procedure} is not loaded in the simulation: {message}")]
    MissingProcedure { procedure: String, message: String },
    #[error("unexpected reply from {procedure}: {message}")]
    UnexpectedReply { procedure: String, message: String },
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("unknown agent index {index} (session has {num_agents} agents)")]
    UnknownAgent { index: usize, num_agents: usize },
    #[error("namespace {0} is not available (destroyed or not yet reset)")]
    NamespaceUnavailable(usize),
    #[error("failed to load procedure {procedure}: {message}")]
    ProcedureLoad { procedure: String, message: String },
    #[error("session startup failed after cache rebuild: {0}")]
    Startup(#[source] Box<SessionError>),
    #[error("session is closed")]
    Closed,
    #[error("could not start worker thread: {0}")]
    Worker(#[source] std::io::Error),
    #[error("transport error running `{command}`: {source}")]
    Transport {
        command: String,
        #[source]
        source: TransportError,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Procedures(#[from] ProcedureError),
}

fn agent_suffix(agent: &Option<usize>) -> String {
    agent
        .map(|index| format!(" for agent {index}"))
        .unwrap_or_default()
}

impl SessionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Timeout { .. })
    }

    /// Failures the simulation reported while running procedures, as opposed
    /// to the connection itself failing.
    pub fn is_remote_failure(&self) -> bool {
        matches!(
            self,
            SessionError::Runtime { .. }
                | SessionError::Decode { .. }
                | SessionError::ProcedureLoad { .. }
                | SessionError::MissingProcedure { .. }
                | SessionError::UnexpectedReply { .. }
        )
    }

    /// Failures that mean the simulation's procedure set is stale or
    /// incomplete.
    pub fn is_missing_procedure(&self) -> bool {
        matches!(
            self,
            SessionError::ProcedureLoad { .. } | SessionError::MissingProcedure { .. }
        )
    }

    pub(crate) fn from_transport(command: &str, agent: Option<usize>, err: TransportError) -> Self {
        match err {
            TransportError::Timeout(_) => SessionError::Timeout {
                command: display_command(command),
                agent,
            },
            TransportError::Closed => SessionError::Closed,
            source => SessionError::Transport {
                command: display_command(command),
                source,
            },
        }
    }
}

impl From<StateError> for SessionError {
    fn from(err: StateError) -> Self {
        SessionError::InvalidState(err.to_string())
    }
}

/// First line of a command, shortened for error messages and logs.
pub(crate) fn display_command(command: &str) -> String {
    let first_line = command.lines().next().unwrap_or_default();
    if first_line.chars().count() <= COMMAND_DISPLAY_LEN {
        first_line.to_string()
    } else {
        let mut shortened: String = first_line.chars().take(COMMAND_DISPLAY_LEN).collect();
        shortened.push_str("...");
        shortened
    }
}
