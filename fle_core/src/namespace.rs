use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fle_schema::{Message, NamespaceSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::error::SessionError;
use crate::session::{decode_value, SessionShared};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceState {
    Uninitialized,
    Ready,
    Destroyed,
}

/// Result of one evaluated program.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalOutcome {
    pub score: f64,
    pub goal: f64,
    pub output: String,
}

impl EvalOutcome {
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.output.lines()
    }
}

#[derive(Debug, Deserialize)]
struct EvalReply {
    #[serde(default)]
    output: String,
    #[serde(default)]
    bindings: BTreeMap<String, JsonValue>,
    #[serde(default)]
    score: f64,
    #[serde(default)]
    goal: f64,
}

#[derive(Debug, Deserialize)]
struct ScoreReply {
    #[serde(default)]
    score: f64,
    #[serde(default)]
    goal: f64,
}

/// Per-agent evaluation scope.
///
/// Bindings live in the simulation and are mirrored here after every
/// successful evaluation. A failed evaluation leaves the mirror untouched and
/// the remote scope is restored from it, so failures never leak partial
/// assignments.
pub struct Namespace {
    index: usize,
    shared: Arc<SessionShared>,
    state: NamespaceState,
    bindings: BTreeMap<String, JsonValue>,
    evaluations: u64,
    issued: u64,
    messages: Vec<Message>,
    resync_pending: bool,
}

impl Namespace {
    pub(crate) fn new(index: usize, shared: Arc<SessionShared>) -> Self {
        Self {
            index,
            shared,
            state: NamespaceState::Uninitialized,
            bindings: BTreeMap::new(),
            evaluations: 0,
            issued: 0,
            messages: Vec::new(),
            resync_pending: false,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// One-based index of the agent's character in the simulation.
    pub fn player_index(&self) -> usize {
        self.index + 1
    }

    pub fn state(&self) -> NamespaceState {
        self.state
    }

    pub fn bindings(&self) -> &BTreeMap<String, JsonValue> {
        &self.bindings
    }

    pub fn binding(&self, name: &str) -> Option<&JsonValue> {
        self.bindings.get(name)
    }

    /// Successful evaluations since the last reset.
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub(crate) fn call(
        &self,
        procedure: &str,
        args: Vec<JsonValue>,
        timeout: Duration,
    ) -> Result<JsonValue, SessionError> {
        if self.state == NamespaceState::Destroyed {
            return Err(SessionError::NamespaceUnavailable(self.index));
        }
        self.shared.call(procedure, args, Some(self.index), timeout)
    }

    pub(crate) fn command_timeout(&self) -> Duration {
        self.shared.config.command_timeout()
    }

    pub(crate) fn shared(&self) -> &SessionShared {
        &self.shared
    }

    fn ensure_ready(&self) -> Result<(), SessionError> {
        match self.state {
            NamespaceState::Ready => Ok(()),
            _ => Err(SessionError::NamespaceUnavailable(self.index)),
        }
    }

    /// Clear the agent's bindings and evaluation counter. World state is not
    /// touched.
    pub fn reset(&mut self, timeout: Duration) -> Result<(), SessionError> {
        self.call("namespace_reset", vec![json!(self.player_index())], timeout)?;
        self.bindings.clear();
        self.evaluations = 0;
        self.resync_pending = false;
        self.state = NamespaceState::Ready;
        tracing::debug!(target: "fle::namespace", agent = self.index, "namespace.reset");
        Ok(())
    }

    pub fn eval(&mut self, expression: &str, timeout: Duration) -> Result<EvalOutcome, SessionError> {
        self.ensure_ready()?;
        if self.resync_pending {
            self.push_bindings(self.command_timeout())?;
        }

        self.issued += 1;
        let seq = self.issued;
        let args = vec![json!(self.player_index()), json!(seq), json!(expression)];
        match self.call("eval", args, timeout) {
            Ok(value) => {
                let reply: EvalReply = decode_value("eval", value)?;
                self.bindings = reply.bindings;
                self.evaluations += 1;
                Ok(EvalOutcome {
                    score: reply.score,
                    goal: reply.goal,
                    output: reply.output,
                })
            }
            Err(err) if err.is_timeout() => {
                tracing::warn!(target: "fle::namespace", agent = self.index, seq, "namespace.eval_timeout");
                self.abort(seq);
                Err(err)
            }
            // The simulation rolls its scope back when the program raises.
            Err(err @ SessionError::Runtime { .. }) => Err(err),
            Err(err) => {
                self.resync_pending = true;
                Err(err)
            }
        }
    }

    /// Tell the simulation to discard evaluation `seq` and put the mirrored
    /// bindings back.
    fn abort(&mut self, seq: u64) {
        let timeout = self.command_timeout();
        let aborted = self.call(
            "abort_eval",
            vec![json!(self.player_index()), json!(seq)],
            timeout,
        );
        if let Err(err) = aborted.and_then(|_| self.push_bindings(timeout)) {
            tracing::warn!(
                target: "fle::namespace",
                agent = self.index,
                seq,
                error = %err,
                "namespace.restore_failed"
            );
            self.resync_pending = true;
        }
    }

    fn push_bindings(&mut self, timeout: Duration) -> Result<(), SessionError> {
        let bindings = JsonValue::Object(self.bindings.clone().into_iter().collect());
        self.call(
            "namespace_load",
            vec![json!(self.player_index()), bindings],
            timeout,
        )?;
        self.resync_pending = false;
        Ok(())
    }

    pub fn save(&self) -> NamespaceSnapshot {
        NamespaceSnapshot {
            bindings: self.bindings.clone(),
            evaluations: self.evaluations,
        }
    }

    /// Replace the agent's scope with `snapshot`.
    pub fn load(&mut self, snapshot: &NamespaceSnapshot, timeout: Duration) -> Result<(), SessionError> {
        let previous = std::mem::replace(&mut self.bindings, snapshot.bindings.clone());
        if let Err(err) = self.push_bindings(timeout) {
            self.bindings = previous;
            return Err(err);
        }
        self.evaluations = snapshot.evaluations;
        self.state = NamespaceState::Ready;
        Ok(())
    }

    pub fn load_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    pub(crate) fn push_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Current `(score, goal)` of the agent's force.
    pub fn score(&self, timeout: Duration) -> Result<(f64, f64), SessionError> {
        let value = self.call("score", vec![json!(self.player_index())], timeout)?;
        let reply: ScoreReply = decode_value("score", value)?;
        Ok((reply.score, reply.goal))
    }

    pub(crate) fn destroy(&mut self) {
        self.state = NamespaceState::Destroyed;
        self.bindings.clear();
    }
}
