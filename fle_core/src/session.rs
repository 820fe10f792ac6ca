//! Session/instance manager.
//!
//! A [`Session`] owns one channel to the simulation, the procedure cache and
//! one [`Namespace`] per agent. Startup loads the procedures, initialises the
//! world and reads a score back. When that self-check fails, or a startup
//! call finds a procedure missing, the cache is rebuilt with caching disabled
//! and startup runs once more.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver};
use fle_runtime::{
    decode_reply, invoke_command, FailureKind, ProcedureRegistry, RemoteFailure, Reply,
};
use fle_schema::{
    EntityPayload, EntityView, GameState, ItemCounts, Message, Position, ProductionFlow, Recipe,
    ResearchState, GAME_STATE_VERSION,
};
use parking_lot::{Mutex, MutexGuard};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::config::SessionConfig;
use crate::error::{display_command, SessionError};
use crate::hooks::{Hook, HookContext, HookPhase, HookTable};
use crate::namespace::{EvalOutcome, Namespace, NamespaceState};
use crate::pricing::price_list;
use crate::procedure_cache::ProcedureCache;
use crate::profits::{achievements, profits, Achievements, Profits};
use crate::transport::{Channel, RconClient, Transport, TransportError};
use crate::workers::WorkerSet;

const FALLBACK_ADDRESS: &str = "localhost";
const PLAYER_COUNT_PROBE: &str = "/sc rcon.print(#game.players)";
const ELAPSED_TICKS_QUERY: &str = "/sc rcon.print(global.elapsed_ticks or 0)";
const REMOVE_ENEMIES: &str = "/sc global.remove_enemies()";
const TIMEOUT_OUTPUT: &str = "Error: Evaluation timed out";
const UNKNOWN_PROCEDURE: &str = "unknown procedure";

/// State every namespace of a session reaches through an `Arc`: the channel,
/// the procedure cache and the hook tables.
pub(crate) struct SessionShared {
    pub(crate) config: SessionConfig,
    pub(crate) channel: Channel,
    pub(crate) cache: Mutex<ProcedureCache>,
    pub(crate) hooks: Mutex<HookTable>,
    prices: Mutex<Option<ItemCounts>>,
}

impl SessionShared {
    /// Recipe-derived prices, fetched once per session.
    pub(crate) fn price_list(&self, timeout: Duration) -> Result<ItemCounts, SessionError> {
        let mut prices = self.prices.lock();
        if let Some(prices) = prices.as_ref() {
            return Ok(prices.clone());
        }
        let value = self.call("recipes", Vec::new(), None, timeout)?;
        let recipes: Vec<Recipe> = decode_seq("recipes", value)?;
        let derived = price_list(&recipes);
        tracing::debug!(
            target: "fle::session",
            recipes = recipes.len(),
            priced = derived.len(),
            "session.price_list"
        );
        Ok(prices.insert(derived).clone())
    }

    /// Invoke a registered procedure and unwrap its reply envelope.
    pub(crate) fn call(
        &self,
        procedure: &str,
        args: Vec<JsonValue>,
        agent: Option<usize>,
        timeout: Duration,
    ) -> Result<JsonValue, SessionError> {
        self.run_hooks(HookPhase::Pre, procedure, agent, &args, None);

        let command = invoke_command(procedure, &args);
        let reply = self
            .channel
            .send(&command, timeout)
            .map_err(|err| SessionError::from_transport(&command, agent, err))?;
        let value = match decode_reply(&reply).map_err(|source| SessionError::Decode {
            command: display_command(&command),
            source,
        })? {
            Reply::Value(value) => value,
            Reply::Empty => JsonValue::Null,
            Reply::Text(text) => JsonValue::String(text),
            Reply::Failure(failure) => return Err(call_failure(procedure, agent, failure)),
        };

        self.run_hooks(HookPhase::Post, procedure, agent, &args, Some(&value));
        Ok(value)
    }

    pub(crate) fn call_as<T: DeserializeOwned>(
        &self,
        procedure: &str,
        args: Vec<JsonValue>,
        agent: Option<usize>,
        timeout: Duration,
    ) -> Result<T, SessionError> {
        let value = self.call(procedure, args, agent, timeout)?;
        decode_value(procedure, value)
    }

    /// Run a raw console command. Engine failures surface as runtime errors
    /// of the `console` procedure.
    pub(crate) fn command(&self, command: &str) -> Result<Reply, SessionError> {
        let reply = self
            .channel
            .send(command, self.config.command_timeout())
            .map_err(|err| SessionError::from_transport(command, None, err))?;
        match decode_reply(&reply).map_err(|source| SessionError::Decode {
            command: display_command(command),
            source,
        })? {
            Reply::Failure(failure) => Err(SessionError::Runtime {
                agent: None,
                procedure: "console".to_string(),
                message: failure.message,
            }),
            other => Ok(other),
        }
    }

    fn run_hooks(
        &self,
        phase: HookPhase,
        procedure: &str,
        agent: Option<usize>,
        args: &[JsonValue],
        result: Option<&JsonValue>,
    ) {
        // Cloned out so a hook may register further hooks.
        let hooks = self.hooks.lock().hooks(phase, procedure);
        if hooks.is_empty() {
            return;
        }
        let context = HookContext {
            procedure,
            agent,
            args,
            result,
        };
        for hook in &hooks {
            hook(&context);
        }
    }
}

/// Classify a failed invocation. An engine failure means the invocation entry
/// point itself is gone.
fn call_failure(procedure: &str, agent: Option<usize>, failure: RemoteFailure) -> SessionError {
    let missing =
        failure.kind == FailureKind::Engine || failure.message.starts_with(UNKNOWN_PROCEDURE);
    if missing {
        SessionError::MissingProcedure {
            procedure: procedure.to_string(),
            message: failure.message,
        }
    } else {
        SessionError::Runtime {
            agent,
            procedure: procedure.to_string(),
            message: failure.message,
        }
    }
}

pub(crate) fn decode_value<T: DeserializeOwned>(
    procedure: &str,
    value: JsonValue,
) -> Result<T, SessionError> {
    serde_json::from_value(value).map_err(|err| SessionError::UnexpectedReply {
        procedure: procedure.to_string(),
        message: err.to_string(),
    })
}

/// Sequence results arrive as `{}` or `nil` when empty.
pub(crate) fn decode_seq<T: DeserializeOwned>(
    procedure: &str,
    value: JsonValue,
) -> Result<Vec<T>, SessionError> {
    match value {
        JsonValue::Null => Ok(Vec::new()),
        JsonValue::Object(map) if map.is_empty() => Ok(Vec::new()),
        other => decode_value(procedure, other),
    }
}

/// What a snapshot-less reset does to the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetOptions {
    pub all_technologies_researched: bool,
    pub clear_entities: bool,
}

impl ResetOptions {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            all_technologies_researched: config.all_technologies_researched,
            clear_entities: config.clear_entities,
        }
    }
}

/// Evaluation result together with the reward sampled around it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport<T> {
    pub outcome: EvalOutcome,
    pub failed: bool,
    pub reward: T,
}

#[derive(Debug, Clone, Deserialize)]
struct Alert {
    entity_name: String,
    position: Position,
    #[serde(default, deserialize_with = "fle_schema::seq_or_empty")]
    issues: Vec<String>,
}

impl Alert {
    fn render(&self) -> String {
        let issues: Vec<String> = self
            .issues
            .iter()
            .map(|issue| issue.replace('_', " "))
            .collect();
        format!(
            "{} at ({:?}, {:?}): {}",
            self.entity_name,
            self.position.x,
            self.position.y,
            issues.join(", ")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartupAttempt {
    Initial,
    Rebuilt,
}

/// A live connection to one simulation plus the per-agent namespaces.
///
/// Teardown runs in [`Session::cleanup`], which `Drop` also calls. A session
/// that is never dropped skips it: one stored in a `static`, leaked, or alive
/// when the process ends through [`std::process::exit`] keeps its workers and
/// connection until the process dies. Call `cleanup` explicitly on those
/// paths.
pub struct Session {
    id: u32,
    address: String,
    shared: Arc<SessionShared>,
    namespaces: Arc<Vec<Mutex<Namespace>>>,
    workers: WorkerSet,
    speed: Mutex<f64>,
    initial_score: Mutex<f64>,
    closed: AtomicBool,
}

impl Session {
    /// Connect to the configured simulation, falling back to `localhost` on
    /// the same port, and run startup.
    pub fn connect(config: SessionConfig) -> Result<Self, SessionError> {
        config.validate()?;
        let registry = match &config.procedures_path {
            Some(path) => ProcedureRegistry::discover(path)?,
            None => ProcedureRegistry::builtin(),
        };
        Self::connect_with_registry(config, registry)
    }

    pub fn connect_with_registry(
        config: SessionConfig,
        registry: ProcedureRegistry,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let (transport, address) = open_transport(&config)?;
        Self::with_transport(config, registry, transport, address)
    }

    /// Build a session over an already connected transport.
    pub fn with_transport(
        config: SessionConfig,
        registry: ProcedureRegistry,
        transport: Box<dyn Transport>,
        address: impl Into<String>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let cache = ProcedureCache::new(Arc::new(registry), config.cache_procedures);
        let shared = Arc::new(SessionShared {
            channel: Channel::new(transport),
            cache: Mutex::new(cache),
            hooks: Mutex::new(HookTable::default()),
            prices: Mutex::new(None),
            config,
        });
        let namespaces = (0..shared.config.num_agents)
            .map(|index| Mutex::new(Namespace::new(index, Arc::clone(&shared))))
            .collect();

        let session = Session {
            id: rand::thread_rng().gen(),
            address: address.into(),
            shared,
            namespaces: Arc::new(namespaces),
            workers: WorkerSet::default(),
            speed: Mutex::new(1.0),
            initial_score: Mutex::new(0.0),
            closed: AtomicBool::new(false),
        };
        tracing::info!(
            target: "fle::session",
            session = session.id,
            address = %session.address,
            port = session.shared.config.tcp_port,
            agents = session.num_agents(),
            "session.connected"
        );

        session.probe_players()?;
        session.start()?;
        Ok(session)
    }

    fn probe_players(&self) -> Result<(), SessionError> {
        let config = &self.shared.config;
        let reply = self
            .shared
            .channel
            .send(PLAYER_COUNT_PROBE, config.command_timeout())
            .map_err(|source| SessionError::Connection {
                address: self.address.clone(),
                port: config.tcp_port,
                source,
            })?;
        let players = match decode_reply(&reply) {
            Ok(Reply::Value(value)) => value.as_u64(),
            _ => None,
        };
        match players {
            Some(0) => tracing::warn!(
                target: "fle::session",
                session = self.id,
                "session.no_players"
            ),
            Some(players) => {
                tracing::debug!(target: "fle::session", session = self.id, players, "session.probe")
            }
            None => tracing::warn!(
                target: "fle::session",
                session = self.id,
                reply = %reply.trim(),
                "session.probe_unreadable"
            ),
        }
        Ok(())
    }

    /// Load procedures, initialise the world and run the self-check.
    ///
    /// The procedure cache is rebuilt once, with caching disabled, when a
    /// procedure fails to load, when an initialisation call finds a procedure
    /// missing from the simulation, or when the self-check fails or times
    /// out. Any other initialisation failure is returned as is. A failure
    /// after the rebuild is wrapped in [`SessionError::Startup`].
    fn start(&self) -> Result<(), SessionError> {
        let mut attempt = StartupAttempt::Initial;
        loop {
            let failure = match self.initialise() {
                Ok(()) => self.self_check().err().map(|err| {
                    let rebuild = err.is_remote_failure() || err.is_timeout();
                    (err, rebuild)
                }),
                Err(err) => {
                    let rebuild = err.is_missing_procedure();
                    Some((err, rebuild))
                }
            };
            match (failure, attempt) {
                (None, _) => {
                    tracing::info!(
                        target: "fle::session",
                        session = self.id,
                        rebuilt = attempt == StartupAttempt::Rebuilt,
                        "session.ready"
                    );
                    return Ok(());
                }
                (Some((err, true)), StartupAttempt::Initial) => {
                    tracing::warn!(
                        target: "fle::session",
                        session = self.id,
                        error = %err,
                        "session.cache_rebuild"
                    );
                    self.shared.cache.lock().disable_caching();
                    attempt = StartupAttempt::Rebuilt;
                }
                (Some((err, _)), StartupAttempt::Rebuilt) => {
                    return Err(SessionError::Startup(Box::new(err)));
                }
                (Some((err, false)), StartupAttempt::Initial) => return Err(err),
            }
        }
    }

    fn initialise(&self) -> Result<(), SessionError> {
        let shared = &self.shared;
        let timeout = shared.config.command_timeout();
        {
            let mut cache = shared.cache.lock();
            cache.adopt_remote_checksums(&shared.channel, timeout);
            cache.load_into(&shared.channel, timeout)?;
        }
        shared.command(&format!("/sc global.fast = {}", shared.config.fast))?;
        shared.call(
            "create_agent_characters",
            vec![json!(self.num_agents())],
            None,
            timeout,
        )?;
        if shared.config.peaceful {
            shared.command(REMOVE_ENEMIES)?;
        }
        self.reset(None)?;
        shared.call("clear_collision_boxes", Vec::new(), None, timeout)?;
        Ok(())
    }

    fn self_check(&self) -> Result<(), SessionError> {
        let (score, goal) = self.namespace(0)?.score(self.shared.config.command_timeout())?;
        tracing::debug!(target: "fle::session", session = self.id, score, goal, "session.self_check");
        Ok(())
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Address the transport actually connected to.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn num_agents(&self) -> usize {
        self.namespaces.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    /// Lock the namespace of `agent`. Evaluations on one agent are ordered by
    /// this lock.
    pub fn namespace(&self, agent: usize) -> Result<MutexGuard<'_, Namespace>, SessionError> {
        self.ensure_open()?;
        self.namespaces
            .get(agent)
            .map(|slot| slot.lock())
            .ok_or(SessionError::UnknownAgent {
                index: agent,
                num_agents: self.num_agents(),
            })
    }

    /// Score of the first agent sampled after the last reset.
    pub fn initial_score(&self) -> f64 {
        *self.initial_score.lock()
    }

    /// Procedure bodies sent to the simulation so far.
    pub fn procedure_transmissions(&self) -> u64 {
        self.shared.cache.lock().transmissions()
    }

    pub fn caching_enabled(&self) -> bool {
        self.shared.cache.lock().caching_enabled()
    }

    /// Commands sent over the channel so far, procedure loads included.
    pub fn channel_sends(&self) -> u64 {
        self.shared.channel.sends()
    }

    pub fn reset(&self, state: Option<&GameState>) -> Result<(), SessionError> {
        self.reset_with(state, ResetOptions::from_config(&self.shared.config))
    }

    /// Reset the world and every namespace.
    ///
    /// Without a snapshot every agent gets the configured starting inventory.
    /// With one, inventories, entities, research, messages and bindings are
    /// restored from it; the snapshot is checked against the agent count
    /// before anything is sent.
    pub fn reset_with(
        &self,
        state: Option<&GameState>,
        options: ResetOptions,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        let timeout = self.shared.config.command_timeout();

        match state {
            None => {
                let inventories = vec![self.shared.config.inventory.clone(); self.num_agents()];
                self.shared.call(
                    "reset",
                    vec![
                        json!(inventories),
                        json!(options.clear_entities),
                        json!(options.all_technologies_researched),
                    ],
                    None,
                    timeout,
                )?;
                if !options.all_technologies_researched {
                    self.load_research(&ResearchState::empty())?;
                }
                for slot in self.namespaces.iter() {
                    let mut namespace = slot.lock();
                    namespace.reset(timeout)?;
                    namespace.load_messages(Vec::new());
                }
            }
            Some(state) => {
                state.validate(self.num_agents())?;
                let records = state.entities.records()?;

                self.shared.call(
                    "reset",
                    vec![json!(state.inventories), json!(true), json!(false)],
                    None,
                    timeout,
                )?;
                self.shared
                    .call("load_entity_state", vec![JsonValue::Array(records)], None, timeout)?;
                self.load_research(&state.research)?;
                for (index, slot) in self.namespaces.iter().enumerate() {
                    let mut namespace = slot.lock();
                    namespace.load(&state.namespaces[index], timeout)?;
                    namespace.load_messages(
                        state.agent_messages.get(index).cloned().unwrap_or_default(),
                    );
                }
            }
        }

        let score = match self.namespace(0)?.score(timeout) {
            Ok((score, _)) => score,
            Err(err) => {
                tracing::warn!(target: "fle::session", session = self.id, error = %err, "session.initial_score_unavailable");
                0.0
            }
        };
        *self.initial_score.lock() = score;
        tracing::info!(
            target: "fle::session",
            session = self.id,
            restored = state.is_some(),
            initial_score = score,
            "session.reset"
        );
        Ok(())
    }

    fn load_research(&self, research: &ResearchState) -> Result<(), SessionError> {
        let research = serde_json::to_value(research).map_err(|err| {
            SessionError::InvalidState(format!("research state does not serialize: {err}"))
        })?;
        self.shared.call(
            "load_research_state",
            vec![research],
            None,
            self.shared.config.command_timeout(),
        )?;
        Ok(())
    }

    /// Evaluate `expression` for `agent`, folding failures into the outcome:
    /// a score of -1 and the error text as output.
    pub fn eval(&self, expression: &str, agent: usize, timeout: Duration) -> EvalOutcome {
        match self.eval_with_error(expression, agent, timeout) {
            Ok(outcome) => outcome,
            Err(err) => failed_outcome(&err),
        }
    }

    pub fn eval_with_error(
        &self,
        expression: &str,
        agent: usize,
        timeout: Duration,
    ) -> Result<EvalOutcome, SessionError> {
        self.namespace(agent)?.eval(expression, timeout)
    }

    /// Run an evaluation on a worker thread owned by the session. The result
    /// arrives on the returned channel; `cleanup` joins the worker.
    pub fn spawn_eval(
        &self,
        expression: impl Into<String>,
        agent: usize,
        timeout: Duration,
    ) -> Result<Receiver<Result<EvalOutcome, SessionError>>, SessionError> {
        drop(self.namespace(agent)?);
        let namespaces = Arc::clone(&self.namespaces);
        let expression = expression.into();
        let (result_tx, result_rx) = bounded(1);
        self.workers
            .spawn("fle-eval", move || {
                let result = namespaces[agent].lock().eval(&expression, timeout);
                let _ = result_tx.send(result);
            })
            .map_err(SessionError::Worker)?;
        Ok(result_rx)
    }

    pub fn eval_with_profits(
        &self,
        expression: &str,
        agent: usize,
        timeout: Duration,
    ) -> Result<StepReport<Profits>, SessionError> {
        self.step(expression, agent, timeout, |pre, post| {
            profits(pre, post, &self.shared.config.profits)
        })
    }

    pub fn eval_with_achievements(
        &self,
        expression: &str,
        agent: usize,
        timeout: Duration,
    ) -> Result<StepReport<Achievements>, SessionError> {
        self.step(expression, agent, timeout, achievements)
    }

    fn step<T>(
        &self,
        expression: &str,
        agent: usize,
        timeout: Duration,
        reward: impl FnOnce(&ProductionFlow, &ProductionFlow) -> T,
    ) -> Result<StepReport<T>, SessionError> {
        let command_timeout = self.shared.config.command_timeout();
        let pre = self.namespace(agent)?.production_stats(command_timeout)?;
        let (outcome, failed) = match self.eval_with_error(expression, agent, timeout) {
            Ok(outcome) => (outcome, false),
            Err(err) => (failed_outcome(&err), true),
        };
        let post = self.namespace(agent)?.production_stats(command_timeout)?;
        Ok(StepReport {
            outcome,
            failed,
            reward: reward(&pre, &post),
        })
    }

    pub fn get_entities(
        &self,
        agent: usize,
        names: &[&str],
        position: Option<Position>,
        radius: f64,
    ) -> Result<Vec<EntityView>, SessionError> {
        self.namespace(agent)?.get_entities(names, position, radius)
    }

    pub fn production_stats(&self, agent: usize) -> Result<ProductionFlow, SessionError> {
        self.namespace(agent)?
            .production_stats(self.shared.config.command_timeout())
    }

    /// Prices used to value production, derived from the simulation's recipes.
    pub fn price_list(&self) -> Result<ItemCounts, SessionError> {
        self.ensure_open()?;
        self.shared.price_list(self.shared.config.command_timeout())
    }

    /// Alerts raised in the last `seconds`, one line per entity.
    pub fn warnings(&self, seconds: u64) -> Result<Vec<String>, SessionError> {
        self.ensure_open()?;
        let value = self.shared.call(
            "get_alerts",
            vec![json!(seconds)],
            None,
            self.shared.config.command_timeout(),
        )?;
        let alerts: Vec<Alert> = decode_seq("get_alerts", value)?;
        Ok(alerts.iter().map(Alert::render).collect())
    }

    pub fn set_speed(&self, speed: f64) -> Result<(), SessionError> {
        self.ensure_open()?;
        if !(speed.is_finite() && speed > 0.0) {
            return Err(SessionError::InvalidState(format!(
                "game speed must be positive, got {speed}"
            )));
        }
        self.shared.command(&format!("/sc game.speed = {speed}"))?;
        *self.speed.lock() = speed;
        tracing::debug!(target: "fle::session", session = self.id, speed, "session.speed");
        Ok(())
    }

    pub fn speed(&self) -> f64 {
        *self.speed.lock()
    }

    pub fn elapsed_ticks(&self) -> Result<u64, SessionError> {
        self.ensure_open()?;
        match self.shared.command(ELAPSED_TICKS_QUERY)? {
            Reply::Empty => Ok(0),
            Reply::Value(value) => value
                .as_u64()
                .or_else(|| value.as_f64().map(|ticks| ticks.max(0.0) as u64))
                .ok_or_else(|| SessionError::UnexpectedReply {
                    procedure: "elapsed_ticks".to_string(),
                    message: format!("not a tick count: {value}"),
                }),
            Reply::Text(text) => Err(SessionError::UnexpectedReply {
                procedure: "elapsed_ticks".to_string(),
                message: format!("not a tick count: {text}"),
            }),
            Reply::Failure(failure) => Err(SessionError::Runtime {
                agent: None,
                procedure: "elapsed_ticks".to_string(),
                message: failure.message,
            }),
        }
    }

    /// Deliver a message to `recipient`, or to every other agent when no
    /// recipient is given.
    pub fn send_message(
        &self,
        sender: usize,
        recipient: Option<usize>,
        content: impl Into<String>,
    ) -> Result<Message, SessionError> {
        for index in std::iter::once(sender).chain(recipient) {
            if index >= self.num_agents() {
                return Err(SessionError::UnknownAgent {
                    index,
                    num_agents: self.num_agents(),
                });
            }
        }
        let message = Message {
            sender,
            recipient,
            content: content.into(),
            tick: self.elapsed_ticks()?,
        };
        match recipient {
            Some(recipient) => self.namespace(recipient)?.push_message(message.clone()),
            None => {
                for index in (0..self.num_agents()).filter(|index| *index != sender) {
                    self.namespace(index)?.push_message(message.clone());
                }
            }
        }
        Ok(message)
    }

    /// Capture the world and every namespace.
    pub fn game_state(&self) -> Result<GameState, SessionError> {
        self.ensure_open()?;
        let timeout = self.shared.config.command_timeout();

        let mut inventories = Vec::with_capacity(self.num_agents());
        let mut agent_messages = Vec::with_capacity(self.num_agents());
        let mut namespaces = Vec::with_capacity(self.num_agents());
        for index in 0..self.num_agents() {
            let namespace = self.namespace(index)?;
            inventories.push(namespace.inventory(timeout)?);
            agent_messages.push(namespace.messages().to_vec());
            namespaces.push(namespace.save());
        }

        let value = self
            .shared
            .call("save_entity_state", Vec::new(), None, timeout)?;
        let records: Vec<JsonValue> = decode_seq("save_entity_state", value)?;
        let research: ResearchState =
            self.shared
                .call_as("save_research_state", Vec::new(), None, timeout)?;

        Ok(GameState {
            version: GAME_STATE_VERSION,
            inventories,
            entities: EntityPayload::compress(&records)?,
            research,
            agent_messages,
            namespaces,
        })
    }

    pub fn register_hook(&self, phase: HookPhase, procedure: impl Into<String>, hook: Hook) {
        self.shared.hooks.lock().register(phase, procedure, hook);
    }

    pub fn hook_count(&self) -> usize {
        self.shared.hooks.lock().len()
    }

    /// Evaluation workers still running.
    pub fn active_workers(&self) -> usize {
        self.workers.active()
    }

    /// Release the channel, clear hooks and join workers. Safe to call more
    /// than once; also runs on drop.
    pub fn cleanup(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let config = &self.shared.config;
        let drained = self.shared.channel.close(config.drain_timeout());
        self.shared.hooks.lock().clear();
        let stragglers = self.workers.join_all(config.cleanup_join_timeout());
        for slot in self.namespaces.iter() {
            match slot.try_lock_for(config.drain_timeout()) {
                Some(mut namespace) => namespace.destroy(),
                None => tracing::warn!(target: "fle::session", session = self.id, "session.namespace_busy"),
            }
        }
        tracing::info!(
            target: "fle::session",
            session = self.id,
            drained,
            stragglers = stragglers.len(),
            "session.closed"
        );
    }

    pub fn namespace_states(&self) -> Vec<NamespaceState> {
        self.namespaces
            .iter()
            .map(|slot| slot.lock().state())
            .collect()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn failed_outcome(err: &SessionError) -> EvalOutcome {
    let output = if err.is_timeout() {
        TIMEOUT_OUTPUT.to_string()
    } else {
        format!("Error: {}", err.to_string().replace("\\n", "").trim())
    };
    EvalOutcome {
        score: -1.0,
        goal: 0.0,
        output,
    }
}

fn open_transport(config: &SessionConfig) -> Result<(Box<dyn Transport>, String), SessionError> {
    let mut candidates = vec![config.address.as_str()];
    if config.address != FALLBACK_ADDRESS {
        candidates.push(FALLBACK_ADDRESS);
    }

    let mut first_error = None;
    for address in candidates {
        match RconClient::connect(
            address,
            config.tcp_port,
            &config.rcon_password,
            config.connect_timeout(),
        ) {
            Ok(client) => return Ok((Box::new(client), address.to_string())),
            Err(err) => {
                tracing::warn!(
                    target: "fle::session",
                    address,
                    port = config.tcp_port,
                    error = %err,
                    "session.connect_failed"
                );
                first_error.get_or_insert(err);
            }
        }
    }
    Err(SessionError::Connection {
        address: config.address.clone(),
        port: config.tcp_port,
        source: first_error.unwrap_or(TransportError::Closed),
    })
}
