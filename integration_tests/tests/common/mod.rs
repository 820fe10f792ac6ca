//! In-process stand-in for the simulation's remote console.
//!
//! Speaks the real RCON framing and answers the commands a session sends:
//! procedure loads, the checksum query, console commands and
//! `global.invoke` calls. Agent programs use a tiny line language:
//! `name = <literal>`, `print(a, b)`, `error("msg")`, `hang()`,
//! `produce("item", n)`, `harvest("item", n)`, `craft("recipe", n)` and
//! `place("name", x, y)`.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use fle_core::SessionConfig;
use fle_runtime::rcon::{
    decode_packet, Packet, AUTH_FAILED_ID, SERVERDATA_AUTH, SERVERDATA_AUTH_RESPONSE,
    SERVERDATA_RESPONSE_VALUE,
};
use fle_runtime::{decode, to_lua, ProcedureRegistry, BOOTSTRAP_LIBRARY, CHECKSUM_QUERY};
use parking_lot::{Mutex, MutexGuard};
use serde_json::{json, Map as JsonMap, Value as JsonValue};

pub const PASSWORD: &str = "factorio";

const PLAYER_PROBE: &str = "/sc rcon.print(#game.players)";
const TICKS_QUERY: &str = "/sc rcon.print(global.elapsed_ticks or 0)";
const INVOKE_PREFIX: &str = "/sc rcon.print(dump(global.invoke(";
const CHECKSUM_LINE: &str = "global.__procedure_checksums[";

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Observable state of the fake simulation.
pub struct World {
    pub players: u64,
    pub checksums: BTreeMap<String, String>,
    pub loaded: BTreeSet<String>,
    pub loads: Vec<String>,
    pub commands: Vec<String>,
    pub fast: bool,
    pub enemies_removed: bool,
    pub speed: f64,
    pub ticks: u64,
    pub characters: usize,
    pub inventories: BTreeMap<usize, BTreeMap<String, u64>>,
    pub entities: Vec<JsonValue>,
    pub research: JsonValue,
    pub envs: BTreeMap<usize, BTreeMap<String, JsonValue>>,
    pub aborted: BTreeMap<usize, u64>,
    pub production: JsonValue,
    pub recipes: Vec<JsonValue>,
    pub alerts: Vec<JsonValue>,
    pub score: f64,
    pub goal: f64,
    pub fail_score: bool,
    pub fail_reset: bool,
    pub hang: Duration,
}

impl Default for World {
    fn default() -> Self {
        Self {
            players: 1,
            checksums: BTreeMap::new(),
            loaded: BTreeSet::new(),
            loads: Vec::new(),
            commands: Vec::new(),
            fast: false,
            enemies_removed: false,
            speed: 1.0,
            ticks: 0,
            characters: 0,
            inventories: BTreeMap::new(),
            entities: Vec::new(),
            research: json!({}),
            envs: BTreeMap::new(),
            aborted: BTreeMap::new(),
            production: empty_production(),
            recipes: default_recipes(),
            alerts: Vec::new(),
            score: 0.0,
            goal: 100.0,
            fail_score: false,
            fail_reset: false,
            hang: Duration::from_millis(600),
        }
    }
}

fn empty_production() -> JsonValue {
    json!({
        "input": {},
        "output": {},
        "crafted": [],
        "harvested": {}
    })
}

fn default_recipes() -> Vec<JsonValue> {
    vec![
        json!({
            "name": "iron-plate",
            "energy": 3.2,
            "ingredients": [{"name": "iron-ore", "amount": 1}],
            "products": [{"name": "iron-plate", "amount": 1}]
        }),
        json!({
            "name": "iron-gear-wheel",
            "energy": 0.5,
            "ingredients": [{"name": "iron-plate", "amount": 2}],
            "products": [{"name": "iron-gear-wheel", "amount": 1}]
        }),
    ]
}

impl World {
    /// Procedures the simulation claims to hold without actually holding them.
    pub fn stale_checksums(&mut self) {
        for procedure in ProcedureRegistry::builtin().iter() {
            self.checksums
                .insert(procedure.name.clone(), procedure.checksum.clone());
        }
        self.loaded.clear();
    }

    pub fn invocations(&self, procedure: &str) -> usize {
        let needle = format!("{INVOKE_PREFIX}\"{procedure}\"");
        self.commands
            .iter()
            .filter(|command| command.starts_with(&needle))
            .count()
    }

    pub fn inventory(&self, player: usize) -> BTreeMap<String, u64> {
        self.inventories.get(&player).cloned().unwrap_or_default()
    }

    fn handle(&mut self, body: &str) -> (String, Option<Duration>) {
        self.commands.push(body.to_string());
        if body == PLAYER_PROBE {
            return (self.players.to_string(), None);
        }
        if body == CHECKSUM_QUERY {
            return (to_lua(&json!(self.checksums)), None);
        }
        if body == TICKS_QUERY {
            return (self.ticks.to_string(), None);
        }
        if let Some(call) = body.strip_prefix(INVOKE_PREFIX) {
            return self.invoke(call);
        }
        if let Some((name, checksum)) = parse_load(body) {
            self.loads.push(name.clone());
            self.loaded.insert(name.clone());
            self.checksums.insert(name, checksum);
            return (String::new(), None);
        }
        if let Some(flag) = body.strip_prefix("/sc global.fast = ") {
            self.fast = flag.trim() == "true";
            return (String::new(), None);
        }
        if let Some(speed) = body.strip_prefix("/sc game.speed = ") {
            return match speed.trim().parse() {
                Ok(speed) => {
                    self.speed = speed;
                    (String::new(), None)
                }
                Err(_) => (engine_error("console", "malformed number"), None),
            };
        }
        if body == "/sc global.remove_enemies()" {
            if !self.loaded.contains("utils") {
                return (
                    engine_error("console", "attempt to call field 'remove_enemies' (a nil value)"),
                    None,
                );
            }
            self.enemies_removed = true;
            return (String::new(), None);
        }
        (engine_error("console", "unexpected symbol"), None)
    }

    fn invoke(&mut self, call: &str) -> (String, Option<Duration>) {
        if !self.loaded.contains(BOOTSTRAP_LIBRARY) {
            return (
                engine_error("invoke", "attempt to call field 'invoke' (a nil value)"),
                None,
            );
        }
        let parsed = call
            .strip_suffix(")))")
            .and_then(|inner| decode(&format!("{{{inner}}}")).ok());
        let Some(JsonValue::Array(parts)) = parsed else {
            return (engine_error("invoke", "unexpected symbol"), None);
        };
        let name = parts
            .first()
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();
        let args = match parts.get(1) {
            Some(JsonValue::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        if !self.loaded.contains(&name) {
            return (envelope(Err(format!("unknown procedure {name}"))), None);
        }
        let (result, delay) = self.dispatch(&name, &args);
        (envelope(result), delay)
    }

    fn dispatch(&mut self, name: &str, args: &[JsonValue]) -> (Result<JsonValue, String>, Option<Duration>) {
        let arg = |index: usize| args.get(index).cloned().unwrap_or(JsonValue::Null);
        let player = arg(0).as_u64().unwrap_or(0) as usize;
        let result = match name {
            "score" => {
                if self.fail_score {
                    Err("[string \"score\"]:3: attempt to index a nil value".to_string())
                } else {
                    Ok(json!({"score": self.score, "goal": self.goal}))
                }
            }
            "reset" if self.fail_reset => {
                Err("[string \"reset\"]:12: Unknown item name: unobtainium".to_string())
            }
            "reset" => Ok(self.reset(
                &arg(0),
                arg(1).as_bool().unwrap_or(false),
                arg(2).as_bool().unwrap_or(false),
            )),
            "create_agent_characters" => {
                self.characters = arg(0).as_u64().unwrap_or(0) as usize;
                self.players = self.players.max(self.characters as u64);
                Ok(json!(true))
            }
            "clear_collision_boxes" => Ok(json!(true)),
            "namespace_reset" => {
                self.envs.insert(player, BTreeMap::new());
                self.aborted.remove(&player);
                Ok(json!(true))
            }
            "namespace_load" => {
                self.envs.insert(player, object_entries(&arg(1)));
                self.aborted.remove(&player);
                Ok(json!(true))
            }
            "abort_eval" => {
                self.aborted.insert(player, arg(1).as_u64().unwrap_or(0));
                Ok(json!(true))
            }
            "eval" => {
                let source = arg(2).as_str().unwrap_or_default().to_string();
                return self.eval(player, &source);
            }
            "get_entities" => Ok(self.get_entities(&arg(1))),
            "production_stats" => Ok(self.production.clone()),
            "recipes" => Ok(JsonValue::Array(self.recipes.clone())),
            "inventory" => Ok(json!(self.inventory(player))),
            "load_research_state" => {
                self.research = arg(0);
                Ok(json!(true))
            }
            "save_research_state" => Ok(self.research.clone()),
            "load_entity_state" => {
                self.entities = list_entries(&arg(0));
                Ok(json!(self.entities.len()))
            }
            "save_entity_state" => Ok(JsonValue::Array(self.entities.clone())),
            "extract_item" => self.extract_item(player, &arg(1), &arg(2), &arg(3)),
            "sleep" => {
                self.ticks += 30;
                Ok(json!(self.ticks))
            }
            "get_alerts" => Ok(JsonValue::Array(self.alerts.clone())),
            other => Err(format!("{other} is not implemented by the fake simulation")),
        };
        (result, None)
    }

    fn reset(&mut self, inventories: &JsonValue, clear_entities: bool, all_researched: bool) -> JsonValue {
        if clear_entities {
            self.entities.clear();
        }
        for (offset, items) in list_entries(inventories).iter().enumerate() {
            let inventory = object_entries(items)
                .into_iter()
                .filter_map(|(item, count)| count.as_u64().map(|count| (item, count)))
                .filter(|(_, count)| *count > 0)
                .collect();
            self.inventories.insert(offset + 1, inventory);
        }
        self.research = json!({
            "technologies": {
                "automation": {"name": "automation", "researched": all_researched, "level": 1}
            },
            "research_progress": 0,
            "research_queue": [],
            "progress": {}
        });
        self.production = empty_production();
        self.alerts.clear();
        self.ticks = 0;
        self.score = 0.0;
        json!(true)
    }

    fn eval(&mut self, player: usize, source: &str) -> (Result<JsonValue, String>, Option<Duration>) {
        let before = self.envs.get(&player).cloned().unwrap_or_default();
        let mut env = before.clone();
        let mut output = Vec::new();

        for (number, line) in source.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("--") {
                continue;
            }
            match self.run_line(line, &mut env, &mut output) {
                Ok(Step::Continue) => {}
                Ok(Step::Hang) => {
                    // Assignments made before the hang stay applied.
                    self.envs.insert(player, env);
                    return (Err("evaluation interrupted".to_string()), Some(self.hang));
                }
                Err(message) => {
                    self.envs.insert(player, before);
                    return (Err(format!("[string \"eval\"]:{}: {message}", number + 1)), None);
                }
            }
        }

        self.envs.insert(player, env.clone());
        let result = json!({
            "output": output.join("\n"),
            "bindings": env,
            "score": self.score,
            "goal": self.goal,
        });
        (Ok(result), None)
    }

    fn run_line(
        &mut self,
        line: &str,
        env: &mut BTreeMap<String, JsonValue>,
        output: &mut Vec<String>,
    ) -> Result<Step, String> {
        if let Some((target, expression)) = line.split_once('=') {
            let target = target.trim();
            if is_identifier(target) && !target.contains('(') {
                let value = self.evaluate(expression.trim(), env)?;
                env.insert(target.to_string(), value);
                return Ok(Step::Continue);
            }
        }

        let (function, rest) = line
            .split_once('(')
            .ok_or_else(|| format!("syntax error near '{line}'"))?;
        let inner = rest
            .strip_suffix(')')
            .ok_or_else(|| format!("')' expected near '{line}'"))?;
        let args: Vec<JsonValue> = if inner.trim().is_empty() {
            Vec::new()
        } else {
            inner
                .split(',')
                .map(|arg| self.evaluate(arg.trim(), env))
                .collect::<Result<_, _>>()?
        };

        match function.trim() {
            "print" => {
                let rendered: Vec<String> = args.iter().map(render).collect();
                output.push(rendered.join(" "));
            }
            "error" => {
                return Err(args.first().map(render).unwrap_or_else(|| "nil".to_string()));
            }
            "hang" => return Ok(Step::Hang),
            "produce" => {
                let (item, count) = item_and_count(&args)?;
                self.bump("output", &item, count);
                self.score += count;
            }
            "harvest" => {
                let (item, count) = item_and_count(&args)?;
                self.bump("output", &item, count);
                self.bump("harvested", &item, count);
                self.score += count;
            }
            "craft" => {
                let (recipe, count) = item_and_count(&args)?;
                self.craft(&recipe, count)?;
            }
            "place" => {
                let name = args.first().map(render).unwrap_or_default();
                let x = args.get(1).and_then(JsonValue::as_f64).unwrap_or(0.0);
                let y = args.get(2).and_then(JsonValue::as_f64).unwrap_or(0.0);
                self.entities
                    .push(json!({"name": name, "position": {"x": x, "y": y}}));
            }
            other => return Err(format!("attempt to call global '{other}' (a nil value)")),
        }
        Ok(Step::Continue)
    }

    fn evaluate(&self, expression: &str, env: &BTreeMap<String, JsonValue>) -> Result<JsonValue, String> {
        if is_identifier(expression) && !matches!(expression, "true" | "false" | "nil") {
            return Ok(env.get(expression).cloned().unwrap_or(JsonValue::Null));
        }
        decode(expression).map_err(|_| format!("unexpected symbol near '{expression}'"))
    }

    /// Crafts are only recorded once the production library is loaded.
    fn craft(&mut self, name: &str, count: f64) -> Result<(), String> {
        if !self.loaded.contains("production") {
            return Err("attempt to index field 'production' (a nil value)".to_string());
        }
        let recipe = self
            .recipes
            .iter()
            .find(|recipe| recipe.get("name").and_then(JsonValue::as_str) == Some(name))
            .cloned()
            .ok_or_else(|| format!("unknown recipe {name}"))?;
        let lines = |section: &str| -> Vec<(String, f64)> {
            list_entries(&recipe[section])
                .iter()
                .filter_map(|line| {
                    let item = line.get("name")?.as_str()?.to_string();
                    Some((item, line.get("amount")?.as_f64()? * count))
                })
                .collect()
        };
        let (inputs, outputs) = (lines("ingredients"), lines("products"));
        for (item, amount) in &inputs {
            self.bump("input", item, *amount);
        }
        for (item, amount) in &outputs {
            self.bump("output", item, *amount);
        }
        let counts = |lines: Vec<(String, f64)>| -> JsonMap<String, JsonValue> {
            lines.into_iter().map(|(item, amount)| (item, json!(amount))).collect()
        };
        let event = json!({
            "inputs": counts(inputs),
            "outputs": counts(outputs),
            "crafted_count": count
        });
        if let Some(JsonValue::Array(crafted)) = self.production.get_mut("crafted") {
            crafted.push(event);
        }
        Ok(())
    }

    fn bump(&mut self, section: &str, item: &str, count: f64) {
        if let Some(JsonValue::Object(counts)) = self.production.get_mut(section) {
            let current = counts.get(item).and_then(JsonValue::as_f64).unwrap_or(0.0);
            counts.insert(item.to_string(), json!(current + count));
        }
    }

    fn get_entities(&self, names: &JsonValue) -> JsonValue {
        let names: Vec<&str> = match names {
            JsonValue::Array(items) => items.iter().filter_map(JsonValue::as_str).collect(),
            _ => Vec::new(),
        };
        let records = self
            .entities
            .iter()
            .filter(|record| {
                names.is_empty()
                    || record
                        .get("name")
                        .and_then(JsonValue::as_str)
                        .is_some_and(|name| names.contains(&name))
            })
            .cloned()
            .collect();
        JsonValue::Array(records)
    }

    fn extract_item(
        &mut self,
        player: usize,
        item: &JsonValue,
        position: &JsonValue,
        quantity: &JsonValue,
    ) -> Result<JsonValue, String> {
        let item = item.as_str().unwrap_or_default().to_string();
        let x = position.get("x").and_then(JsonValue::as_f64).unwrap_or(f64::NAN);
        let y = position.get("y").and_then(JsonValue::as_f64).unwrap_or(f64::NAN);
        let quantity = quantity.as_u64().unwrap_or(0);

        let holder = self.entities.iter_mut().find(|record| {
            let at = record.get("position");
            at.and_then(|p| p.get("x")).and_then(JsonValue::as_f64) == Some(x)
                && at.and_then(|p| p.get("y")).and_then(JsonValue::as_f64) == Some(y)
                && record
                    .get("inventory")
                    .and_then(|inventory| inventory.get(&item))
                    .and_then(JsonValue::as_u64)
                    .is_some_and(|count| count > 0)
        });
        let Some(holder) = holder else {
            return Err(format!("no entity holding {item} at ({x}, {y})"));
        };
        let Some(slot) = holder
            .get_mut("inventory")
            .and_then(|inventory| inventory.get_mut(&item))
        else {
            return Err(format!("no entity holding {item} at ({x}, {y})"));
        };
        let available = slot.as_u64().unwrap_or(0);
        let moved = available.min(quantity);
        *slot = json!(available - moved);
        *self
            .inventories
            .entry(player)
            .or_default()
            .entry(item)
            .or_insert(0) += moved;
        Ok(json!(moved))
    }
}

enum Step {
    Continue,
    Hang,
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn render(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "nil".to_string(),
        JsonValue::Bool(flag) => flag.to_string(),
        JsonValue::Number(number) => number.to_string(),
        JsonValue::String(text) => text.clone(),
        other => to_lua(other),
    }
}

fn item_and_count(args: &[JsonValue]) -> Result<(String, f64), String> {
    match (args.first().and_then(JsonValue::as_str), args.get(1).and_then(JsonValue::as_f64)) {
        (Some(item), Some(count)) => Ok((item.to_string(), count)),
        _ => Err("bad argument #1 (item and count expected)".to_string()),
    }
}

fn object_entries(value: &JsonValue) -> BTreeMap<String, JsonValue> {
    match value {
        JsonValue::Object(map) => map.clone().into_iter().collect(),
        _ => BTreeMap::new(),
    }
}

fn list_entries(value: &JsonValue) -> Vec<JsonValue> {
    match value {
        JsonValue::Array(items) => items.clone(),
        _ => Vec::new(),
    }
}

fn envelope(result: Result<JsonValue, String>) -> String {
    let mut map = JsonMap::new();
    match result {
        Ok(value) => {
            map.insert("ok".into(), json!(true));
            map.insert("result".into(), value);
        }
        Err(message) => {
            map.insert("ok".into(), json!(false));
            map.insert("error".into(), json!(message));
        }
    }
    to_lua(&JsonValue::Object(map))
}

fn engine_error(chunk: &str, message: &str) -> String {
    format!("Cannot execute command. Error: [string \"{chunk}\"]:1: {message}")
}

/// Procedure name and checksum from the trailer of a load command.
fn parse_load(body: &str) -> Option<(String, String)> {
    if !body.starts_with("/sc ") {
        return None;
    }
    let trailer = body.lines().last()?.strip_prefix(CHECKSUM_LINE)?;
    match decode(&format!("{{[{trailer}}}")).ok()? {
        JsonValue::Object(map) => map
            .into_iter()
            .next()
            .and_then(|(name, checksum)| checksum.as_str().map(|sum| (name, sum.to_string()))),
        _ => None,
    }
}

/// Fake simulation listening on an ephemeral local port.
pub struct FakeSimulation {
    addr: SocketAddr,
    world: Arc<Mutex<World>>,
}

impl FakeSimulation {
    pub fn start() -> Self {
        Self::with_world(|_| {})
    }

    pub fn with_world(setup: impl FnOnce(&mut World)) -> Self {
        init_tracing();
        let mut world = World::default();
        setup(&mut world);
        let world = Arc::new(Mutex::new(world));

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake simulation");
        let addr = listener.local_addr().expect("fake simulation address");
        let shared = Arc::clone(&world);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let world = Arc::clone(&shared);
                thread::spawn(move || serve(stream, world));
            }
        });
        Self { addr, world }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn world(&self) -> MutexGuard<'_, World> {
        self.world.lock()
    }

    /// Session config pointing at this simulation with short timeouts.
    pub fn config(&self, num_agents: usize) -> SessionConfig {
        let mut config = SessionConfig::builtin();
        config.address = "127.0.0.1".to_string();
        config.tcp_port = self.port();
        config.rcon_password = PASSWORD.to_string();
        config.num_agents = num_agents;
        config.inventory = [("iron-plate".to_string(), 50), ("wood".to_string(), 10)]
            .into_iter()
            .collect();
        config.eval_timeout_secs = 5;
        config.command_timeout_secs = 5;
        config.connect_timeout_secs = 2;
        config.cleanup_join_timeout_secs = 2;
        config.drain_timeout_secs = 1;
        config
    }
}

fn serve(mut stream: TcpStream, world: Arc<Mutex<World>>) {
    let mut pending = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let packet = loop {
            match decode_packet(&pending) {
                Ok(Some((packet, used))) => {
                    pending.drain(..used);
                    break packet;
                }
                Ok(None) => {}
                Err(_) => return,
            }
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => return,
                Ok(read) => pending.extend_from_slice(&chunk[..read]),
            }
        };

        let reply = if packet.kind == SERVERDATA_AUTH {
            let id = if packet.body == PASSWORD {
                packet.id
            } else {
                AUTH_FAILED_ID
            };
            Packet::new(id, SERVERDATA_AUTH_RESPONSE, "")
        } else {
            let (body, delay) = world.lock().handle(&packet.body);
            if let Some(delay) = delay {
                thread::sleep(delay);
            }
            Packet::new(packet.id, SERVERDATA_RESPONSE_VALUE, body)
        };
        if stream.write_all(&reply.encode()).is_err() {
            return;
        }
    }
}
