use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fle_runtime::{decode_reply, Procedure, ProcedureRegistry, Reply, CHECKSUM_QUERY};
use serde_json::Value as JsonValue;

use crate::error::SessionError;
use crate::transport::Channel;

/// Tracks which procedure bodies the simulation already holds.
///
/// A body is transmitted at most once while caching is enabled unless the
/// cache is invalidated; with caching disabled every load resends everything.
pub struct ProcedureCache {
    registry: Arc<ProcedureRegistry>,
    caching: bool,
    loaded: HashMap<String, String>,
    transmissions: u64,
}

impl ProcedureCache {
    pub fn new(registry: Arc<ProcedureRegistry>, caching_enabled: bool) -> Self {
        Self {
            registry,
            caching: caching_enabled,
            loaded: HashMap::new(),
            transmissions: 0,
        }
    }

    pub fn registry(&self) -> &ProcedureRegistry {
        &self.registry
    }

    pub fn caching_enabled(&self) -> bool {
        self.caching
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.contains_key(name)
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    /// Procedure bodies sent over the channel since construction.
    pub fn transmissions(&self) -> u64 {
        self.transmissions
    }

    /// Mark procedures whose checksum the simulation already records as
    /// loaded. Only consulted while caching is enabled; a failed query leaves
    /// the cache untouched.
    pub fn adopt_remote_checksums(&mut self, channel: &Channel, timeout: Duration) -> usize {
        if !self.caching {
            return 0;
        }
        let remote = match channel.send(CHECKSUM_QUERY, timeout) {
            Ok(reply) => match decode_reply(&reply) {
                Ok(Reply::Value(JsonValue::Object(map))) => map,
                Ok(_) => return 0,
                Err(err) => {
                    tracing::warn!(target: "fle::procedures", error = %err, "procedures.checksum_query_failed");
                    return 0;
                }
            },
            Err(err) => {
                tracing::warn!(target: "fle::procedures", error = %err, "procedures.checksum_query_failed");
                return 0;
            }
        };

        let mut adopted = 0;
        for procedure in self.registry.iter() {
            let matches = remote
                .get(&procedure.name)
                .and_then(JsonValue::as_str)
                .is_some_and(|checksum| checksum == procedure.checksum);
            if matches {
                self.loaded
                    .insert(procedure.name.clone(), procedure.checksum.clone());
                adopted += 1;
            }
        }
        tracing::debug!(target: "fle::procedures", adopted, "procedures.checksums_adopted");
        adopted
    }

    /// Send every procedure the simulation does not hold yet, libraries first
    /// in their initialisation order. Returns the number of bodies sent.
    pub fn load_into(&mut self, channel: &Channel, timeout: Duration) -> Result<usize, SessionError> {
        let registry = Arc::clone(&self.registry);
        let mut sent = 0;
        let mut skipped = 0;
        for procedure in registry.iter() {
            if self.caching && self.loaded.get(&procedure.name) == Some(&procedure.checksum) {
                skipped += 1;
                continue;
            }
            self.transmit(channel, procedure, timeout)?;
            sent += 1;
        }
        tracing::info!(
            target: "fle::procedures",
            sent,
            skipped,
            caching = self.caching,
            "procedures.loaded"
        );
        Ok(sent)
    }

    /// Resend a single procedure regardless of cache state.
    pub fn load_procedure(
        &mut self,
        channel: &Channel,
        name: &str,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let registry = Arc::clone(&self.registry);
        let procedure = registry
            .get(name)
            .ok_or_else(|| SessionError::ProcedureLoad {
                procedure: name.to_string(),
                message: "not registered".to_string(),
            })?;
        self.transmit(channel, procedure, timeout)
    }

    fn transmit(
        &mut self,
        channel: &Channel,
        procedure: &Procedure,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let command = procedure.load_command();
        let reply = channel
            .send(&command, timeout)
            .map_err(|err| SessionError::from_transport(&command, None, err))?;
        self.transmissions += 1;
        match decode_reply(&reply) {
            Ok(Reply::Failure(failure)) => Err(SessionError::ProcedureLoad {
                procedure: procedure.name.clone(),
                message: failure.message,
            }),
            Err(err) => Err(SessionError::ProcedureLoad {
                procedure: procedure.name.clone(),
                message: err.to_string(),
            }),
            Ok(_) => {
                self.loaded
                    .insert(procedure.name.clone(), procedure.checksum.clone());
                Ok(())
            }
        }
    }

    /// Forget every loaded mark; the next load resends all procedures.
    pub fn invalidate(&mut self) {
        self.loaded.clear();
    }

    pub fn disable_caching(&mut self) {
        self.caching = false;
        self.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Transport, TransportError};
    use fle_runtime::{Procedure, ProcedureKind};
    use parking_lot::Mutex;

    /// Accepts procedure bodies and remembers the checksums it was told about.
    #[derive(Clone, Default)]
    struct RecordingTransport {
        commands: Arc<Mutex<Vec<String>>>,
        checksums: Arc<Mutex<Vec<(String, String)>>>,
        fail_on: Option<&'static str>,
    }

    impl Transport for RecordingTransport {
        fn send(&mut self, command: &str, _timeout: Duration) -> Result<String, TransportError> {
            self.commands.lock().push(command.to_string());
            if command == CHECKSUM_QUERY {
                let entries: Vec<String> = self
                    .checksums
                    .lock()
                    .iter()
                    .map(|(name, sum)| format!("[\"{name}\"] = \"{sum}\""))
                    .collect();
                return Ok(format!("{{{}}}", entries.join(", ")));
            }
            if let Some(marker) = self.fail_on {
                if command.contains(marker) {
                    return Ok(format!(
                        "Cannot execute command. Error: [string \"{marker}\"]:1: syntax error"
                    ));
                }
            }
            Ok(String::new())
        }

        fn close(&mut self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    fn registry() -> Arc<ProcedureRegistry> {
        Arc::new(ProcedureRegistry::builtin())
    }

    #[test]
    fn second_load_sends_nothing_when_caching() {
        let channel = Channel::new(Box::new(RecordingTransport::default()));
        let mut cache = ProcedureCache::new(registry(), true);
        let timeout = Duration::from_secs(1);

        let first = cache.load_into(&channel, timeout).unwrap();
        assert_eq!(first, cache.registry().len());
        let sends_after_first = channel.sends();

        assert_eq!(cache.load_into(&channel, timeout).unwrap(), 0);
        assert_eq!(channel.sends(), sends_after_first);
    }

    #[test]
    fn invalidate_forces_full_resend() {
        let channel = Channel::new(Box::new(RecordingTransport::default()));
        let mut cache = ProcedureCache::new(registry(), true);
        let timeout = Duration::from_secs(1);
        cache.load_into(&channel, timeout).unwrap();

        cache.invalidate();
        assert_eq!(cache.loaded_count(), 0);
        assert_eq!(cache.load_into(&channel, timeout).unwrap(), cache.registry().len());
        assert_eq!(cache.transmissions(), 2 * cache.registry().len() as u64);
    }

    #[test]
    fn disabled_caching_always_resends() {
        let channel = Channel::new(Box::new(RecordingTransport::default()));
        let mut cache = ProcedureCache::new(registry(), false);
        let timeout = Duration::from_secs(1);
        let total = cache.registry().len();
        assert_eq!(cache.load_into(&channel, timeout).unwrap(), total);
        assert_eq!(cache.load_into(&channel, timeout).unwrap(), total);
    }

    #[test]
    fn matching_remote_checksums_are_reused() {
        let registry = registry();
        let transport = RecordingTransport::default();
        {
            let mut checksums = transport.checksums.lock();
            for procedure in registry.iter().take(3) {
                checksums.push((procedure.name.clone(), procedure.checksum.clone()));
            }
            checksums.push(("eval".into(), "0000000000000000".into()));
        }
        let channel = Channel::new(Box::new(transport));
        let mut cache = ProcedureCache::new(Arc::clone(&registry), true);
        let timeout = Duration::from_secs(1);

        assert_eq!(cache.adopt_remote_checksums(&channel, timeout), 3);
        assert!(!cache.is_loaded("eval"));
        assert_eq!(cache.load_into(&channel, timeout).unwrap(), registry.len() - 3);
    }

    #[test]
    fn engine_failure_during_load_is_reported() {
        let transport = RecordingTransport {
            fail_on: Some("global.actions.broken"),
            ..RecordingTransport::default()
        };
        let registry = Arc::new(ProcedureRegistry::builtin().with_procedure(Procedure::new(
            "broken",
            ProcedureKind::Tool,
            "global.actions.broken = function(",
        )));
        let channel = Channel::new(Box::new(transport));
        let mut cache = ProcedureCache::new(registry, true);
        let err = cache
            .load_into(&channel, Duration::from_secs(1))
            .expect_err("load should fail");
        match err {
            SessionError::ProcedureLoad { procedure, message } => {
                assert_eq!(procedure, "broken");
                assert_eq!(message, "syntax error");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
