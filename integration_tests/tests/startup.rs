mod common;

use std::net::TcpListener;
use std::time::Duration;

use crossbeam_channel::TryRecvError;

use common::FakeSimulation;
use fle_core::{NamespaceState, Session, SessionError, TransportError};
use fle_runtime::ProcedureRegistry;

#[test]
fn fresh_session_loads_every_procedure_once() {
    let sim = FakeSimulation::start();
    let session = Session::connect(sim.config(2)).expect("session should start");

    let registry = ProcedureRegistry::builtin();
    assert_eq!(session.procedure_transmissions(), registry.len() as u64);
    assert!(session.caching_enabled());
    assert_eq!(session.num_agents(), 2);
    assert_eq!(
        session.namespace_states(),
        vec![NamespaceState::Ready, NamespaceState::Ready]
    );

    let world = sim.world();
    let expected: Vec<String> = registry.iter().map(|p| p.name.clone()).collect();
    assert_eq!(world.loads, expected, "libraries load first, in order");
    assert_eq!(world.characters, 2);
    assert!(world.fast);
    assert!(world.enemies_removed);
    assert_eq!(world.invocations("clear_collision_boxes"), 1);
}

#[test]
fn reconnecting_reuses_procedures_the_simulation_holds() {
    let sim = FakeSimulation::start();
    let first = Session::connect(sim.config(1)).expect("first session");
    first.cleanup();

    let second = Session::connect(sim.config(1)).expect("second session");
    assert_eq!(second.procedure_transmissions(), 0);
    assert!(second.caching_enabled());
    assert_eq!(sim.world().loads.len(), ProcedureRegistry::builtin().len());
}

#[test]
fn stale_cache_is_rebuilt_once_without_caching() {
    let sim = FakeSimulation::with_world(|world| world.stale_checksums());
    let session = Session::connect(sim.config(1)).expect("startup should recover");

    assert!(!session.caching_enabled());
    assert_eq!(
        session.procedure_transmissions(),
        ProcedureRegistry::builtin().len() as u64
    );
    let (score, goal) = session
        .namespace(0)
        .unwrap()
        .score(session.config().command_timeout())
        .unwrap();
    assert_eq!((score, goal), (0.0, 100.0));
}

#[test]
fn persistent_self_check_failure_is_fatal() {
    let sim = FakeSimulation::with_world(|world| world.fail_score = true);
    let err = Session::connect(sim.config(1))
        .err()
        .expect("startup should fail");

    match err {
        SessionError::Startup(inner) => assert!(inner.is_remote_failure(), "{inner}"),
        other => panic!("expected a startup failure, got {other:?}"),
    }
    // Initial load plus exactly one full rebuild.
    assert_eq!(sim.world().loads.len(), 2 * ProcedureRegistry::builtin().len());
}

#[test]
fn initialisation_errors_are_not_retried() {
    let sim = FakeSimulation::with_world(|world| world.fail_reset = true);
    let err = Session::connect(sim.config(1))
        .err()
        .expect("startup should fail");

    match err {
        SessionError::Runtime { procedure, message, .. } => {
            assert_eq!(procedure, "reset");
            assert_eq!(message, "Unknown item name: unobtainium");
        }
        other => panic!("expected the reset failure itself, got {other:?}"),
    }
    assert_eq!(sim.world().loads.len(), ProcedureRegistry::builtin().len());
}

#[test]
fn unreachable_simulation_is_a_connection_error() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let sim = FakeSimulation::start();
    let mut config = sim.config(1);
    config.tcp_port = port;

    match Session::connect(config) {
        Err(SessionError::Connection { port: failed, .. }) => assert_eq!(failed, port),
        Err(other) => panic!("expected a connection error, got {other:?}"),
        Ok(_) => panic!("nothing listens on port {port}"),
    }
}

#[test]
fn refused_password_is_a_connection_error() {
    let sim = FakeSimulation::start();
    let mut config = sim.config(1);
    config.rcon_password = "wrong".to_string();

    match Session::connect(config) {
        Err(SessionError::Connection { source, .. }) => {
            assert!(matches!(source, TransportError::Auth))
        }
        Err(other) => panic!("expected a connection error, got {other:?}"),
        Ok(_) => panic!("authentication should be refused"),
    }
}

#[test]
fn empty_server_only_warns() {
    let sim = FakeSimulation::with_world(|world| world.players = 0);
    let session = Session::connect(sim.config(1)).expect("zero players is not fatal");
    assert!(!session.is_closed());
}

#[test]
fn dropping_a_session_joins_its_workers() {
    let sim = FakeSimulation::with_world(|world| world.hang = Duration::from_millis(300));
    let session = Session::connect(sim.config(1)).unwrap();
    let result = session
        .spawn_eval("hang()", 0, session.config().eval_timeout())
        .unwrap();

    drop(session);
    assert!(
        !matches!(result.try_recv(), Err(TryRecvError::Empty)),
        "worker still running after drop"
    );
}

#[test]
fn cleanup_is_idempotent_and_closes_the_session() {
    let sim = FakeSimulation::start();
    let session = Session::connect(sim.config(1)).unwrap();
    let timeout = session.config().eval_timeout();

    session.cleanup();
    session.cleanup();
    assert!(session.is_closed());
    assert_eq!(session.hook_count(), 0);
    assert!(matches!(
        session.eval_with_error("x = 1", 0, timeout),
        Err(SessionError::Closed)
    ));
    assert_eq!(session.eval("x = 1", 0, timeout).score, -1.0);
}
