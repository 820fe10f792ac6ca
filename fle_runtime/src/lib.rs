//! Host-side helpers for driving the simulation that need no live connection:
//! reply decoding, remote-console framing and the procedure registry.

pub mod lua_text;
pub mod procedures;
pub mod rcon;

pub use lua_text::{
    decode, decode_reply, normalize_message, quote_lua, to_lua, DecodeError, DecodeErrorKind,
    FailureKind, RemoteFailure, Reply,
};
pub use procedures::{
    checksum, invoke_command, manifest_schema, ManifestValidationError, Procedure,
    ProcedureError, ProcedureKind, ProcedureManifest, ProcedureRegistry, BOOTSTRAP_LIBRARY,
    CHECKSUM_QUERY,
};
pub use rcon::{decode_packet, encode_packet, Packet, RconError};
