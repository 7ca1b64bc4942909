// src/application/mod.rs
//
// Application Layer
//
// Wires configuration, schema, migrations, pool and repositories into one
// shared state object for the server.

pub mod state;

pub use state::AppState;
