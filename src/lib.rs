//! An agent-side implementation of HAProxy's Stream Processing Offload
//! Protocol (SPOP): the wire protocol spoken between HAProxy and an
//! external "SPOE" agent that inspects or mutates traffic out of band.
//!
//! [`Agent`] binds a listener and drives the protocol state machine for
//! every connection HAProxy opens, calling a user-supplied [`Handler`] for
//! each NOTIFY message and returning the [`Action`]s it produces in the
//! matching ACK.
//!
//! # Examples
//!
//! ```rust,no_run
//! use spop_agent::{Agent, Config};
//! use spop_agent::actions::{Action, Scope};
//! use spop_agent::codec::Value;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let handler = std::sync::Arc::new(|messages: &mut spop_agent::notify::MessageIterator| {
//!         let mut actions = Vec::new();
//!         for message in messages {
//!             let message = message.map_err(|e| spop_agent::HandlerError::Failed(e.to_string()))?;
//!             actions.push(Action::SetVar {
//!                 name: format!("txn.{}", message.name),
//!                 scope: Scope::Transaction,
//!                 value: Value::Bool(true),
//!             });
//!         }
//!         Ok(actions)
//!     });
//!
//!     let agent = Agent::with_config(handler, Config::default());
//!     agent.listen_and_serve_tcp("127.0.0.1:12345").await
//! }
//! ```

pub mod actions;
pub mod agent;
pub mod codec;
pub mod connection;
pub mod disconnect;
pub mod driver;
pub mod engine;
pub mod errors;
pub mod frame;
pub mod hello;
pub mod notify;
pub mod pool;


pub use actions::Action;
pub use agent::{Agent, Config};
pub use driver::Handler;
pub use errors::{HandlerError, ProtocolError, StatusCode};
pub use frame::Frame;
