//! Command API
//!
//! HTTP front end of the router. Handlers parse request bodies into
//! commands, hand them to the [`Bridge`](crate::bridge::Bridge) and reply
//! immediately; they never wait on the broker.

pub mod command;
mod server;


pub use command::{Batch, Command, CommandError};
pub use server::{dispatch, ApiServer, ApiState, MAX_BODY_BYTES};
