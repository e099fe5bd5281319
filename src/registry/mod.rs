//! # Registry Infrastructure
//!
//! The command registry maps command names to handlers. Business handlers are
//! external to this crate and plug in through [`TypedCommandHandler`].

pub mod command_router;

pub use command_router::{
    parse_json_payload, CommandContext, CommandError, CommandHandler, CommandRouter,
    RouteOutcome, TypedCommandHandler,
};
