//! P4: the per-chapter scripting mini-language.
//!
//! A script is a list of [`Sequence`]s, each an ordered list of one-line
//! [`Command`]s. [`parser`] compiles lines, [`action`] runs them against a
//! request/response pair.

pub mod action;
pub mod command;
pub mod parser;
pub mod range;
pub mod scope;
pub mod template;

pub use action::{P4Action, P4Result, SequenceReport, UseStateAccess};
pub use command::{Action, Command, Condition, Direction, Part, Pattern, Sequence, Source, Suffix};
pub use parser::parse;
pub use scope::{ScopeLevel, Scopes, VarMap};
