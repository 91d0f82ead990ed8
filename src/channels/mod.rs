//! Channel kinds, their action tables and reasoning templates.

pub mod kind;
pub mod templates;

pub use kind::{
    ActionKind, ActionSpec, Category, Channel, ChannelKind, ContentSource, plan_name, priority_key,
};
pub use templates::Templates;
