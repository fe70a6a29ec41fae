//! Built-in tool implementations.
//!
//! Each sub-module implements one (or a small family of) tool(s) that the
//! reasoning engine can invoke. [`register_all`] installs them into a
//! registry.

pub mod dice;
pub mod exec_shell;

use std::sync::Arc;

use crate::config::Config;
use crate::tools::{ToolDescriptor, ToolRegistry};

/// Register every native tool.
pub fn register_all(registry: &ToolRegistry, config: &Config) {
    registry.register(dice::descriptor());
    registry.register(ToolDescriptor::asynchronous(Arc::new(dice::PeriodicDiceRoller)));
    registry.register(exec_shell::descriptor(config));
    registry.register(crate::trigger::timer::descriptor());
}
