//! Standard component library
//!
//! Collection of built-in components for common operations

mod debug;
mod http;
mod input;
mod script;
mod time;
mod transform;

pub use debug::DebugNode;
pub use http::HttpRequestNode;
pub use input::InputNode;
pub use script::ScriptNode;
pub use time::DelayNode;
pub use transform::{JsonParseNode, JsonStringifyNode};
use latticeruntime::ComponentRegistry;

use std::sync::Arc;

/// Register all standard components with a registry
pub fn register_all(registry: &ComponentRegistry) {
    registry.register(Arc::new(InputNode));
    registry.register(Arc::new(DebugNode));
    registry.register(Arc::new(HttpRequestNode::new()));
    registry.register(Arc::new(JsonParseNode));
    registry.register(Arc::new(JsonStringifyNode));
    registry.register(Arc::new(DelayNode));
    registry.register(Arc::new(ScriptNode::default()));
}

/// Like [`register_all`], with script components run by `interpreter`
pub fn register_with_interpreter(registry: &ComponentRegistry, interpreter: &str) {
    register_all(registry);
    registry.register(Arc::new(ScriptNode::new(interpreter)));
}
