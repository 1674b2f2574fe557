//! Single source of truth for event names: the unsolicited engine events the
//! bridge understands, and the agent events emitted to a UI.

// Engine → bridge
pub const SCENE_GRAPH: &str = "scene_graph";
pub const SCRIPT_LIBRARY: &str = "script_library";
pub const ENGINE_LOG: &str = "engine_log";

// Agent → UI
pub const CHAT_TOKEN: &str = "chat:token";
pub const CHAT_TOOL_CALL: &str = "chat:tool_call";
pub const CHAT_TOOL_RESULT: &str = "chat:tool_result";
pub const CHAT_STATE: &str = "chat:state";
pub const CHAT_APPROVAL: &str = "chat:approval";
pub const CHAT_COMPLETE: &str = "chat:complete";
pub const CHAT_ERROR: &str = "chat:error";

/// Every agent event name, for hosts that forward events by name.
pub const CHAT_EVENTS: &[&str] = &[
    CHAT_TOKEN,
    CHAT_TOOL_CALL,
    CHAT_TOOL_RESULT,
    CHAT_STATE,
    CHAT_APPROVAL,
    CHAT_COMPLETE,
    CHAT_ERROR,
];
