//! Voice sub-session tracking inside WebSocket sessions.

pub mod manager;
pub mod parser;

pub use manager::{VoiceSession, VoiceSessionManager, VoiceState};
pub use parser::{ControlEvent, SessionControlParser, Speaker, TranscriptSource};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Live voice managers keyed by parent WebSocket session id, for the
/// control surface.
pub struct VoiceRegistry {
    managers: RwLock<HashMap<String, Arc<VoiceSessionManager>>>,
}

impl VoiceRegistry {
    pub fn new() -> Self {
        Self {
            managers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, ws_session_id: &str, manager: Arc<VoiceSessionManager>) {
        self.managers
            .write()
            .insert(ws_session_id.to_owned(), manager);
    }

    pub fn remove(&self, ws_session_id: &str) {
        self.managers.write().remove(ws_session_id);
    }

    pub fn get(&self, ws_session_id: &str) -> Option<Arc<VoiceSessionManager>> {
        self.managers.read().get(ws_session_id).cloned()
    }

    pub fn list(&self) -> Vec<Arc<VoiceSessionManager>> {
        self.managers.read().values().cloned().collect()
    }
}

impl Default for VoiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
