use std::collections::HashMap;

use uuid::Uuid;

/// External profile lookup. Conversations without an explicit title are
/// labeled with the other participant's display name; the service must
/// tolerate lookup failure and fall back to the raw identifier.
pub trait ProfileDirectory: Send + Sync {
    fn display_name(&self, user_id: Uuid) -> anyhow::Result<Option<String>>;
}

/// Directory that knows nobody. Every title falls back to raw identifiers.
pub struct NullDirectory;

impl ProfileDirectory for NullDirectory {
    fn display_name(&self, _user_id: Uuid) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// Fixed in-memory directory, used by tests and local demos.
#[derive(Default)]
pub struct StaticDirectory {
    names: HashMap<Uuid, String>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, user_id: Uuid, name: impl Into<String>) {
        self.names.insert(user_id, name.into());
    }
}

impl ProfileDirectory for StaticDirectory {
    fn display_name(&self, user_id: Uuid) -> anyhow::Result<Option<String>> {
        Ok(self.names.get(&user_id).cloned())
    }
}
