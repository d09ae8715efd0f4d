//! Tool-level access control for a backend.

use std::collections::HashSet;

/// Whitelist/blacklist filter applied per (backend, tool).
///
/// Blacklist wins over whitelist; an unset list does not constrain.
/// Applied both on `tools/call` (refuse the call) and on `tools/list`
/// (omit the tool from the returned list).
#[derive(Debug, Clone, Default)]
pub struct AccessFilter {
    pub whitelist: Option<HashSet<String>>,
    pub blacklist: Option<HashSet<String>>,
}

impl AccessFilter {
    pub fn allows(&self, tool: &str) -> bool {
        if let Some(black) = &self.blacklist
            && black.contains(tool)
        {
            return false;
        }
        if let Some(white) = &self.whitelist
            && !white.contains(tool)
        {
            return false;
        }
        true
    }

    pub fn is_unrestricted(&self) -> bool {
        self.whitelist.is_none() && self.blacklist.is_none()
    }
}
