//! Prefixed opaque identifiers (`a-`, `t-`, `esc-`, ...).

use uuid::Uuid;

/// Generate a new identifier with the given prefix, e.g. `new_id("t")`
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}
