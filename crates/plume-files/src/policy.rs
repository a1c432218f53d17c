use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FilePolicy {
    pub max_name_length: usize,
    /// Priority used for `set_content` writes; high enough to preempt
    /// ordinary transfers.
    pub from_bytes_priority: i8,
    pub event_capacity: usize,
}

impl Default for FilePolicy {
    fn default() -> Self {
        Self {
            max_name_length: 255,
            from_bytes_priority: 10,
            event_capacity: 256,
        }
    }
}
