use serde::{Deserialize, Serialize};

/// Acknowledgement for a deleted subscription item or invoice item.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deleted {
    pub id: String,
    pub deleted: bool,
}

impl Deleted {
    pub(crate) fn of(id: impl ToString, deleted: bool) -> Self {
        Self {
            id: id.to_string(),
            deleted,
        }
    }
}
