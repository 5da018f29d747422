use thiserror::Error;

use crate::v0;

/// In-band end-of-work sentinel carried in `WorkReply.work_item_index`.
pub const END_OF_WORK: i64 = -1;

/// Core-side view of a `WorkReply`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkAssignment {
    Item(usize),
    /// The allocator has no work left; stop requesting.
    Done,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("work_item_index {0} is negative but not the end-of-work sentinel")]
    InvalidIndex(i64),
    #[error("{field} must be non-empty")]
    EmptyField { field: &'static str },
}

fn non_empty(field: &'static str, value: &str) -> Result<(), ConvertError> {
    if value.trim().is_empty() {
        return Err(ConvertError::EmptyField { field });
    }
    Ok(())
}

impl WorkAssignment {
    pub fn to_wire(self) -> v0::WorkReply {
        let work_item_index = match self {
            WorkAssignment::Item(index) => index as i64,
            WorkAssignment::Done => END_OF_WORK,
        };
        v0::WorkReply { work_item_index }
    }

    pub fn try_from_wire(reply: &v0::WorkReply) -> Result<Self, ConvertError> {
        match reply.work_item_index {
            END_OF_WORK => Ok(WorkAssignment::Done),
            idx if idx >= 0 => Ok(WorkAssignment::Item(idx as usize)),
            idx => Err(ConvertError::InvalidIndex(idx)),
        }
    }
}

/// Validate a request before the master touches allocator state.
pub fn validate_work_request(req: &v0::WorkRequest) -> Result<(), ConvertError> {
    non_empty("node_id", &req.node_id)
}

pub fn validate_register_request(req: &v0::RegisterNodeRequest) -> Result<(), ConvertError> {
    non_empty("node_id", &req.node_id)
}
