use arbor_core::Name;

use crate::node::NodeId;
use crate::scheduler::InstanceId;

/// Named notification delivered to latent tasks, e.g. "move finished for request #42".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiMessage {
    pub name: Name,
    pub request_id: Option<u32>,
    pub success: bool,
}

impl AiMessage {
    pub fn new(name: impl Into<Name>) -> Self {
        Self {
            name: name.into(),
            request_id: None,
            success: true,
        }
    }

    pub fn with_request_id(mut self, request_id: u32) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn failed(mut self) -> Self {
        self.success = false;
        self
    }
}

/// A latent task's interest in a message. A wait without request id matches any id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MessageWait {
    pub(crate) instance: InstanceId,
    pub(crate) node: NodeId,
    pub(crate) serial: u64,
    pub(crate) name: Name,
    pub(crate) request_id: Option<u32>,
}

impl MessageWait {
    pub(crate) fn matches(&self, message: &AiMessage) -> bool {
        self.name == message.name
            && (self.request_id.is_none() || self.request_id == message.request_id)
    }
}
