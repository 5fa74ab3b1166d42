//! The sequencing server boundary. Transport itself (HTTP, retries,
//! backoff) is out of scope here; `SyncTransport` only names the contract
//! [`crate::sync`] needs from it.

use crate::error::Result;
use crate::wire::{SyncRequest, SyncResponse};

pub trait SyncTransport {
    fn send(&self, request: &SyncRequest) -> Result<SyncResponse>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    /// In-memory transport for unit/integration tests: hands back a
    /// pre-recorded response for each call, in order.
    pub struct ScriptedTransport {
        responses: RefCell<VecDeque<Result<SyncResponse>>>,
        requests: RefCell<Vec<SyncRequest>>,
    }

    impl ScriptedTransport {
        pub fn new(responses: Vec<Result<SyncResponse>>) -> Self {
            Self {
                responses: RefCell::new(responses.into_iter().collect()),
                requests: RefCell::new(Vec::new()),
            }
        }

        pub fn requests(&self) -> Vec<SyncRequest> {
            self.requests.borrow().clone()
        }
    }

    impl SyncTransport for ScriptedTransport {
        fn send(&self, request: &SyncRequest) -> Result<SyncResponse> {
            self.requests.borrow_mut().push(request.clone());
            self.responses
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(crate::error::SyncError::Transport("no scripted response".into())))
        }
    }
}
