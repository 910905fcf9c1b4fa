//! Commit Handles
//!
//! A `CommitHandle` is the only way to answer a request. It carries the slot
//! index the request was read into and the response being built for it.
//! Committing moves the response into the connection's pipeline and marks
//! the slot ready; the engine writes it once every earlier slot is ready too.

use crate::connection::engine::{ConnectionHandle, Shared};
use crate::pipeline::PipelineError;
use crate::protocol::Response;
use std::fmt;
use std::rc::Weak;
use thiserror::Error;

/// Why a commit was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommitError {
    /// This handle was already used
    #[error("response already committed")]
    AlreadyCommitted,

    /// The connection was stopped or has gone away
    #[error("connection is closed")]
    ConnectionClosed,

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Single-use capability to publish the response for one request.
///
/// The handle refers to its connection weakly. It may be moved into any task
/// on the connection's reactor and committed whenever the answer is ready.
pub struct CommitHandle {
    connection: Weak<Shared>,
    index: usize,
    response: Response,
    committed: bool,
}

impl CommitHandle {
    pub(crate) fn new(connection: Weak<Shared>, index: usize, response: Response) -> Self {
        Self {
            connection,
            index,
            response,
            committed: false,
        }
    }

    /// Pipeline slot this handle answers.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    /// The response to fill in before committing.
    pub fn response_mut(&mut self) -> &mut Response {
        &mut self.response
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// The connection, if it is still alive.
    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.connection.upgrade().map(ConnectionHandle::from_shared)
    }

    /// Publishes the response.
    ///
    /// Succeeds at most once. Later calls return
    /// [`CommitError::AlreadyCommitted`] and change nothing. Committing after
    /// the connection was stopped or dropped returns
    /// [`CommitError::ConnectionClosed`] and leaves the response in the
    /// handle.
    pub fn commit(&mut self) -> Result<(), CommitError> {
        if self.committed {
            return Err(CommitError::AlreadyCommitted);
        }
        self.committed = true;

        let connection = self
            .connection
            .upgrade()
            .ok_or(CommitError::ConnectionClosed)?;
        connection.commit(self.index, &mut self.response)
    }
}

impl fmt::Debug for CommitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitHandle")
            .field("index", &self.index)
            .field("committed", &self.committed)
            .field("status", &self.response.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detached_handle_fails_once_then_reports_used() {
        let mut handle = CommitHandle::new(Weak::new(), 0, Response::new(204));
        assert_eq!(handle.index(), 0);
        assert!(!handle.is_committed());
        assert!(handle.connection().is_none());

        assert_eq!(handle.commit(), Err(CommitError::ConnectionClosed));
        assert_eq!(handle.response().status, 204);
        assert_eq!(handle.commit(), Err(CommitError::AlreadyCommitted));
    }

    #[test]
    fn test_response_is_editable_before_commit() {
        let mut handle = CommitHandle::new(Weak::new(), 3, Response::default());
        handle.response_mut().set_status(404);
        assert_eq!(handle.response().reason, "Not Found");
    }
}
