use thiserror::Error;

/// Errors surfaced by [`crate::ChatService`]. Conflicts on idempotent inserts
/// never appear here: they are absorbed by the storage layer as no-ops.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// The caller is not a member of the channel it tried to read or write.
    #[error("not a member of this channel")]
    AccessDenied,

    /// The caller is not the author of the message it tried to modify.
    #[error("only the author can modify this message")]
    Forbidden,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Storage failed; not retried here.
    #[error("storage failure during {op}: {source}")]
    Storage {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;

/// Attach the failing operation's name to a storage error.
pub(crate) trait StorageContext<T> {
    fn during(self, op: &'static str) -> ChatResult<T>;
}

impl<T> StorageContext<T> for anyhow::Result<T> {
    fn during(self, op: &'static str) -> ChatResult<T> {
        self.map_err(|source| ChatError::Storage { op, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_names_operation() {
        let res: anyhow::Result<()> = Err(anyhow::anyhow!("disk I/O error"));
        let err = res.during("create_message").unwrap_err();
        assert_eq!(
            err.to_string(),
            "storage failure during create_message: disk I/O error"
        );
    }
}
