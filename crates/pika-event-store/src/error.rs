use nostr::EventId;

/// Why a message was kept out of the store or out of a derived view.
///
/// None of these are fatal: each one describes the fate of a single message and
/// ingestion carries on with the next.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Id hash or signature did not check out. Never retried.
    #[error("signature verification failed for {0}")]
    VerificationFailed(EventId),
    /// The id is tombstoned. Callers should treat this like a duplicate.
    #[error("message {0} was removed")]
    AlreadyRemoved(EventId),
    /// Unparsable input or malformed addressing tags.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    /// A direct message between two other identities.
    #[error("message is not addressed to the local identity")]
    NotMyMessage,
    #[error("failed to decrypt {id}: {reason}")]
    DecryptionFailed { id: EventId, reason: String },
}

impl Error {
    /// Expected outcomes that should not be reported as failures.
    pub fn is_benign(&self) -> bool {
        matches!(self, Error::AlreadyRemoved(_) | Error::NotMyMessage)
    }
}
