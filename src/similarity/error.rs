use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimilarityError {
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("profile {profile_id} has no embedding in event {event_id}, complete your profile first")]
    MissingEmbedding {
        event_id: String,
        profile_id: String,
    },
    #[error("read from profile store failed: {0}")]
    UpstreamRead(#[source] anyhow::Error),
    #[error("write to similarity store failed: {0}")]
    UpstreamWrite(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SimilarityError>;
