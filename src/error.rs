use thiserror::Error;

/// Error type for fetch and mutation operations.
///
/// Errors are clonable so they can live inside cache entries and published
/// store states; user fetchers convert their transport errors into one of
/// these variants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Mutation failed: {0}")]
    Mutation(String),
}

impl QueryError {
    /// Creates a fetch error from any displayable cause.
    pub fn fetch(cause: impl ToString) -> Self {
        Self::Fetch(cause.to_string())
    }

    /// Creates a network error from any displayable cause.
    pub fn network(cause: impl ToString) -> Self {
        Self::Network(cause.to_string())
    }

    /// Creates a mutation error from any displayable cause.
    pub fn mutation(cause: impl ToString) -> Self {
        Self::Mutation(cause.to_string())
    }
}
