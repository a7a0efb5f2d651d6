use super::name::Name;

/// Error returned when a header could not be taken out of [`Headers`](crate::Headers)
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("header {0} is missing")]
    Missing(Name),
    #[error("header {0} is malformed: {1}")]
    Malformed(Name, anyhow::Error),
}

impl HeaderError {
    pub fn malformed_adhoc(name: Name, error: &'static str) -> Self {
        HeaderError::Malformed(name, anyhow::Error::msg(error))
    }

    pub const fn is_missing(&self) -> bool {
        matches!(self, HeaderError::Missing(..))
    }

    /// Name of the affected header
    pub fn name(&self) -> &Name {
        match self {
            HeaderError::Missing(name) | HeaderError::Malformed(name, _) => name,
        }
    }
}
