//! Error types for Linkweave

use thiserror::Error;

/// Result type alias using Linkweave's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Linkweave error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Lookup errors (E001-E099)
    #[error("Link '{0}' not found. Run `linkweave links list <type> <id>` to see links for a node.")]
    LinkNotFound(String),

    #[error("Review entry '{0}' not found. Run `linkweave review list` to see pending entries.")]
    ReviewEntryNotFound(String),

    #[error("Rule '{0}' not found. Run `linkweave rules list` to see all rules.")]
    RuleNotFound(String),

    #[error("Node {0} not found. Register it with `linkweave node upsert <file>`.")]
    NodeNotFound(String),

    #[error("Story '{0}' not found. Run `linkweave stories list` to see all stories.")]
    StoryNotFound(String),

    #[error("Rule run '{0}' not found.")]
    RuleRunNotFound(String),

    // Validation errors (E100-E199)
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid status transition for link '{0}': {1} -> {2}")]
    InvalidTransition(String, String, String),

    // Graph state errors (E200-E299)
    #[error("An active link already exists for {0}")]
    DuplicateActiveLink(String),

    // Database errors (E400-E499)
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Narrative errors (E500-E599)
    #[error("Network error: {0}. Check your internet connection.")]
    NetworkError(#[from] reqwest::Error),

    #[error("Narrative generation failed: {0}")]
    NarrativeFailed(String),

    #[error("Narrative generation timed out after {0} seconds")]
    NarrativeTimeout(u64),

    #[error("Rate limited by the narrative service. Retry after {0} seconds.")]
    RateLimited(u64),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Generic errors
    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::LinkNotFound(_) => "E001",
            Self::ReviewEntryNotFound(_) => "E002",
            Self::RuleNotFound(_) => "E003",
            Self::NodeNotFound(_) => "E004",
            Self::StoryNotFound(_) => "E005",
            Self::RuleRunNotFound(_) => "E006",
            Self::InvalidRule(_) => "E100",
            Self::InvalidInput(_) => "E101",
            Self::InvalidTransition(..) => "E102",
            Self::DuplicateActiveLink(_) => "E200",
            Self::DatabaseError(_) => "E400",
            Self::Serialization(_) => "E401",
            Self::NetworkError(_) => "E500",
            Self::NarrativeFailed(_) => "E501",
            Self::NarrativeTimeout(_) => "E502",
            Self::RateLimited(_) => "E503",
            Self::ConfigError(_) => "E600",
            Self::Other(_) | Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::ReviewEntryNotFound(_) => Some("linkweave review list".to_string()),
            Self::RuleNotFound(_) => Some("linkweave rules list".to_string()),
            Self::StoryNotFound(_) => Some("linkweave stories list".to_string()),
            Self::InvalidRule(_) => {
                Some("Check the rule's match logic and strength formula".to_string())
            }
            Self::NetworkError(_) => Some("Check internet connection".to_string()),
            Self::NarrativeFailed(_) | Self::NarrativeTimeout(_) => {
                Some("linkweave config get narrative.endpoint".to_string())
            }
            Self::ConfigError(_) => Some("linkweave config list".to_string()),
            _ => None,
        }
    }

    /// Whether this error is a lookup miss rather than a failure
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::LinkNotFound(_)
                | Self::ReviewEntryNotFound(_)
                | Self::RuleNotFound(_)
                | Self::NodeNotFound(_)
                | Self::StoryNotFound(_)
                | Self::RuleRunNotFound(_)
        )
    }

    /// Whether this error is a SQLite unique-constraint violation
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::DatabaseError(sqlx::Error::Database(db)) => db.is_unique_violation(),
            Self::DuplicateActiveLink(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_grouped() {
        assert_eq!(Error::LinkNotFound("x".into()).code(), "E001");
        assert_eq!(Error::InvalidRule("bad".into()).code(), "E100");
        assert_eq!(Error::DuplicateActiveLink("t".into()).code(), "E200");
        assert_eq!(Error::Other("o".into()).code(), "E9999");
    }

    #[test]
    fn test_not_found_classification() {
        assert!(Error::ReviewEntryNotFound("r".into()).is_not_found());
        assert!(!Error::InvalidInput("i".into()).is_not_found());
        assert!(Error::DuplicateActiveLink("t".into()).is_unique_violation());
    }

    #[test]
    fn test_suggestions() {
        assert_eq!(
            Error::RuleNotFound("r".into()).suggestion(),
            Some("linkweave rules list".to_string())
        );
        assert!(Error::LinkNotFound("l".into()).suggestion().is_none());
    }
}
