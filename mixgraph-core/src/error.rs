use std::fmt;

use mixgraph_audio::BackendError;
use mixgraph_types::{NodeId, MAX_CHANNEL_COUNT, MIN_CHANNEL_COUNT};

/// Errors raised by tree mutations. Validation variants are always returned
/// before any remote call is issued.
#[derive(Debug)]
pub enum MixError {
    /// The node is not a child of the container it was addressed through.
    NotInParent { node: NodeId, parent: NodeId },
    /// Inserting the node would make it its own ancestor.
    Cycle { node: NodeId, container: NodeId },
    InvalidChannelCount(u32),
    InvalidIndex { index: usize, len: usize },
    UnknownNode(String),
    /// The operation does not apply to this kind of node.
    WrongKind { node: NodeId, expected: &'static str },
    /// The owner already has a parameter with this name.
    DuplicateParameter { owner: NodeId, name: String },
    NotBooted,
    AlreadyBooted,
    Backend(BackendError),
    Json(serde_json::Error),
    Persistence(String),
    Io(std::io::Error),
}

impl fmt::Display for MixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MixError::NotInParent { node, parent } => write!(f, "{} is not a child of {}", node, parent),
            MixError::Cycle { node, container } => {
                write!(f, "cannot insert {} into its own descendant {}", node, container)
            }
            MixError::InvalidChannelCount(n) => write!(
                f,
                "channel count {} outside {}..={}",
                n, MIN_CHANNEL_COUNT, MAX_CHANNEL_COUNT
            ),
            MixError::InvalidIndex { index, len } => write!(f, "index {} out of range for length {}", index, len),
            MixError::UnknownNode(what) => write!(f, "unknown node {}", what),
            MixError::WrongKind { node, expected } => write!(f, "{} is not a {}", node, expected),
            MixError::DuplicateParameter { owner, name } => write!(f, "{} already has a parameter {:?}", owner, name),
            MixError::NotBooted => write!(f, "application is not booted"),
            MixError::AlreadyBooted => write!(f, "application is already booted"),
            MixError::Backend(e) => write!(f, "backend error: {}", e),
            MixError::Json(e) => write!(f, "JSON error: {}", e),
            MixError::Persistence(msg) => write!(f, "persistence error: {}", msg),
            MixError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for MixError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MixError::Backend(e) => Some(e),
            MixError::Json(e) => Some(e),
            MixError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BackendError> for MixError {
    fn from(e: BackendError) -> Self {
        MixError::Backend(e)
    }
}

impl From<serde_json::Error> for MixError {
    fn from(e: serde_json::Error) -> Self {
        MixError::Json(e)
    }
}

impl From<std::io::Error> for MixError {
    fn from(e: std::io::Error) -> Self {
        MixError::Io(e)
    }
}

pub type MixResult<T = ()> = Result<T, MixError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_nodes() {
        let err = MixError::NotInParent { node: NodeId::new(4), parent: NodeId::new(2) };
        assert_eq!(err.to_string(), "#4 is not a child of #2");
        assert_eq!(MixError::InvalidChannelCount(9).to_string(), "channel count 9 outside 1..=8");
        let duplicate = MixError::DuplicateParameter { owner: NodeId::new(3), name: "gain".into() };
        assert_eq!(duplicate.to_string(), "#3 already has a parameter \"gain\"");
    }

    #[test]
    fn backend_errors_convert() {
        let err: MixError = BackendError("socket closed".into()).into();
        assert!(matches!(err, MixError::Backend(_)));
        assert!(std::error::Error::source(&err).is_some());
    }
}
