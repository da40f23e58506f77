//! Core ID types for the scene model.

use serde::{Deserialize, Serialize};

/// Unique identifier for a view (one input image).
///
/// Ids are assigned by the caller when views are registered and serve as
/// lightweight handles for cross-referencing without Arc/Rc, which keeps
/// ownership simple and avoids cyclic references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ViewId(pub u32);

impl std::fmt::Display for ViewId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "V{}", self.0)
    }
}

/// Unique identifier for a camera intrinsic. Several views may share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IntrinsicId(pub u32);

impl std::fmt::Display for IntrinsicId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "K{}", self.0)
    }
}

/// Unique identifier for a camera pose. One pose per reconstructed view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoseId(pub u32);

impl std::fmt::Display for PoseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Unique identifier for a track, and for the landmark it may become.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackId(pub u32);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_equality() {
        assert_eq!(ViewId(42), ViewId(42));
        assert_ne!(ViewId(42), ViewId(43));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", ViewId(3)), "V3");
        assert_eq!(format!("{}", TrackId(123)), "T123");
    }

    #[test]
    fn test_id_as_map_key() {
        use std::collections::HashMap;

        let mut map: HashMap<ViewId, &str> = HashMap::new();
        map.insert(ViewId(1), "first");
        assert_eq!(map.get(&ViewId(1)), Some(&"first"));
        assert_eq!(map.get(&ViewId(2)), None);
    }
}
