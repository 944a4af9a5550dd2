use serde::{Deserialize, Serialize};

/// A resource's place in the Patient ⊃ Study ⊃ Series ⊃ Instance hierarchy.
/// The forest has a fixed depth of four; there is no deeper or shallower level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ResourceLevel {
    Patient,
    Study,
    Series,
    Instance,
}

impl ResourceLevel {
    /// The level directly above this one, or `None` for `Patient`.
    pub fn parent(&self) -> Option<ResourceLevel> {
        match self {
            ResourceLevel::Patient => None,
            ResourceLevel::Study => Some(ResourceLevel::Patient),
            ResourceLevel::Series => Some(ResourceLevel::Study),
            ResourceLevel::Instance => Some(ResourceLevel::Series),
        }
    }

    /// The level directly below this one, or `None` for `Instance`.
    pub fn child(&self) -> Option<ResourceLevel> {
        match self {
            ResourceLevel::Patient => Some(ResourceLevel::Study),
            ResourceLevel::Study => Some(ResourceLevel::Series),
            ResourceLevel::Series => Some(ResourceLevel::Instance),
            ResourceLevel::Instance => None,
        }
    }

    /// All levels from `Patient` down to `self`, inclusive.
    pub fn ancestry(&self) -> Vec<ResourceLevel> {
        let mut levels = vec![*self];
        let mut cur = *self;
        while let Some(p) = cur.parent() {
            levels.push(p);
            cur = p;
        }
        levels.reverse();
        levels
    }
}

impl std::fmt::Display for ResourceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceLevel::Patient => "Patient",
            ResourceLevel::Study => "Study",
            ResourceLevel::Series => "Series",
            ResourceLevel::Instance => "Instance",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestry_is_root_first() {
        assert_eq!(
            ResourceLevel::Instance.ancestry(),
            vec![
                ResourceLevel::Patient,
                ResourceLevel::Study,
                ResourceLevel::Series,
                ResourceLevel::Instance,
            ]
        );
    }

    #[test]
    fn patient_has_no_parent_instance_has_no_child() {
        assert_eq!(ResourceLevel::Patient.parent(), None);
        assert_eq!(ResourceLevel::Instance.child(), None);
    }

    #[test]
    fn ordering_follows_hierarchy_depth() {
        assert!(ResourceLevel::Patient < ResourceLevel::Study);
        assert!(ResourceLevel::Series < ResourceLevel::Instance);
    }
}
