use std::collections::HashMap;

use thiserror::Error;

use crate::names::SubsystemName;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("subsystem `{child}` is already a child of `{parent}`")]
    AlreadyLinked {
        parent: SubsystemName,
        child: SubsystemName,
    },

    #[error("subsystem `{child}` is not a child of `{parent}`")]
    NotLinked {
        parent: SubsystemName,
        child: SubsystemName,
    },
}

/// Parent/child edges between subsystems, keyed by name.
///
/// The graph holds no subsystem ownership; it lives in the registry and both
/// edge directions are updated together.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    children: HashMap<SubsystemName, Vec<SubsystemName>>,
    parents: HashMap<SubsystemName, Vec<SubsystemName>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(
        &mut self,
        parent: &SubsystemName,
        child: &SubsystemName,
    ) -> Result<(), GraphError> {
        let children = self.children.entry(parent.clone()).or_default();
        if children.contains(child) {
            return Err(GraphError::AlreadyLinked {
                parent: parent.clone(),
                child: child.clone(),
            });
        }
        children.push(child.clone());
        self.parents.entry(child.clone()).or_default().push(parent.clone());
        Ok(())
    }

    pub fn remove_edge(
        &mut self,
        parent: &SubsystemName,
        child: &SubsystemName,
    ) -> Result<(), GraphError> {
        let not_linked = || GraphError::NotLinked {
            parent: parent.clone(),
            child: child.clone(),
        };

        let children = self.children.get_mut(parent).ok_or_else(not_linked)?;
        let position = children.iter().position(|c| c == child).ok_or_else(not_linked)?;
        children.remove(position);

        if let Some(parents) = self.parents.get_mut(child) {
            parents.retain(|p| p != parent);
        }
        Ok(())
    }

    pub fn children_of(&self, name: &SubsystemName) -> Vec<SubsystemName> {
        self.children.get(name).cloned().unwrap_or_default()
    }

    pub fn parents_of(&self, name: &SubsystemName) -> Vec<SubsystemName> {
        self.parents.get(name).cloned().unwrap_or_default()
    }

    pub fn has_parents(&self, name: &SubsystemName) -> bool {
        self.parents.get(name).is_some_and(|p| !p.is_empty())
    }

    /// True when `to` is reachable from `from` along child edges. The
    /// registry uses this to refuse edges that would close a cycle.
    pub fn has_path(&self, from: &SubsystemName, to: &SubsystemName) -> bool {
        if from == to {
            return true;
        }
        let mut stack = self.children_of(from);
        let mut seen = vec![from.clone()];
        while let Some(next) = stack.pop() {
            if &next == to {
                return true;
            }
            if seen.contains(&next) {
                continue;
            }
            seen.push(next.clone());
            stack.extend(self.children_of(&next));
        }
        false
    }

    /// Removes every edge touching `name`, both as parent and as child.
    pub fn detach(&mut self, name: &SubsystemName) {
        for child in self.children.remove(name).unwrap_or_default() {
            if let Some(parents) = self.parents.get_mut(&child) {
                parents.retain(|p| p != name);
            }
        }
        for parent in self.parents.remove(name).unwrap_or_default() {
            if let Some(children) = self.children.get_mut(&parent) {
                children.retain(|c| c != name);
            }
        }
    }
}
