use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;
use tracing::debug;

use crate::event::channel::{EventPublisher, EventPublisherError};
use crate::names::SubsystemName;
use crate::subsystem::graph::{DependencyGraph, GraphError};
use crate::subsystem::message::Message;
use crate::subsystem::state::{AdminState, OperState};
use crate::subsystem::status::{StatusCell, SubsystemStatus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("a subsystem named `{0}` already exists")]
    DuplicateName(SubsystemName),

    #[error("no subsystem named `{0}`")]
    UnknownSubsystem(SubsystemName),

    #[error("linking `{parent}` -> `{child}` would close a dependency cycle")]
    WouldCycle {
        parent: SubsystemName,
        child: SubsystemName,
    },

    #[error("subsystem `{0}` is still a child of a live parent")]
    StillReferenced(SubsystemName),

    #[error("subsystem `{0}` is not offline")]
    NotOffline(SubsystemName),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// The outward face of a running subsystem: its message pipe, its wakeup
/// trigger and the latest status snapshot. Cloning shares all three.
#[derive(Debug, Clone)]
pub struct SubsystemHandle {
    name: SubsystemName,
    pipe: EventPublisher<Message>,
    interrupt: EventPublisher<()>,
    status: StatusCell,
}

impl SubsystemHandle {
    pub(crate) fn new(
        name: SubsystemName,
        pipe: EventPublisher<Message>,
        interrupt: EventPublisher<()>,
        status: StatusCell,
    ) -> Self {
        Self {
            name,
            pipe,
            interrupt,
            status,
        }
    }

    pub fn name(&self) -> &SubsystemName {
        &self.name
    }

    pub fn send(&self, message: Message) -> Result<(), EventPublisherError> {
        self.pipe.publish(message)
    }

    /// Forces the driver to re-poll without queueing a message.
    pub fn wakeup(&self) {
        let _ = self.interrupt.publish(());
    }

    pub fn status(&self) -> SubsystemStatus {
        self.status.load()
    }
}

/// Process-wide directory of subsystems and the dependency graph between
/// them. Ownership of driver threads stays with the hosting daemon; the
/// registry only hands out handles.
#[derive(Debug, Default)]
pub struct SubsystemRegistry {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    handles: HashMap<SubsystemName, SubsystemHandle>,
    graph: DependencyGraph,
}

impl SubsystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: SubsystemHandle) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if inner.handles.contains_key(handle.name()) {
            return Err(RegistryError::DuplicateName(handle.name().clone()));
        }
        debug!(subsystem = %handle.name(), "subsystem registered");
        inner.handles.insert(handle.name().clone(), handle);
        Ok(())
    }

    pub fn lookup(&self, name: &SubsystemName) -> Option<SubsystemHandle> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .handles
            .get(name)
            .cloned()
    }

    /// Makes `child` a dependency of `parent`. Edges that would close a
    /// cycle are refused here; the state machines assume an acyclic graph.
    pub fn link(
        &self,
        parent: &SubsystemName,
        child: &SubsystemName,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        if !inner.handles.contains_key(parent) {
            return Err(RegistryError::UnknownSubsystem(parent.clone()));
        }
        if !inner.handles.contains_key(child) {
            return Err(RegistryError::UnknownSubsystem(child.clone()));
        }
        if inner.graph.has_path(child, parent) {
            return Err(RegistryError::WouldCycle {
                parent: parent.clone(),
                child: child.clone(),
            });
        }
        inner.graph.add_edge(parent, child)?;
        Ok(())
    }

    pub fn unlink(
        &self,
        parent: &SubsystemName,
        child: &SubsystemName,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.graph.remove_edge(parent, child)?;
        Ok(())
    }

    pub fn children_of(&self, name: &SubsystemName) -> Vec<SubsystemName> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .graph
            .children_of(name)
    }

    pub fn parents_of(&self, name: &SubsystemName) -> Vec<SubsystemName> {
        self.inner
            .read()
            .expect("registry lock poisoned")
            .graph
            .parents_of(name)
    }

    /// Validates a removal without performing it.
    ///
    /// Non-recursive removal requires the subsystem to be fully offline and
    /// unreferenced. Recursive removal additionally requires the entire
    /// child closure to be offline already; the registry never drives
    /// subsystems offline itself.
    pub fn check_remove(
        &self,
        name: &SubsystemName,
        recursive: bool,
    ) -> Result<(), RegistryError> {
        let inner = self.inner.read().expect("registry lock poisoned");
        Self::check_remove_locked(&inner, name, recursive)
    }

    /// Removes a subsystem (and with `recursive`, every child that is not
    /// referenced elsewhere), detaching all edges. Returns the removed
    /// names. Refuses with the same rules as [`Self::check_remove`].
    pub fn remove(
        &self,
        name: &SubsystemName,
        recursive: bool,
    ) -> Result<Vec<SubsystemName>, RegistryError> {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        Self::check_remove_locked(&inner, name, recursive)?;

        let mut removed = Vec::new();
        Self::remove_locked(&mut inner, name, recursive, &mut removed);
        Ok(removed)
    }

    fn check_remove_locked(
        inner: &Inner,
        name: &SubsystemName,
        recursive: bool,
    ) -> Result<(), RegistryError> {
        let handle = inner
            .handles
            .get(name)
            .ok_or_else(|| RegistryError::UnknownSubsystem(name.clone()))?;

        let status = handle.status();
        if status.oper_state != OperState::Offline || status.admin_state != AdminState::Offline {
            return Err(RegistryError::NotOffline(name.clone()));
        }

        let children = inner.graph.children_of(name);
        if !recursive {
            if inner.graph.has_parents(name) {
                return Err(RegistryError::StillReferenced(name.clone()));
            }
            return Ok(());
        }

        for child in children {
            // Children referenced by other parents stay behind; the rest
            // must be offline before their subtree can go.
            if inner.graph.parents_of(&child).len() > 1 {
                continue;
            }
            Self::check_remove_locked(inner, &child, true)?;
        }
        Ok(())
    }

    fn remove_locked(
        inner: &mut Inner,
        name: &SubsystemName,
        recursive: bool,
        removed: &mut Vec<SubsystemName>,
    ) {
        if recursive {
            for child in inner.graph.children_of(name) {
                let _ = inner.graph.remove_edge(name, &child);
                if !inner.graph.has_parents(&child) {
                    Self::remove_locked(inner, &child, true, removed);
                }
            }
        }
        inner.graph.detach(name);
        inner.handles.remove(name);
        debug!(subsystem = %name, "subsystem removed");
        removed.push(name.clone());
    }

    /// Forgets a subsystem without the removal checks. Used by the daemon on
    /// shutdown after the driver was stopped.
    pub fn deregister(&self, name: &SubsystemName) {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        inner.graph.detach(name);
        inner.handles.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::channel::pub_sub;
    use assert_matches::assert_matches;

    fn handle(name: &str) -> SubsystemHandle {
        // The consumers are dropped: these tests only exercise the registry
        // bookkeeping, not message delivery.
        let (pipe, _) = pub_sub();
        let (interrupt, _) = pub_sub();
        SubsystemHandle::new(
            name.into(),
            pipe,
            interrupt,
            StatusCell::new(SubsystemStatus::initial(name.into())),
        )
    }

    fn online_handle(name: &str) -> SubsystemHandle {
        let handle = handle(name);
        let mut status = handle.status();
        status.admin_state = AdminState::Online;
        status.oper_state = OperState::Online;
        handle.status.store(status);
        handle
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let registry = SubsystemRegistry::new();
        registry.register(handle("nav")).unwrap();
        assert_matches!(
            registry.register(handle("nav")),
            Err(RegistryError::DuplicateName(_))
        );
    }

    #[test]
    fn link_rejects_cycles() {
        let registry = SubsystemRegistry::new();
        registry.register(handle("a")).unwrap();
        registry.register(handle("b")).unwrap();
        registry.register(handle("c")).unwrap();

        registry.link(&"a".into(), &"b".into()).unwrap();
        registry.link(&"b".into(), &"c".into()).unwrap();

        assert_matches!(
            registry.link(&"c".into(), &"a".into()),
            Err(RegistryError::WouldCycle { .. })
        );
        assert_matches!(
            registry.link(&"a".into(), &"a".into()),
            Err(RegistryError::WouldCycle { .. })
        );
    }

    #[test]
    fn remove_refuses_referenced_child() {
        let registry = SubsystemRegistry::new();
        registry.register(handle("parent")).unwrap();
        registry.register(handle("child")).unwrap();
        registry.link(&"parent".into(), &"child".into()).unwrap();

        assert_matches!(
            registry.remove(&"child".into(), false),
            Err(RegistryError::StillReferenced(_))
        );

        // Recursive removal of the parent takes the child along.
        let removed = registry.remove(&"parent".into(), true).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(registry.lookup(&"child".into()).is_none());
    }

    #[test]
    fn remove_refuses_online_subsystems() {
        let registry = SubsystemRegistry::new();
        registry.register(online_handle("nav")).unwrap();

        assert_matches!(
            registry.remove(&"nav".into(), false),
            Err(RegistryError::NotOffline(_))
        );
    }

    #[test]
    fn recursive_remove_keeps_shared_children() {
        let registry = SubsystemRegistry::new();
        registry.register(handle("a")).unwrap();
        registry.register(handle("b")).unwrap();
        registry.register(handle("shared")).unwrap();
        registry.link(&"a".into(), &"shared".into()).unwrap();
        registry.link(&"b".into(), &"shared".into()).unwrap();

        let removed = registry.remove(&"a".into(), true).unwrap();
        assert_eq!(removed, vec!["a".into()]);

        assert!(registry.lookup(&"shared".into()).is_some());
        assert_eq!(registry.parents_of(&"shared".into()), vec!["b".into()]);
    }
}
