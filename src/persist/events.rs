//! Persist events and per-class item hooks

use crate::Result;
use crate::item::{ItemGraph, ItemId, ItemStructure};
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::fmt;

/// Why an item ended a persist without a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    GetOnlyMode,
    UpdateOnlyMode,
    InsufficientData,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::GetOnlyMode => "get_only_mode",
            DropReason::UpdateOnlyMode => "update_only_mode",
            DropReason::InsufficientData => "insufficient_data",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Message sent to persist subscribers
#[derive(Debug, Clone)]
pub enum PersistEvent<M> {
    BeforePersist {
        roots: Vec<ItemId>,
        structure: ItemStructure,
    },
    ItemDropped {
        item: ItemId,
        class: String,
        reason: DropReason,
    },
    AfterPersist {
        roots: Vec<ItemId>,
        items: Vec<ItemId>,
        models: Vec<Vec<M>>,
    },
}

/// Fan-out of events to every live subscriber
pub(crate) struct EventBus<M> {
    subscribers: Vec<Sender<PersistEvent<M>>>,
}

impl<M: Clone> EventBus<M> {
    pub fn new() -> Self {
        Self { subscribers: Vec::new() }
    }

    pub fn subscribe(&mut self) -> Receiver<PersistEvent<M>> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn emit(&mut self, event: PersistEvent<M>) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Callbacks run for items of one class.
///
/// Models are interior-mutable handles, so hooks may adjust them.
pub trait ItemHooks<M> {
    /// Pick the surviving model when several matched; `None` merges them
    fn resolve_model(&self, _graph: &ItemGraph, _item: ItemId, _models: &[M]) -> Result<Option<M>> {
        Ok(None)
    }

    fn before_model_update(&self, _graph: &ItemGraph, _item: ItemId, _model: &M) -> Result<()> {
        Ok(())
    }

    fn before_models_merge(&self, _graph: &ItemGraph, _item: ItemId, _models: &[M]) -> Result<()> {
        Ok(())
    }

    fn after_models_merge(&self, _graph: &ItemGraph, _item: ItemId, _model: &M) -> Result<()> {
        Ok(())
    }

    fn after_model_save(&self, _graph: &ItemGraph, _item: ItemId, _model: &M) -> Result<()> {
        Ok(())
    }
}

/// Hooks by item class name
pub struct HookSet<M> {
    by_class: HashMap<String, Box<dyn ItemHooks<M>>>,
}

impl<M> Default for HookSet<M> {
    fn default() -> Self {
        Self { by_class: HashMap::new() }
    }
}

impl<M> HookSet<M> {
    pub fn register(&mut self, class: &str, hooks: Box<dyn ItemHooks<M>>) {
        self.by_class.insert(class.to_string(), hooks);
    }

    pub fn get(&self, class: &str) -> Option<&dyn ItemHooks<M>> {
        self.by_class.get(class).map(|h| h.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_prunes_closed_receivers() {
        let mut bus: EventBus<u32> = EventBus::new();
        let kept = bus.subscribe();
        let dropped = bus.subscribe();
        drop(dropped);

        bus.emit(PersistEvent::ItemDropped {
            item: ItemId(3),
            class: "A".to_string(),
            reason: DropReason::InsufficientData,
        });
        assert_eq!(bus.subscribers.len(), 1);
        match kept.try_recv().unwrap() {
            PersistEvent::ItemDropped { item, reason, .. } => {
                assert_eq!(item, ItemId(3));
                assert_eq!(reason, DropReason::InsufficientData);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
