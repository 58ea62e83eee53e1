//! Record - the row handle shared by the bundled adapters

use super::Model;
use crate::value::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};

/// Snapshot-able state of a record.
///
/// Links are weak so reciprocal relations never form reference cycles;
/// the owning adapter keeps every record alive for the session.
#[derive(Clone, Default)]
pub(crate) struct RecordState {
    pub fields: BTreeMap<String, Value>,
    pub one: BTreeMap<String, Option<Weak<RecordInner>>>,
    pub many: BTreeMap<String, Vec<Weak<RecordInner>>>,
}

impl RecordState {
    /// Same values and same link targets
    pub fn same_as(&self, other: &RecordState) -> bool {
        self.fields == other.fields
            && self.one.len() == other.one.len()
            && self.one.iter().all(|(k, v)| match (v, other.one.get(k)) {
                (None, Some(None)) => true,
                (Some(a), Some(Some(b))) => a.ptr_eq(b),
                _ => false,
            })
            && self.many.len() == other.many.len()
            && self.many.iter().all(|(k, v)| {
                other
                    .many
                    .get(k)
                    .is_some_and(|o| o.len() == v.len() && v.iter().zip(o).all(|(a, b)| a.ptr_eq(b)))
            })
    }
}

pub(crate) struct RecordInner {
    model_cls: String,
    state: RefCell<RecordState>,
}

/// Identity-compared, interior-mutable row handle.
#[derive(Clone)]
pub struct Record(Rc<RecordInner>);

impl Record {
    pub fn new(model_cls: &str) -> Self {
        Record(Rc::new(RecordInner {
            model_cls: model_cls.to_string(),
            state: RefCell::new(RecordState::default()),
        }))
    }

    fn downgrade(&self) -> Weak<RecordInner> {
        Rc::downgrade(&self.0)
    }

    fn upgrade(weak: &Weak<RecordInner>) -> Option<Record> {
        weak.upgrade().map(Record)
    }

    pub(crate) fn state(&self) -> RecordState {
        self.0.state.borrow().clone()
    }

    pub(crate) fn restore(&self, state: RecordState) {
        *self.0.state.borrow_mut() = state;
    }

    /// Declare a relation attribute without a value
    pub(crate) fn init_relation(&self, name: &str, x_to_many: bool) {
        let mut state = self.0.state.borrow_mut();
        if x_to_many {
            state.many.entry(name.to_string()).or_default();
        } else {
            state.one.entry(name.to_string()).or_insert(None);
        }
    }

    /// Null out every link from this record to `target`
    pub(crate) fn drop_links_to(&self, target: &Record) {
        let weak = target.downgrade();
        let mut state = self.0.state.borrow_mut();
        for link in state.one.values_mut() {
            if link.as_ref().is_some_and(|w| w.ptr_eq(&weak)) {
                *link = None;
            }
        }
        for list in state.many.values_mut() {
            list.retain(|w| !w.ptr_eq(&weak));
        }
    }

    /// Scalar fields in name order
    pub fn fields(&self) -> BTreeMap<String, Value> {
        self.0.state.borrow().fields.clone()
    }
}

impl Model for Record {
    fn model_cls(&self) -> &str {
        &self.0.model_cls
    }

    fn get_field(&self, name: &str) -> Value {
        self.0.state.borrow().fields.get(name).cloned().unwrap_or(Value::Null)
    }

    fn set_field(&self, name: &str, value: Value) {
        self.0.state.borrow_mut().fields.insert(name.to_string(), value);
    }

    fn has_field(&self, name: &str) -> bool {
        let state = self.0.state.borrow();
        state.fields.contains_key(name) || state.one.contains_key(name) || state.many.contains_key(name)
    }

    fn get_relation(&self, name: &str) -> Option<Self> {
        let state = self.0.state.borrow();
        state.one.get(name).and_then(|w| w.as_ref()).and_then(Record::upgrade)
    }

    fn set_relation(&self, name: &str, target: Option<&Self>) {
        let link = target.map(Record::downgrade);
        self.0.state.borrow_mut().one.insert(name.to_string(), link);
    }

    fn related_members(&self, name: &str) -> Vec<Self> {
        let state = self.0.state.borrow();
        state
            .many
            .get(name)
            .map(|members| members.iter().filter_map(Record::upgrade).collect())
            .unwrap_or_default()
    }

    fn add_relation_members(&self, name: &str, members: &[Self]) {
        let mut state = self.0.state.borrow_mut();
        let list = state.many.entry(name.to_string()).or_default();
        for member in members {
            if !list.iter().any(|w| w.ptr_eq(&member.downgrade())) {
                list.push(member.downgrade());
            }
        }
    }

    fn remove_relation_members(&self, name: &str, members: &[Self]) {
        let mut state = self.0.state.borrow_mut();
        if let Some(list) = state.many.get_mut(name) {
            list.retain(|w| !members.iter().any(|m| w.ptr_eq(&m.downgrade())));
        }
    }

    fn clear_relation(&self, name: &str) {
        self.0.state.borrow_mut().many.insert(name.to_string(), Vec::new());
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Record {}

impl Hash for Record {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Rc::as_ptr(&self.0), state);
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.get_field("id");
        if id.is_null() {
            write!(f, "Record({}@{:p})", self.0.model_cls, Rc::as_ptr(&self.0))
        } else {
            write!(f, "Record({}#{})", self.0.model_cls, id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_equality() {
        let a = Record::new("person");
        let b = Record::new("person");
        a.set_field("name", Value::from("x"));
        b.set_field("name", Value::from("x"));
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_links_are_weak() {
        let parent = Record::new("parent");
        {
            let child = Record::new("child");
            parent.add_relation_members("children", &[child.clone()]);
            child.set_relation("parent", Some(&parent));
            assert_eq!(parent.related_members("children"), vec![child.clone()]);
            assert_eq!(child.get_relation("parent"), Some(parent.clone()));
        }
        assert!(parent.related_members("children").is_empty());
    }

    #[test]
    fn test_members_dedup_and_remove() {
        let parent = Record::new("parent");
        let a = Record::new("child");
        let b = Record::new("child");
        parent.add_relation_members("children", &[a.clone(), b.clone(), a.clone()]);
        assert_eq!(parent.related_members("children").len(), 2);
        parent.remove_relation_members("children", &[a.clone()]);
        assert_eq!(parent.related_members("children"), vec![b]);
    }

    #[test]
    fn test_state_snapshot() {
        let a = Record::new("thing");
        a.set_field("name", Value::from("before"));
        let snapshot = a.state();
        a.set_field("name", Value::from("after"));
        assert!(!a.state().same_as(&snapshot));
        a.restore(snapshot.clone());
        assert_eq!(a.get_field("name"), Value::from("before"));
        assert!(a.state().same_as(&snapshot));
    }
}
