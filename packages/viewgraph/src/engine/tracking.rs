//! View instances and their change tracking.
//!
//! Instances of mutable view types remember the values of their updatable
//! attributes as constructed (the initial state) and keep a dirty bit per
//! updatable attribute. A mutable instance held by another view records a
//! back-link to it; changes mark the owning attribute dirty and travel up
//! the links. Links are weak so parents and children never keep each other
//! alive.
//!
//! Instances are single-threaded (`Rc<RefCell<..>>`); callers serialize
//! access to one object graph.

use super::metamodel::ViewType;
use super::types::{compare_values, FastSet, Value};
use super::update::{DirtyEntry, DirtySnapshot};
use crate::error::TrackingError;
use smallvec::SmallVec;
use smol_str::SmolStr;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tracing::trace;

/// One bit per updatable attribute.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirtyBits {
    words: SmallVec<[u64; 1]>,
}

impl DirtyBits {
    pub fn with_len(len: usize) -> Self {
        DirtyBits {
            words: SmallVec::from_elem(0, len.div_ceil(64)),
        }
    }

    pub fn set(&mut self, index: usize) {
        self.words[index / 64] |= 1u64 << (index % 64);
    }

    pub fn unset(&mut self, index: usize) {
        if let Some(word) = self.words.get_mut(index / 64) {
            *word &= !(1u64 << (index % 64));
        }
    }

    pub fn get(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .map(|w| w & (1u64 << (index % 64)) != 0)
            .unwrap_or(false)
    }

    pub fn any(&self) -> bool {
        self.words.iter().any(|w| *w != 0)
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, word)| {
            (0..64)
                .filter(move |bit| word & (1u64 << *bit) != 0)
                .map(move |bit| i * 64 + bit)
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackingState {
    /// The view type is not mutable; nothing is tracked.
    ReadOnly,
    Clean,
    Dirty,
}

#[derive(Clone)]
struct ParentLink {
    parent: Weak<RefCell<ViewInstance>>,
    /// Attribute position within the parent.
    index: usize,
}

impl ParentLink {
    fn new(parent: &ViewRef, index: usize) -> Self {
        ParentLink {
            parent: Rc::downgrade(&parent.0),
            index,
        }
    }

    fn points_to(&self, parent: &ViewRef, index: usize) -> bool {
        self.index == index && std::ptr::eq(self.parent.as_ptr(), Rc::as_ptr(&parent.0))
    }

    fn is_alive(&self) -> bool {
        self.parent.strong_count() > 0
    }
}

struct ChangeTracker {
    /// Values of updatable attributes, by dirty index.
    initial: Vec<Value>,
    dirty: DirtyBits,
}

pub struct ViewInstance {
    view_type: Arc<ViewType>,
    values: Vec<Value>,
    arguments: Vec<Value>,
    tracker: Option<ChangeTracker>,
    parent: Option<ParentLink>,
    read_only_parents: SmallVec<[ParentLink; 2]>,
}

impl ViewInstance {
    fn id(&self) -> Option<Value> {
        self.view_type
            .id_index()
            .map(|i| self.values[i].clone())
            .filter(|id| !id.is_null())
    }

    fn links(&self) -> SmallVec<[ParentLink; 3]> {
        self.parent
            .iter()
            .chain(self.read_only_parents.iter())
            .cloned()
            .collect()
    }
}

/// Shared handle to a constructed view.
#[derive(Clone)]
pub struct ViewRef(Rc<RefCell<ViewInstance>>);

impl ViewRef {
    /// Wraps constructed values; mutable view types start clean with the
    /// given values as initial state.
    pub(crate) fn new(view_type: Arc<ViewType>, values: Vec<Value>, arguments: Vec<Value>) -> Self {
        let tracker = view_type.is_mutable().then(|| ChangeTracker {
            initial: view_type
                .dirty_attributes()
                .iter()
                .map(|i| values[*i].clone())
                .collect(),
            dirty: DirtyBits::with_len(view_type.updatable_count()),
        });
        ViewRef(Rc::new(RefCell::new(ViewInstance {
            view_type,
            values,
            arguments,
            tracker,
            parent: None,
            read_only_parents: SmallVec::new(),
        })))
    }

    pub fn view_type(&self) -> Arc<ViewType> {
        self.0.borrow().view_type.clone()
    }

    pub fn type_name(&self) -> SmolStr {
        self.0.borrow().view_type.name.clone()
    }

    pub fn is_mutable(&self) -> bool {
        self.0.borrow().tracker.is_some()
    }

    /// Identity value, if the type has one and it is not NULL.
    pub fn id(&self) -> Option<Value> {
        self.0.borrow().id()
    }

    pub fn ptr_eq(&self, other: &ViewRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub fn attribute_index(&self, name: &str) -> Result<usize, TrackingError> {
        let inner = self.0.borrow();
        inner
            .view_type
            .attribute_index(name)
            .ok_or_else(|| TrackingError::UnknownAttribute {
                view: inner.view_type.name.clone(),
                attribute: SmolStr::new(name),
            })
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        let inner = self.0.borrow();
        inner
            .view_type
            .attribute_index(name)
            .map(|i| inner.values[i].clone())
    }

    pub fn get_at(&self, index: usize) -> Option<Value> {
        self.0.borrow().values.get(index).cloned()
    }

    pub fn values(&self) -> Vec<Value> {
        self.0.borrow().values.clone()
    }

    /// Constructor arguments the instance was built with.
    pub fn arguments(&self) -> Vec<Value> {
        self.0.borrow().arguments.clone()
    }

    pub fn with_values<R>(&self, f: impl FnOnce(&[Value]) -> R) -> R {
        f(&self.0.borrow().values)
    }

    /// Assigns an updatable attribute. Returns `false` when the value is
    /// unchanged. Mutable views inside the new value are re-parented to this
    /// instance; those inside the old value are released.
    pub fn set(&self, name: &str, value: Value) -> Result<bool, TrackingError> {
        let index = self.attribute_index(name)?;
        self.set_at(index, value)
    }

    pub fn set_at(&self, index: usize, value: Value) -> Result<bool, TrackingError> {
        {
            let inner = self.0.borrow();
            let view_type = &inner.view_type;
            let attribute = view_type.attributes.get(index).ok_or_else(|| {
                TrackingError::UnknownAttribute {
                    view: view_type.name.clone(),
                    attribute: SmolStr::new(index.to_string()),
                }
            })?;
            if inner.tracker.is_none() || view_type.dirty_index(index).is_none() {
                return Err(TrackingError::NotUpdatable {
                    view: view_type.name.clone(),
                    attribute: attribute.name.clone(),
                });
            }
            if identical(&inner.values[index], &value) {
                return Ok(false);
            }
        }

        let mut conflict = None;
        value.for_each_view(&mut |child| {
            if child.is_mutable() && child.has_foreign_parent(self, index) {
                conflict = Some(child.type_name());
            }
        });
        if let Some(view) = conflict {
            return Err(TrackingError::AlreadyHasParent { view });
        }

        let old = {
            let mut inner = self.0.borrow_mut();
            std::mem::replace(&mut inner.values[index], value.clone())
        };
        old.for_each_view(&mut |child| child.release_parent(self, index));
        let mut holds_views = false;
        value.for_each_view(&mut |child| {
            holds_views = true;
            if child.is_mutable() {
                child.link_parent(self, index);
            }
        });
        // a plain value assigned back to its initial state is clean again
        if !holds_views && self.revert_if_initial(index, &value) {
            return Ok(true);
        }
        self.mark_dirty(index);
        Ok(true)
    }

    fn revert_if_initial(&self, index: usize, value: &Value) -> bool {
        let mut guard = self.0.borrow_mut();
        let inner = &mut *guard;
        match (inner.view_type.dirty_index(index), inner.tracker.as_mut()) {
            (Some(dirty_index), Some(tracker)) if identical(&tracker.initial[dirty_index], value) => {
                tracker.dirty.unset(dirty_index);
                true
            }
            _ => false,
        }
    }

    /// Applies `f` to a copy of the attribute and assigns the result.
    pub fn update<F>(&self, name: &str, f: F) -> Result<bool, TrackingError>
    where
        F: FnOnce(&mut Value),
    {
        let index = self.attribute_index(name)?;
        let mut value = self.0.borrow().values[index].clone();
        f(&mut value);
        self.set_at(index, value)
    }

    /// Marks the attribute dirty (when it is updatable) and notifies every
    /// parent, transitively. Each (instance, attribute) pair is visited once.
    pub fn mark_dirty(&self, attribute_index: usize) {
        let mut visited = FastSet::default();
        self.mark_dirty_inner(attribute_index, &mut visited);
    }

    fn mark_dirty_inner(&self, attribute_index: usize, visited: &mut FastSet<(usize, usize)>) {
        if !visited.insert((self.addr(), attribute_index)) {
            return;
        }
        let links = {
            let mut guard = self.0.borrow_mut();
            let inner = &mut *guard;
            if let (Some(dirty_index), Some(tracker)) = (
                inner.view_type.dirty_index(attribute_index),
                inner.tracker.as_mut(),
            ) {
                tracker.dirty.set(dirty_index);
            }
            inner.links()
        };
        for link in links {
            if let Some(parent) = link.parent.upgrade() {
                let parent = ViewRef(parent);
                trace!(
                    target: "viewgraph",
                    child = %self.type_name(),
                    parent = %parent.type_name(),
                    index = link.index,
                    "propagating dirty attribute"
                );
                parent.mark_dirty_inner(link.index, visited);
            }
        }
    }

    /// Registers the owning attribute. Fails if another live parent owns
    /// this instance.
    pub fn set_parent(&self, parent: &ViewRef, index: usize) -> Result<(), TrackingError> {
        if self.has_foreign_parent(parent, index) {
            return Err(TrackingError::AlreadyHasParent {
                view: self.type_name(),
            });
        }
        self.link_parent(parent, index);
        Ok(())
    }

    pub fn unset_parent(&self) {
        self.0.borrow_mut().parent = None;
    }

    pub fn has_parent(&self) -> bool {
        self.0
            .borrow()
            .parent
            .as_ref()
            .map(ParentLink::is_alive)
            .unwrap_or(false)
    }

    /// Adds a non-owning back-link. The same parent may be added repeatedly;
    /// each addition is removed separately.
    pub fn add_read_only_parent(&self, parent: &ViewRef, index: usize) {
        self.0
            .borrow_mut()
            .read_only_parents
            .push(ParentLink::new(parent, index));
    }

    /// Removes the first matching read-only link.
    pub fn remove_read_only_parent(&self, parent: &ViewRef, index: usize) {
        let mut inner = self.0.borrow_mut();
        if let Some(pos) = inner
            .read_only_parents
            .iter()
            .position(|l| l.points_to(parent, index))
        {
            inner.read_only_parents.remove(pos);
        }
    }

    pub fn read_only_parent_count(&self) -> usize {
        self.0.borrow().read_only_parents.len()
    }

    fn has_foreign_parent(&self, parent: &ViewRef, index: usize) -> bool {
        self.0
            .borrow()
            .parent
            .as_ref()
            .map(|l| l.is_alive() && !l.points_to(parent, index))
            .unwrap_or(false)
    }

    fn link_parent(&self, parent: &ViewRef, index: usize) {
        self.0.borrow_mut().parent = Some(ParentLink::new(parent, index));
    }

    fn release_parent(&self, parent: &ViewRef, index: usize) {
        let mut inner = self.0.borrow_mut();
        if inner
            .parent
            .as_ref()
            .map(|l| l.points_to(parent, index))
            .unwrap_or(false)
        {
            inner.parent = None;
        }
    }

    pub fn state(&self) -> TrackingState {
        match &self.0.borrow().tracker {
            None => TrackingState::ReadOnly,
            Some(tracker) if tracker.dirty.any() => TrackingState::Dirty,
            Some(_) => TrackingState::Clean,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.state() == TrackingState::Dirty
    }

    pub fn is_attribute_dirty(&self, name: &str) -> bool {
        let inner = self.0.borrow();
        let dirty_index = inner
            .view_type
            .attribute_index(name)
            .and_then(|i| inner.view_type.dirty_index(i));
        match (dirty_index, &inner.tracker) {
            (Some(d), Some(tracker)) => tracker.dirty.get(d),
            _ => false,
        }
    }

    /// Value of an updatable attribute as of construction or the last reset.
    pub fn initial_value(&self, name: &str) -> Option<Value> {
        let inner = self.0.borrow();
        let dirty_index = inner
            .view_type
            .attribute_index(name)
            .and_then(|i| inner.view_type.dirty_index(i))?;
        inner
            .tracker
            .as_ref()
            .map(|t| t.initial[dirty_index].clone())
    }

    /// Accepts the current values as the new initial state. Does not touch
    /// child instances; a clean instance is left as is.
    pub fn reset_dirty(&self) {
        let mut guard = self.0.borrow_mut();
        let inner = &mut *guard;
        if let Some(tracker) = inner.tracker.as_mut() {
            if !tracker.dirty.any() {
                return;
            }
            for (dirty_index, attribute_index) in
                inner.view_type.dirty_attributes().iter().enumerate()
            {
                tracker.initial[dirty_index] = inner.values[*attribute_index].clone();
            }
            tracker.dirty.clear();
        }
    }

    pub fn dirty_snapshot(&self) -> DirtySnapshot {
        let inner = self.0.borrow();
        let mut entries = Vec::new();
        if let Some(tracker) = &inner.tracker {
            for dirty_index in tracker.dirty.iter_ones() {
                let attribute_index = inner.view_type.dirty_attributes()[dirty_index];
                entries.push(DirtyEntry {
                    dirty_index,
                    attribute_index,
                    attribute: inner.view_type.attributes[attribute_index].name.clone(),
                    initial: tracker.initial[dirty_index].clone(),
                    value: inner.values[attribute_index].clone(),
                });
            }
        }
        DirtySnapshot::new(inner.view_type.name.clone(), inner.id(), entries)
    }

    /// Fills an attribute resolved after construction. The value becomes
    /// part of the initial state and does not mark anything dirty.
    pub(crate) fn fill_deferred(&self, index: usize, value: Value) -> Result<(), TrackingError> {
        {
            let mut guard = self.0.borrow_mut();
            let inner = &mut *guard;
            inner.values[index] = value;
            if let (Some(dirty_index), Some(tracker)) =
                (inner.view_type.dirty_index(index), inner.tracker.as_mut())
            {
                tracker.initial[dirty_index] = inner.values[index].clone();
            }
        }
        self.adopt_attribute(index)
    }

    /// Registers this instance as parent of every mutable view it holds:
    /// as owner for updatable attributes of a mutable instance, as
    /// read-only parent otherwise.
    pub(crate) fn adopt_children(&self) -> Result<(), TrackingError> {
        let count = self.0.borrow().values.len();
        for index in 0..count {
            self.adopt_attribute(index)?;
        }
        Ok(())
    }

    fn adopt_attribute(&self, index: usize) -> Result<(), TrackingError> {
        let (owning, children) = {
            let inner = self.0.borrow();
            let owning = inner.tracker.is_some() && inner.view_type.dirty_index(index).is_some();
            let mut children: SmallVec<[ViewRef; 4]> = SmallVec::new();
            inner.values[index].for_each_view(&mut |child| children.push(child.clone()));
            (owning, children)
        };
        for child in children.iter().filter(|c| c.is_mutable()) {
            if owning {
                child.set_parent(self, index)?;
            } else {
                child.add_read_only_parent(self, index);
            }
        }
        Ok(())
    }

    /// Independent copy: values are deep-cloned and the copy starts clean.
    pub fn deep_clone(&self) -> ViewRef {
        let (view_type, values, arguments) = {
            let inner = self.0.borrow();
            (
                inner.view_type.clone(),
                inner.values.iter().map(Value::deep_clone).collect(),
                inner.arguments.iter().map(Value::deep_clone).collect(),
            )
        };
        let copy = ViewRef::new(view_type, values, arguments);
        let adopted = copy.adopt_children();
        debug_assert!(adopted.is_ok(), "deep-cloned children have no parents yet");
        copy
    }

    pub fn compare(&self, other: &ViewRef) -> Ordering {
        if self.ptr_eq(other) {
            return Ordering::Equal;
        }
        let (a, b) = (self.0.borrow(), other.0.borrow());
        a.view_type
            .name
            .cmp(&b.view_type.name)
            .then_with(|| match (a.id(), b.id()) {
                (Some(x), Some(y)) => compare_values(&x, &y),
                _ => compare_values(
                    &Value::List(a.values.clone()),
                    &Value::List(b.values.clone()),
                ),
            })
    }

    pub fn to_json(&self) -> serde_json::Value {
        let inner = self.0.borrow();
        serde_json::Value::Object(
            inner
                .view_type
                .attributes
                .iter()
                .zip(inner.values.iter())
                .map(|(attribute, value)| (attribute.name.to_string(), value.to_json()))
                .collect(),
        )
    }
}

/// Equality that treats distinct view instances as different even when
/// they share an identity.
fn identical(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::View(x), Value::View(y)) => x.ptr_eq(y),
        _ => a == b,
    }
}

impl PartialEq for ViewRef {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        let (a, b) = (self.0.borrow(), other.0.borrow());
        if a.view_type.name != b.view_type.name {
            return false;
        }
        match (a.id(), b.id()) {
            (Some(x), Some(y)) => x == y,
            _ => a.values == b.values && a.arguments == b.arguments,
        }
    }
}

impl Eq for ViewRef {}

impl Hash for ViewRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let inner = self.0.borrow();
        inner.view_type.name.hash(state);
        match inner.id() {
            Some(id) => id.hash(state),
            None => {
                inner.values.hash(state);
                inner.arguments.hash(state);
            }
        }
    }
}

impl fmt::Display for ViewRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        match inner.id() {
            Some(id) => write!(f, "{}#{}", inner.view_type.name, id),
            None => {
                write!(f, "{}(", inner.view_type.name)?;
                for (i, value) in inner.values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", value)?;
                }
                f.write_str(")")
            }
        }
    }
}

impl fmt::Debug for ViewRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(inner) => f
                .debug_struct("ViewRef")
                .field("view", &inner.view_type.name)
                .field("values", &inner.values)
                .finish(),
            Err(_) => f.write_str("ViewRef(<borrowed>)"),
        }
    }
}
