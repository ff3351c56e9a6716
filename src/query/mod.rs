//! # Live Query List
//!
//! Enumerations over the graph directory come back as a `List`, which is one
//! of two things:
//!
//! - `CursorQuery`: a lazy plan over the live directory. Composable with
//!   `join` (union), `intersect`, `difference` and `filter`. Every `len`,
//!   `get` or `iter` call evaluates the plan afresh.
//! - `IndexedSnapshot`: a fixed result (e.g. instances matching a status at
//!   one moment), addressed by index and iterated from the last index down
//!   to 0. Set algebra on a snapshot is an error.
//!
//! ## Snapshot policy
//!
//! `iter()` fixes membership when it is called; later insertions or
//! removals don't affect an iterator already handed out. The handles it
//! yields still read properties and status live.

pub mod plan;

use std::marker::PhantomData;

use indexmap::IndexSet;

use crate::graph::Graph;
use crate::model::{Key, ObjectId, Operator, Value};
use crate::object::{Device, GraphObject, Instance, Map, Signal};
use crate::{Error, Result};

pub use plan::Plan;

// ============================================================================
// Items
// ============================================================================

/// Something a list can hold.
pub trait ListItem: Clone + PartialEq {
    /// Handle for directory object `id`; `None` for items that are not
    /// directory objects.
    fn resolve(graph: &Graph, id: ObjectId) -> Option<Self>;

    fn object_id(&self) -> Option<ObjectId>;
}

macro_rules! directory_item {
    ($($ty:ty),+) => {$(
        impl ListItem for $ty {
            fn resolve(graph: &Graph, id: ObjectId) -> Option<Self> {
                Some(<$ty>::from_parts(graph.clone(), id))
            }

            fn object_id(&self) -> Option<ObjectId> {
                Some(self.id())
            }
        }
    )+};
}

directory_item!(Device, Signal, Map);

impl ListItem for Instance {
    fn resolve(_graph: &Graph, _id: ObjectId) -> Option<Self> {
        None
    }

    fn object_id(&self) -> Option<ObjectId> {
        None
    }
}

// ============================================================================
// CursorQuery
// ============================================================================

/// Lazy query over the live directory.
pub struct CursorQuery<T> {
    graph: Graph,
    plan: Plan,
    _item: PhantomData<fn() -> T>,
}

impl<T> Clone for CursorQuery<T> {
    fn clone(&self) -> Self {
        Self { graph: self.graph.clone(), plan: self.plan.clone(), _item: PhantomData }
    }
}

impl<T> std::fmt::Debug for CursorQuery<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorQuery").field("plan", &self.plan).finish()
    }
}

impl<T: ListItem> CursorQuery<T> {
    pub(crate) fn new(graph: Graph, plan: Plan) -> Self {
        Self { graph, plan, _item: PhantomData }
    }

    pub fn graph(&self) -> &Graph { &self.graph }
    pub fn plan(&self) -> &Plan { &self.plan }

    fn ids(&self) -> IndexSet<ObjectId> {
        self.graph.read(|state| self.plan.evaluate(&state.dir))
    }

    /// O(n): evaluates the plan.
    pub fn len(&self) -> usize {
        self.ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// O(n): evaluates the plan.
    pub fn get(&self, index: usize) -> Option<T> {
        let id = *self.ids().get_index(index)?;
        T::resolve(&self.graph, id)
    }

    /// Single-pass iterator over the members as of this call.
    pub fn iter(&self) -> ListIter<T> {
        ListIter { inner: self.to_vec().into_iter() }
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.ids().into_iter().filter_map(|id| T::resolve(&self.graph, id)).collect()
    }

    pub fn contains(&self, item: &T) -> bool {
        item.object_id().is_some_and(|id| self.ids().contains(&id))
    }

    pub fn contains_all(&self, other: &CursorQuery<T>) -> bool {
        let mine = self.ids();
        other.ids().iter().all(|id| mine.contains(id))
    }

    fn combine(
        &mut self,
        other: &CursorQuery<T>,
        node: fn(Box<Plan>, Box<Plan>) -> Plan,
    ) -> Result<&mut Self> {
        if self.graph != other.graph {
            return Err(Error::GraphMismatch);
        }
        let left = Box::new(self.plan.clone());
        self.plan = node(left, Box::new(other.plan.clone()));
        Ok(self)
    }

    /// Union in place.
    pub fn join(&mut self, other: &CursorQuery<T>) -> Result<&mut Self> {
        self.combine(other, Plan::Union)
    }

    pub fn intersect(&mut self, other: &CursorQuery<T>) -> Result<&mut Self> {
        self.combine(other, Plan::Intersection)
    }

    pub fn difference(&mut self, other: &CursorQuery<T>) -> Result<&mut Self> {
        self.combine(other, Plan::Difference)
    }

    /// Narrow to members whose property `key` satisfies `op` against `value`.
    pub fn filter(&mut self, key: impl Into<Key>, value: impl Into<Value>, op: Operator) -> &mut Self {
        let input = Box::new(self.plan.clone());
        self.plan = Plan::Filter { input, key: key.into(), value: value.into(), op };
        self
    }
}

// ============================================================================
// IndexedSnapshot
// ============================================================================

/// Fixed result addressed by index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedSnapshot<T> {
    items: Vec<T>,
}

impl<T: ListItem> IndexedSnapshot<T> {
    pub(crate) fn new(items: Vec<T>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn get(&self, index: usize) -> Option<T> {
        self.items.get(index).cloned()
    }

    /// Walks from index `len-1` down to `0`.
    pub fn iter(&self) -> ListIter<T> {
        ListIter { inner: self.to_vec().into_iter() }
    }

    /// Items in iteration order.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().rev().cloned().collect()
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items.contains(item)
    }
}

// ============================================================================
// List
// ============================================================================

/// Result of every enumeration on the graph and its objects.
#[derive(Debug, Clone)]
pub enum List<T> {
    Cursor(CursorQuery<T>),
    Indexed(IndexedSnapshot<T>),
}

impl<T: ListItem> List<T> {
    pub(crate) fn query(graph: Graph, plan: Plan) -> Self {
        List::Cursor(CursorQuery::new(graph, plan))
    }

    pub(crate) fn snapshot(items: Vec<T>) -> Self {
        List::Indexed(IndexedSnapshot::new(items))
    }

    pub fn is_cursor(&self) -> bool {
        matches!(self, List::Cursor(_))
    }

    pub fn len(&self) -> usize {
        match self {
            List::Cursor(c) => c.len(),
            List::Indexed(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<T> {
        match self {
            List::Cursor(c) => c.get(index),
            List::Indexed(s) => s.get(index),
        }
    }

    pub fn iter(&self) -> ListIter<T> {
        match self {
            List::Cursor(c) => c.iter(),
            List::Indexed(s) => s.iter(),
        }
    }

    pub fn to_vec(&self) -> Vec<T> {
        match self {
            List::Cursor(c) => c.to_vec(),
            List::Indexed(s) => s.to_vec(),
        }
    }

    pub fn contains(&self, item: &T) -> bool {
        match self {
            List::Cursor(c) => c.contains(item),
            List::Indexed(s) => s.contains(item),
        }
    }

    pub fn contains_all(&self, other: &List<T>) -> bool {
        match (self, other) {
            (List::Cursor(a), List::Cursor(b)) => a.contains_all(b),
            _ => other.iter().all(|item| self.contains(&item)),
        }
    }

    fn cursors<'a>(
        &'a mut self,
        other: &'a List<T>,
        op: &str,
    ) -> Result<(&'a mut CursorQuery<T>, &'a CursorQuery<T>)> {
        match (self, other) {
            (List::Cursor(a), List::Cursor(b)) => Ok((a, b)),
            _ => Err(Error::Unsupported(format!("{op} on an indexed snapshot"))),
        }
    }

    /// Union in place.
    pub fn join(&mut self, other: &List<T>) -> Result<&mut Self> {
        let (a, b) = self.cursors(other, "join")?;
        a.join(b)?;
        Ok(self)
    }

    pub fn intersect(&mut self, other: &List<T>) -> Result<&mut Self> {
        let (a, b) = self.cursors(other, "intersect")?;
        a.intersect(b)?;
        Ok(self)
    }

    pub fn difference(&mut self, other: &List<T>) -> Result<&mut Self> {
        let (a, b) = self.cursors(other, "difference")?;
        a.difference(b)?;
        Ok(self)
    }

    pub fn filter(&mut self, key: impl Into<Key>, value: impl Into<Value>, op: Operator) -> Result<&mut Self> {
        match self {
            List::Cursor(c) => {
                c.filter(key, value, op);
            }
            List::Indexed(_) => {
                return Err(Error::Unsupported("filter on an indexed snapshot".into()));
            }
        }
        Ok(self)
    }
}

impl<'a, T: ListItem> IntoIterator for &'a List<T> {
    type Item = T;
    type IntoIter = ListIter<T>;

    fn into_iter(self) -> ListIter<T> {
        self.iter()
    }
}

/// Iterator handed out by `List::iter`.
#[derive(Debug)]
pub struct ListIter<T> {
    inner: std::vec::IntoIter<T>,
}

impl<T> Iterator for ListIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<T> ExactSizeIterator for ListIter<T> {}
