//! Element identity mapping.
//!
//! The tree stores opaque 64-bit ids only. An [`ElementMapper`] translates
//! between those ids and the caller's elements, and reports each element's
//! envelope. Mappers are created by the caller, handed to the index as an
//! `Arc`, outlive the index, and are flushed/closed by the caller.

mod file;
mod memory;

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

pub use file::FileElementMapper;
pub use memory::MemoryElementMapper;

use crate::envelope::Envelope;
use crate::rtree::{ElementId, SpatialResult};

/// Elements that know their own bounding box.
pub trait SpatialElement {
    fn envelope(&self) -> Envelope;
}

/// Computes an element's envelope for mappers whose elements do not
/// implement [`SpatialElement`].
pub type EnvelopeFn<E> = Arc<dyn Fn(&E) -> SpatialResult<Envelope> + Send + Sync>;

/// Bidirectional mapping between elements and the ids stored in the tree.
///
/// Ids are assigned on first sight, increase monotonically and are never
/// reused for a different element.
pub trait ElementMapper: Send + Sync {
    type Element;

    /// Returns the id of `element`, assigning a new one on first sight.
    fn id_of(&self, element: &Self::Element) -> SpatialResult<ElementId>;

    /// Returns the id of `element` without assigning one.
    fn find_id(&self, element: &Self::Element) -> SpatialResult<Option<ElementId>>;

    /// Resolves an id back to its element. Unknown ids are `NotFound`.
    fn element_of(&self, id: ElementId) -> SpatialResult<Self::Element>;

    fn envelope_of(&self, element: &Self::Element) -> SpatialResult<Envelope>;

    fn flush(&self) -> SpatialResult<()> {
        Ok(())
    }

    fn close(&self) -> SpatialResult<()> {
        self.flush()
    }
}

/// Maps shared by the in-memory and file-backed mappers.
#[derive(Debug, Clone)]
pub(crate) struct MapperState<E> {
    by_element: HashMap<E, ElementId>,
    by_id: HashMap<ElementId, E>,
    next_id: ElementId,
}

impl<E: Clone + Eq + Hash> MapperState<E> {
    pub(crate) fn new() -> Self {
        Self {
            by_element: HashMap::new(),
            by_id: HashMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn from_entries(next_id: ElementId, entries: Vec<(ElementId, E)>) -> Self {
        let mut state = Self::new();
        for (id, element) in entries {
            state.by_element.insert(element.clone(), id);
            state.by_id.insert(id, element);
            state.next_id = state.next_id.max(id + 1);
        }
        state.next_id = state.next_id.max(next_id);
        state
    }

    /// Returns `(id, newly_assigned)`.
    pub(crate) fn id_of(&mut self, element: &E) -> (ElementId, bool) {
        if let Some(id) = self.by_element.get(element) {
            return (*id, false);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.by_element.insert(element.clone(), id);
        self.by_id.insert(id, element.clone());
        (id, true)
    }

    pub(crate) fn find_id(&self, element: &E) -> Option<ElementId> {
        self.by_element.get(element).copied()
    }

    pub(crate) fn element_of(&self, id: ElementId) -> Option<&E> {
        self.by_id.get(&id)
    }

    pub(crate) fn next_id(&self) -> ElementId {
        self.next_id
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    /// All mappings ordered by id.
    pub(crate) fn entries(&self) -> Vec<(ElementId, &E)> {
        let mut entries: Vec<(ElementId, &E)> =
            self.by_id.iter().map(|(id, e)| (*id, e)).collect();
        entries.sort_unstable_by_key(|(id, _)| *id);
        entries
    }
}
