use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{ElementMapper, EnvelopeFn, MapperState, SpatialElement};
use crate::envelope::Envelope;
use crate::rtree::{ElementId, SpatialError, SpatialResult};

/// Process-lifetime element mapper. Nothing survives the process; pair it
/// with in-memory indexes or indexes that are rebuilt on start-up.
pub struct MemoryElementMapper<E> {
    state: RwLock<MapperState<E>>,
    envelope_fn: EnvelopeFn<E>,
    closed: AtomicBool,
}

impl<E> MemoryElementMapper<E>
where
    E: SpatialElement + Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_envelope_fn(|element: &E| Ok(element.envelope()))
    }
}

impl<E> Default for MemoryElementMapper<E>
where
    E: SpatialElement + Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> MemoryElementMapper<E>
where
    E: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// Mapper for elements whose envelope is computed by `envelope_fn`.
    pub fn with_envelope_fn<F>(envelope_fn: F) -> Self
    where
        F: Fn(&E) -> SpatialResult<Envelope> + Send + Sync + 'static,
    {
        Self {
            state: RwLock::new(MapperState::new()),
            envelope_fn: Arc::new(envelope_fn),
            closed: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> SpatialResult<()> {
        if self.is_closed() {
            Err(SpatialError::Closed)
        } else {
            Ok(())
        }
    }
}

impl<E> ElementMapper for MemoryElementMapper<E>
where
    E: Clone + Eq + Hash + Send + Sync + 'static,
{
    type Element = E;

    fn id_of(&self, element: &E) -> SpatialResult<ElementId> {
        self.ensure_open()?;
        if let Some(id) = self.state.read().find_id(element) {
            return Ok(id);
        }
        Ok(self.state.write().id_of(element).0)
    }

    fn find_id(&self, element: &E) -> SpatialResult<Option<ElementId>> {
        self.ensure_open()?;
        Ok(self.state.read().find_id(element))
    }

    fn element_of(&self, id: ElementId) -> SpatialResult<E> {
        self.ensure_open()?;
        self.state
            .read()
            .element_of(id)
            .cloned()
            .ok_or_else(|| SpatialError::NotFound(format!("no element with id {}", id)))
    }

    fn envelope_of(&self, element: &E) -> SpatialResult<Envelope> {
        self.ensure_open()?;
        (self.envelope_fn)(element)
    }

    fn flush(&self) -> SpatialResult<()> {
        self.ensure_open()
    }

    fn close(&self) -> SpatialResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(SpatialError::Closed);
        }
        Ok(())
    }
}
