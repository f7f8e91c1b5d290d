//! Render object lifecycle

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a [`StitchRenderer`](super::StitchRenderer).
///
/// `UnCreated → Created → Inited → SceneCreated`; any state may fall into
/// `Error`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderState {
    UnCreated,
    /// Profile loaded, scheduler thread running
    Created,
    /// Graphics context acquired on the scheduler thread
    Inited,
    /// A scene exists for the current pano type and input size
    SceneCreated,
    Error,
}

impl RenderState {
    fn to_u8(self) -> u8 {
        match self {
            RenderState::UnCreated => 0,
            RenderState::Created => 1,
            RenderState::Inited => 2,
            RenderState::SceneCreated => 3,
            RenderState::Error => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => RenderState::UnCreated,
            1 => RenderState::Created,
            2 => RenderState::Inited,
            3 => RenderState::SceneCreated,
            _ => RenderState::Error,
        }
    }

    /// The graphics context exists
    pub fn is_inited(self) -> bool {
        matches!(self, RenderState::Inited | RenderState::SceneCreated)
    }
}

/// Render state shared between the control surface and the scheduler
#[derive(Debug)]
pub struct AtomicRenderState(AtomicU8);

impl AtomicRenderState {
    pub fn new(state: RenderState) -> Self {
        Self(AtomicU8::new(state.to_u8()))
    }

    pub fn get(&self) -> RenderState {
        RenderState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next`. Leaving `Error` is refused; returns the state now held.
    pub fn transition(&self, next: RenderState) -> RenderState {
        let result = self.0.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (RenderState::from_u8(current) != RenderState::Error).then_some(next.to_u8())
        });
        match result {
            Ok(_) => next,
            Err(_) => RenderState::Error,
        }
    }

    pub fn fail(&self) {
        self.0.store(RenderState::Error.to_u8(), Ordering::Release);
    }
}
