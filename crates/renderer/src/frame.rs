//! Frame lifecycle state and per-frame bookkeeping.
//!
//! # Overview
//!
//! - [`FrameState`] / [`FrameStateMachine`] validate the order of frontend
//!   calls and own the frame-slot counter
//! - [`BindTracker`] elides redundant pipeline, material and mesh binds
//! - [`FrameStats`] counts the work recorded in one frame
//!
//! ```text
//! Idle -> FrameBegun -> Recording -> Submitted -> Presented -> Idle
//!              \______________\_________________________________/
//!                             abort
//! ```

use tracing::trace;

use crate::error::{RenderError, RenderResult};

/// Lifecycle state of the frame being produced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FrameState {
    /// No frame in progress.
    #[default]
    Idle,
    /// Image acquired, fence reset, command buffer begun.
    FrameBegun,
    /// Dynamic-rendering scope open, draws may be recorded.
    Recording,
    /// Command buffer submitted to the graphics queue.
    Submitted,
    /// Present queued; the slot is about to advance.
    Presented,
}

impl FrameState {
    /// Returns true if `self -> next` is a legal forward step.
    pub fn can_transition_to(self, next: FrameState) -> bool {
        matches!(
            (self, next),
            (FrameState::Idle, FrameState::FrameBegun)
                | (FrameState::FrameBegun, FrameState::Recording)
                | (FrameState::FrameBegun, FrameState::Submitted)
                | (FrameState::Recording, FrameState::Submitted)
                | (FrameState::Submitted, FrameState::Presented)
                | (FrameState::Presented, FrameState::Idle)
        )
    }

    /// True between `begin_frame` and submission, when commands may be recorded.
    #[inline]
    pub fn accepts_commands(self) -> bool {
        matches!(self, FrameState::FrameBegun | FrameState::Recording)
    }
}

/// Validates frame transitions and tracks the frame-in-flight slot.
#[derive(Debug)]
pub struct FrameStateMachine {
    state: FrameState,
    slot: usize,
    frames_in_flight: usize,
    frame_number: u64,
}

impl FrameStateMachine {
    /// Creates a machine in [`FrameState::Idle`] at slot 0.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            state: FrameState::Idle,
            slot: 0,
            frames_in_flight: frames_in_flight.max(1),
            frame_number: 0,
        }
    }

    /// Moves to `next`.
    ///
    /// Entering [`FrameState::Idle`] from [`FrameState::Presented`] advances
    /// the slot to `(slot + 1) % frames_in_flight`.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::IllegalTransition`] and leaves the state
    /// unchanged if the step is not legal.
    pub fn transition(&mut self, next: FrameState) -> RenderResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(RenderError::IllegalTransition {
                from: self.state,
                to: next,
            });
        }

        trace!("Frame state {:?} -> {:?}", self.state, next);
        if next == FrameState::Idle {
            self.slot = (self.slot + 1) % self.frames_in_flight;
            self.frame_number += 1;
        }
        self.state = next;
        Ok(())
    }

    /// Returns to [`FrameState::Idle`] without advancing the slot.
    ///
    /// Used when a frame is abandoned before submission (swapchain out of
    /// date, recording error). Abandoning after submission is not allowed
    /// because the slot's fence is already pending.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::IllegalTransition`] from `Submitted`/`Presented`.
    pub fn abort(&mut self) -> RenderResult<()> {
        match self.state {
            FrameState::Idle => Ok(()),
            FrameState::FrameBegun | FrameState::Recording => {
                trace!("Frame aborted in state {:?}", self.state);
                self.state = FrameState::Idle;
                Ok(())
            }
            from => Err(RenderError::IllegalTransition {
                from,
                to: FrameState::Idle,
            }),
        }
    }

    #[inline]
    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Current frame-in-flight slot.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Number of frames completed since creation.
    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    #[inline]
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }
}

/// Counters for the work recorded during one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub draw_calls: u32,
    pub instances: u32,
    pub dispatches: u32,
    pub pipeline_binds: u32,
    pub material_binds: u32,
    pub mesh_binds: u32,
    /// Bind requests skipped because the object was already bound.
    pub redundant_binds: u32,
}

/// Remembers the last bound program, material and mesh within a frame.
///
/// Objects are identified by the ids handed out by [`crate::next_object_id`].
/// Binding a different program invalidates the material, because descriptor
/// sets must be rebound against the new pipeline layout.
#[derive(Debug, Default)]
pub struct BindTracker {
    program: Option<u64>,
    material: Option<u64>,
    mesh: Option<u64>,
}

impl BindTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a program bind. Returns true if the bind must be issued.
    pub fn bind_program(&mut self, id: u64) -> bool {
        if self.program == Some(id) {
            return false;
        }
        self.program = Some(id);
        self.material = None;
        true
    }

    /// Records a material bind. Returns true if the bind must be issued.
    pub fn bind_material(&mut self, id: u64) -> bool {
        if self.material == Some(id) {
            return false;
        }
        self.material = Some(id);
        true
    }

    /// Records a mesh bind. Returns true if the bind must be issued.
    pub fn bind_mesh(&mut self, id: u64) -> bool {
        if self.mesh == Some(id) {
            return false;
        }
        self.mesh = Some(id);
        true
    }

    /// Last bound program id.
    #[inline]
    pub fn program(&self) -> Option<u64> {
        self.program
    }

    /// Last bound mesh id.
    #[inline]
    pub fn mesh(&self) -> Option<u64> {
        self.mesh
    }

    /// Forgets everything; called at the start of each frame.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_frame(machine: &mut FrameStateMachine) {
        machine.transition(FrameState::FrameBegun).unwrap();
        machine.transition(FrameState::Recording).unwrap();
        machine.transition(FrameState::Submitted).unwrap();
        machine.transition(FrameState::Presented).unwrap();
        machine.transition(FrameState::Idle).unwrap();
    }

    #[test]
    fn test_full_cycle_advances_slot() {
        let mut machine = FrameStateMachine::new(2);
        let mut slots = vec![machine.slot()];
        for _ in 0..3 {
            run_frame(&mut machine);
            slots.push(machine.slot());
        }
        assert_eq!(slots, vec![0, 1, 0, 1]);
        assert_eq!(machine.frame_number(), 3);
        assert_eq!(machine.state(), FrameState::Idle);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut machine = FrameStateMachine::new(2);
        let err = machine.transition(FrameState::Submitted).unwrap_err();
        assert!(matches!(
            err,
            RenderError::IllegalTransition {
                from: FrameState::Idle,
                to: FrameState::Submitted
            }
        ));
        assert_eq!(machine.state(), FrameState::Idle);
    }

    #[test]
    fn test_double_begin_rejected() {
        let mut machine = FrameStateMachine::new(2);
        machine.transition(FrameState::FrameBegun).unwrap();
        assert!(machine.transition(FrameState::FrameBegun).is_err());
    }

    #[test]
    fn test_frame_without_clear_can_submit() {
        let mut machine = FrameStateMachine::new(2);
        machine.transition(FrameState::FrameBegun).unwrap();
        machine.transition(FrameState::Submitted).unwrap();
        machine.transition(FrameState::Presented).unwrap();
        machine.transition(FrameState::Idle).unwrap();
        assert_eq!(machine.slot(), 1);
    }

    #[test]
    fn test_abort_keeps_slot() {
        let mut machine = FrameStateMachine::new(2);
        machine.transition(FrameState::FrameBegun).unwrap();
        machine.transition(FrameState::Recording).unwrap();
        machine.abort().unwrap();
        assert_eq!(machine.state(), FrameState::Idle);
        assert_eq!(machine.slot(), 0);
    }

    #[test]
    fn test_abort_after_submit_rejected() {
        let mut machine = FrameStateMachine::new(2);
        machine.transition(FrameState::FrameBegun).unwrap();
        machine.transition(FrameState::Submitted).unwrap();
        assert!(machine.abort().is_err());
        assert_eq!(machine.state(), FrameState::Submitted);
    }

    #[test]
    fn test_accepts_commands() {
        assert!(!FrameState::Idle.accepts_commands());
        assert!(FrameState::FrameBegun.accepts_commands());
        assert!(FrameState::Recording.accepts_commands());
        assert!(!FrameState::Submitted.accepts_commands());
    }

    #[test]
    fn test_bind_tracker_elides_repeats() {
        let mut tracker = BindTracker::new();
        assert!(tracker.bind_program(1));
        assert!(!tracker.bind_program(1));
        assert!(tracker.bind_material(10));
        assert!(!tracker.bind_material(10));
        assert!(tracker.bind_mesh(100));
        assert!(!tracker.bind_mesh(100));
        assert!(tracker.bind_mesh(101));
    }

    #[test]
    fn test_program_change_invalidates_material() {
        let mut tracker = BindTracker::new();
        tracker.bind_program(1);
        tracker.bind_material(10);
        assert!(tracker.bind_program(2));
        assert!(tracker.bind_material(10));
    }

    #[test]
    fn test_bind_tracker_reset() {
        let mut tracker = BindTracker::new();
        tracker.bind_program(1);
        tracker.bind_mesh(5);
        tracker.reset();
        assert_eq!(tracker.program(), None);
        assert_eq!(tracker.mesh(), None);
        assert!(tracker.bind_program(1));
    }
}
