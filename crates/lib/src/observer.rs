//! Build progress protocol: a phase/step state machine feeding an
//! [`EventSink`].
//!
//! The [`BuildObserver`] owns the state; consumers only implement the
//! sink. State mutation happens on the orchestration thread, but sinks
//! take `&self` so a queue-backed consumer (a GUI draining on a timer)
//! can hand events across threads.

use std::collections::HashMap;

use crate::backend::BuildResult;

/// Top-level build stage. Advances one way, never revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
  None,
  Prepare,
  Build,
  Done,
}

impl std::fmt::Display for Phase {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Phase::None => "NONE",
      Phase::Prepare => "PREPARE",
      Phase::Build => "BUILD",
      Phase::Done => "DONE",
    };
    f.write_str(name)
  }
}

/// Per-step state, scoped to the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
  Unknown,
  NotStarted,
  Preflight,
  Pending,
  Running,
  Postflight,
  Stopping,
  Succeeded,
  Failed,
  Cancelled,
}

impl StepState {
  /// Terminal states are sticky until the next phase reset, so a late
  /// async update cannot clobber an outcome.
  pub fn is_terminal(self) -> bool {
    matches!(self, StepState::Succeeded | StepState::Failed | StepState::Cancelled)
  }
}

impl std::fmt::Display for StepState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      StepState::Unknown => "UNKNOWN",
      StepState::NotStarted => "NOTSTARTED",
      StepState::Preflight => "PREFLIGHT",
      StepState::Pending => "PENDING",
      StepState::Running => "RUNNING",
      StepState::Postflight => "POSTFLIGHT",
      StepState::Stopping => "STOPPING",
      StepState::Succeeded => "SUCCEEDED",
      StepState::Failed => "FAILED",
      StepState::Cancelled => "CANCELLED",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
  PhaseUpdate,
  StateUpdate,
  ManagerMsg,
  ContainerMsg,
}

/// One emitted progress event.
#[derive(Debug, Clone)]
pub struct Event {
  pub phase: Phase,
  pub kind: EventKind,
  pub step: Option<usize>,
  pub state: StepState,
  pub data: Option<String>,
}

/// Receives emitted events. Implementations must tolerate being called
/// from a thread other than the one consuming them.
pub trait EventSink: Send {
  fn message(&self, event: Event);
}

/// A sink that drops everything. Useful for tests and non-interactive
/// callers.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
  fn message(&self, _event: Event) {}
}

/// The phase/step state machine. All updates flow through here; the
/// sink only sees consistent transitions.
pub struct BuildObserver {
  phase: Phase,
  states: HashMap<usize, StepState>,
  sink: Box<dyn EventSink>,
}

impl BuildObserver {
  pub fn new(sink: Box<dyn EventSink>) -> Self {
    Self {
      phase: Phase::None,
      states: HashMap::new(),
      sink,
    }
  }

  pub fn phase(&self) -> Phase {
    self.phase
  }

  pub fn step_state(&self, step: usize) -> StepState {
    self.states.get(&step).copied().unwrap_or(StepState::Unknown)
  }

  pub fn enter_prepare(&mut self) {
    self.advance(Phase::Prepare, None);
  }

  pub fn enter_build(&mut self) {
    self.advance(Phase::Build, None);
  }

  pub fn done(&mut self, result: &BuildResult) {
    let data = if result.ok {
      Some("build ok".to_string())
    } else if result.is_cancelled() {
      Some("build cancelled".to_string())
    } else {
      Some(match &result.error {
        Some(error) => format!("build failed with code {}: {}", result.code, error),
        None => format!("build failed with code {}", result.code),
      })
    };
    self.advance(Phase::Done, data);
  }

  pub fn step_preflight(&mut self, step: usize) {
    self.update(step, StepState::Preflight);
  }

  pub fn step_pending(&mut self, step: usize) {
    self.update(step, StepState::Pending);
  }

  pub fn step_running(&mut self, step: usize) {
    self.update(step, StepState::Running);
  }

  pub fn step_postflight(&mut self, step: usize) {
    self.update(step, StepState::Postflight);
  }

  pub fn step_stopping(&mut self, step: usize) {
    self.update(step, StepState::Stopping);
  }

  pub fn step_succeeded(&mut self, step: usize) {
    self.update(step, StepState::Succeeded);
  }

  pub fn step_failed(&mut self, step: usize) {
    self.update(step, StepState::Failed);
  }

  pub fn step_cancelled(&mut self, step: usize) {
    self.update(step, StepState::Cancelled);
  }

  /// Attach a line from the build manager to the step's current state.
  pub fn manager_msg(&mut self, step: usize, msg: impl Into<String>) {
    self.emit_msg(EventKind::ManagerMsg, step, msg.into());
  }

  /// Attach a line of container output to the step's current state.
  pub fn container_msg(&mut self, step: usize, msg: impl Into<String>) {
    self.emit_msg(EventKind::ContainerMsg, step, msg.into());
  }

  /// Map a finished [`BuildResult`] onto step states: an ok result
  /// marks every tracked step succeeded, otherwise the responsible
  /// step is marked cancelled or failed.
  pub fn result_msg(&mut self, result: &BuildResult) {
    if result.ok {
      let mut steps: Vec<usize> = self.states.keys().copied().collect();
      steps.sort_unstable();
      for step in steps {
        self.update(step, StepState::Succeeded);
      }
    } else if let Some(step) = result.step {
      if result.is_cancelled() {
        self.update(step, StepState::Cancelled);
      } else {
        self.update(step, StepState::Failed);
      }
    }
  }

  fn advance(&mut self, phase: Phase, data: Option<String>) {
    if phase <= self.phase {
      return;
    }
    self.phase = phase;
    for state in self.states.values_mut() {
      *state = StepState::NotStarted;
    }
    self.sink.message(Event {
      phase,
      kind: EventKind::PhaseUpdate,
      step: None,
      state: StepState::Unknown,
      data,
    });
  }

  fn update(&mut self, step: usize, state: StepState) {
    assert!(
      self.phase != Phase::None,
      "step state update for step {step} before any phase was entered"
    );
    let current = self.states.entry(step).or_insert(StepState::NotStarted);
    if *current == state || current.is_terminal() {
      return;
    }
    *current = state;
    self.sink.message(Event {
      phase: self.phase,
      kind: EventKind::StateUpdate,
      step: Some(step),
      state,
      data: None,
    });
  }

  fn emit_msg(&mut self, kind: EventKind, step: usize, msg: String) {
    assert!(
      self.phase != Phase::None,
      "message for step {step} before any phase was entered"
    );
    let state = self.step_state(step);
    self.sink.message(Event {
      phase: self.phase,
      kind,
      step: Some(step),
      state,
      data: Some(msg),
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::{Arc, Mutex};

  /// Sink recording every event for assertions.
  #[derive(Clone, Default)]
  pub(crate) struct RecordingSink {
    events: Arc<Mutex<Vec<Event>>>,
  }

  impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<Event> {
      self.events.lock().unwrap().clone()
    }
  }

  impl EventSink for RecordingSink {
    fn message(&self, event: Event) {
      self.events.lock().unwrap().push(event);
    }
  }

  fn observer() -> (BuildObserver, RecordingSink) {
    let sink = RecordingSink::default();
    (BuildObserver::new(Box::new(sink.clone())), sink)
  }

  #[test]
  #[should_panic(expected = "before any phase was entered")]
  fn step_update_before_phase_entry_is_a_contract_violation() {
    let (mut obs, _sink) = observer();
    obs.step_running(0);
  }

  #[test]
  fn phases_advance_one_way() {
    let (mut obs, sink) = observer();
    obs.enter_prepare();
    obs.enter_prepare();
    assert_eq!(obs.phase(), Phase::Prepare);
    obs.enter_build();
    obs.enter_prepare();
    assert_eq!(obs.phase(), Phase::Build);
    // one event per actual transition
    assert_eq!(sink.events().len(), 2);
  }

  #[test]
  fn phase_change_resets_step_states() {
    let (mut obs, _sink) = observer();
    obs.enter_prepare();
    obs.step_succeeded(0);
    obs.enter_build();
    assert_eq!(obs.step_state(0), StepState::NotStarted);
    // terminal stickiness does not survive the reset
    obs.step_running(0);
    assert_eq!(obs.step_state(0), StepState::Running);
  }

  #[test]
  fn terminal_states_are_sticky_within_a_phase() {
    let (mut obs, sink) = observer();
    obs.enter_prepare();
    obs.step_succeeded(1);
    let before = sink.events().len();
    obs.step_failed(1);
    assert_eq!(obs.step_state(1), StepState::Succeeded);
    assert_eq!(sink.events().len(), before);
  }

  #[test]
  fn same_state_transition_is_a_no_op() {
    let (mut obs, sink) = observer();
    obs.enter_build();
    obs.step_running(0);
    let before = sink.events().len();
    obs.step_running(0);
    assert_eq!(sink.events().len(), before);
  }

  #[test]
  fn messages_attach_current_state_without_changing_it() {
    let (mut obs, sink) = observer();
    obs.enter_build();
    obs.step_running(2);
    obs.container_msg(2, "hello");
    let events = sink.events();
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::ContainerMsg);
    assert_eq!(last.step, Some(2));
    assert_eq!(last.state, StepState::Running);
    assert_eq!(last.data.as_deref(), Some("hello"));
    assert_eq!(obs.step_state(2), StepState::Running);
  }

  #[test]
  fn ok_result_marks_all_tracked_steps_succeeded() {
    let (mut obs, _sink) = observer();
    obs.enter_build();
    obs.step_running(0);
    obs.step_running(1);
    obs.result_msg(&BuildResult::success());
    assert_eq!(obs.step_state(0), StepState::Succeeded);
    assert_eq!(obs.step_state(1), StepState::Succeeded);
  }

  #[test]
  fn failed_result_marks_the_responsible_step() {
    let (mut obs, _sink) = observer();
    obs.enter_build();
    obs.step_running(1);
    obs.result_msg(&BuildResult::failed(3, None, 1));
    assert_eq!(obs.step_state(1), StepState::Failed);
  }

  #[test]
  fn cancelled_result_marks_the_responsible_step() {
    let (mut obs, _sink) = observer();
    obs.enter_build();
    obs.step_running(0);
    obs.result_msg(&BuildResult::cancelled(Some(0)));
    assert_eq!(obs.step_state(0), StepState::Cancelled);
  }

  #[test]
  fn done_reports_through_phase_update() {
    let (mut obs, sink) = observer();
    obs.enter_prepare();
    obs.enter_build();
    obs.done(&BuildResult::failed(3, Some("boom".to_string()), 1));
    let events = sink.events();
    let last = events.last().unwrap();
    assert_eq!(last.phase, Phase::Done);
    assert_eq!(last.kind, EventKind::PhaseUpdate);
    assert!(last.data.as_deref().unwrap().contains("code 3"));
  }

  #[test]
  fn untracked_step_reports_unknown_state() {
    let (obs, _sink) = observer();
    assert_eq!(obs.step_state(9), StepState::Unknown);
  }
}
