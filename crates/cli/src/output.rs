//! Terminal rendering of build progress.
//!
//! Implements the library's [`EventSink`] for an interactive terminal:
//! one line per state change or message, prefixed with the phase and
//! step number. Container output is passed through with a `>>` marker
//! so it stays distinguishable from runner messages.

use lectern_lib::observer::{Event, EventKind, EventSink, StepState};
use owo_colors::{OwoColorize, Stream};

/// Prints events to stdout as they arrive.
#[derive(Debug, Default)]
pub struct StreamSink;

impl StreamSink {
  fn prefix(event: &Event) -> String {
    match event.step {
      Some(step) => format!("{} {}", event.phase, step),
      None => event.phase.to_string(),
    }
  }
}

impl EventSink for StreamSink {
  fn message(&self, event: Event) {
    match event.kind {
      // phase transitions are visible through the step lines already
      EventKind::PhaseUpdate => {}
      EventKind::StateUpdate => {
        let state = event.state.to_string().to_lowercase();
        let line = format!("{} {}", Self::prefix(&event), state);
        match event.state {
          StepState::Succeeded => {
            println!("{}", line.if_supports_color(Stream::Stdout, |s| s.green()));
          }
          StepState::Failed => {
            println!("{}", line.if_supports_color(Stream::Stdout, |s| s.red()));
          }
          StepState::Cancelled | StepState::Stopping => {
            println!("{}", line.if_supports_color(Stream::Stdout, |s| s.yellow()));
          }
          _ => println!("{line}"),
        }
      }
      EventKind::ManagerMsg => {
        let data = event.data.as_deref().unwrap_or_default();
        println!(
          "{} : {}",
          Self::prefix(&event).if_supports_color(Stream::Stdout, |s| s.cyan()),
          data.trim_end()
        );
      }
      EventKind::ContainerMsg => {
        let data = event.data.as_deref().unwrap_or_default();
        println!(
          "{} {} {}",
          Self::prefix(&event).if_supports_color(Stream::Stdout, |s| s.dimmed()),
          ">>".if_supports_color(Stream::Stdout, |s| s.dimmed()),
          data.trim_end()
        );
      }
    }
  }
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    "error:".if_supports_color(Stream::Stderr, |s| s.red()),
    message
  );
}
