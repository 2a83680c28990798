//! Implementation of the `lectern steps` command.

use anyhow::Result;
use owo_colors::{OwoColorize, Stream};

use lectern_lib::builder::Builder;
use lectern_lib::step::StepCommand;

use crate::cmd::GlobalArgs;

/// List the project's steps after normalization, one line each.
pub fn cmd_steps(args: &GlobalArgs) -> Result<()> {
  let (dir, project) = args.load_project()?;
  let settings = args.load_settings()?;
  let (_, backend) = args.make_backend(&settings)?;

  let mut env = settings.environment;
  env.extend(project.environment);
  let builder = Builder::new(dir, project.steps, env, backend);

  let steps = builder.get_steps(&[])?;
  if steps.is_empty() {
    println!("no steps defined");
    return Ok(());
  }
  for step in steps {
    let name = step.name.as_deref().unwrap_or("-");
    let command = match &step.command {
      Some(StepCommand::Line(line)) => line.clone(),
      Some(StepCommand::Args(step_args)) => step_args.join(" "),
      None => String::new(),
    };
    println!(
      "{} {} {} {}",
      step.index.if_supports_color(Stream::Stdout, |s| s.dimmed()),
      name.if_supports_color(Stream::Stdout, |s| s.cyan()),
      step.image,
      command.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    );
  }
  Ok(())
}
