//! Implementation of the `lectern verify` command.

use anyhow::Result;
use owo_colors::{OwoColorize, Stream};

use crate::cmd::GlobalArgs;

/// Check that the backend runtime is reachable.
pub async fn cmd_verify(args: &GlobalArgs) -> Result<()> {
  let settings = args.load_settings()?;
  let (name, backend) = args.make_backend(&settings)?;
  backend.verify().await?;
  println!(
    "{} backend '{name}' is ready",
    "✓".if_supports_color(Stream::Stdout, |s| s.green())
  );
  Ok(())
}
