//! Implementation of the `lectern cleanup` command.

use anyhow::Result;

use crate::cmd::GlobalArgs;

/// Remove leftover containers from previous runs. Only expired ones
/// are reaped unless `force`.
pub async fn cmd_cleanup(args: &GlobalArgs, force: bool) -> Result<()> {
  let settings = args.load_settings()?;
  let (_, backend) = args.make_backend(&settings)?;
  backend.cleanup(force).await?;
  Ok(())
}
