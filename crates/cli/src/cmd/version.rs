//! Implementation of the `lectern version` command.

use anyhow::Result;

use crate::cmd::GlobalArgs;

/// Print our own version plus whatever the backend runtime reports.
pub async fn cmd_version(args: &GlobalArgs) -> Result<()> {
  println!("lectern {}", env!("CARGO_PKG_VERSION"));
  let settings = args.load_settings()?;
  let (name, backend) = args.make_backend(&settings)?;
  match backend.version_info().await {
    Ok(info) => {
      println!();
      println!("{info}");
    }
    Err(error) => {
      println!();
      println!("backend '{name}' unavailable: {error}");
    }
  }
  Ok(())
}
