//! Script backend: writes the body to the module directory and runs it
//! under an interpreter

use super::process::{self, ProcessHandle};
use crate::modules::ModuleError;
use std::collections::BTreeMap;
use std::path::Path;

const SCRIPT_FILE: &str = "module.script";

pub(super) async fn start(
    interpreter: &str,
    body: &str,
    args: &[String],
    env: &BTreeMap<String, String>,
    dir: &Path,
) -> Result<ProcessHandle, ModuleError> {
    let path = dir.join(SCRIPT_FILE);
    tokio::fs::write(&path, body)
        .await
        .map_err(|e| ModuleError::StartFailed(format!("cannot write {}: {}", path.display(), e)))?;

    // The interpreter runs inside `dir`, so name the script relative to it
    let mut argv = Vec::with_capacity(args.len() + 1);
    argv.push(format!("./{}", SCRIPT_FILE));
    argv.extend(args.iter().cloned());
    process::spawn(interpreter, &argv, env, dir)
}
