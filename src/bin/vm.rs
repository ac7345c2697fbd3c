//! A thin driver: install the logger, read configuration and the image
//! path from the environment, build the scheduler, load the image, run the
//! main process to completion, and map the outcome to an exit code (§9.3).

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use nimbus_vm::config::Config;
use nimbus_vm::error::{exit_code, VmError};
use nimbus_vm::loader;
use nimbus_vm::scheduler::Scheduler;

fn run() -> Result<(), VmError> {
    let config = Config::from_env()?;

    let image_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("image.nimb"));
    log::info!(target: "nimbus_vm", "loading image {}", image_path.display());

    let image = Arc::new(loader::load_file(&image_path)?);
    let scheduler = Scheduler::new(Arc::clone(&image), config);

    let entry_module = &image.modules[image.entry_module];
    scheduler.spawn_process(Arc::new(entry_module.clone()), true);

    match scheduler.run_to_completion() {
        None => Ok(()),
        Some(panic) => {
            log::error!(target: "nimbus_vm", "main process panicked: {}", panic.message);
            for frame in &panic.trace {
                log::error!(target: "nimbus_vm", "  at {frame}");
            }
            Err(VmError::MainPanic(panic.message))
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();

    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(err) => {
            log::error!(target: "nimbus_vm", "{err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}
