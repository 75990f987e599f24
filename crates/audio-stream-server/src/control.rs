//! Operator controls: `q` on stdin and Ctrl-C both stop the server.

use std::io::BufRead;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;

use crate::manager::Control;

/// Read stdin on a background thread and send [`Control::Quit`] when the operator enters `q`.
///
/// The thread exits on quit or when stdin closes; a closed stdin does not stop the server.
pub fn spawn_operator_input(control: Sender<Control>) -> Result<()> {
    std::thread::Builder::new()
        .name("operator-input".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            watch_for_quit(stdin.lock(), &control);
        })
        .context("spawn operator input thread")?;
    Ok(())
}

/// Translate Ctrl-C into a graceful [`Control::Quit`].
pub fn install_interrupt_handler(control: Sender<Control>) -> Result<()> {
    ctrlc::set_handler(move || {
        tracing::info!("interrupt received");
        let _ = control.send(Control::Quit);
    })
    .context("install Ctrl-C handler")
}

fn watch_for_quit(input: impl BufRead, control: &Sender<Control>) {
    for line in input.lines() {
        let Ok(line) = line else {
            break;
        };
        if is_quit(&line) {
            let _ = control.send(Control::Quit);
            return;
        }
        if !line.trim().is_empty() {
            tracing::info!("press q then enter to stop the server");
        }
    }
    tracing::debug!("operator input closed");
}

fn is_quit(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case("q")
}
