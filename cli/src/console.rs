//! Console rendering of session events.

use std::sync::Mutex;

use tether_session::{ServerErrorInfo, ServerState, SessionError, SessionObserver, StatusUpdate};

/// Prints state transitions, start failures and server errors to stdout.
#[derive(Default)]
pub struct ConsoleObserver {
    last_state: Mutex<ServerState>,
}

impl ConsoleObserver {
    /// The line to print for `update`, if its state differs from the last one
    /// printed.
    fn transition(&self, update: &StatusUpdate) -> Option<String> {
        let mut last = self
            .last_state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *last == update.state {
            return None;
        }
        *last = update.state;
        Some(format!("server: {}", update.status_line()))
    }
}

impl SessionObserver for ConsoleObserver {
    fn on_status(&self, update: &StatusUpdate) {
        if let Some(line) = self.transition(update) {
            println!("{line}");
        }
    }

    fn on_server_error(&self, error: &ServerErrorInfo) {
        print!("{}", render_server_error(error));
    }

    fn on_started(&self) {
        println!("server started");
    }

    fn on_start_failed(&self, error: &SessionError) {
        println!("{}", render_start_failure(error));
    }

    fn on_session_cleared(&self) {
        println!("server stopped");
    }
}

pub fn render_start_failure(error: &SessionError) -> String {
    if error.is_retryable() {
        format!("error: {error} (type `restart` to retry)")
    } else {
        format!("error: {error}")
    }
}

pub fn render_server_error(error: &ServerErrorInfo) -> String {
    let mut out = format!("server error: {error}\n");
    for line in error.remediation() {
        out.push_str("  - ");
        out.push_str(&line);
        out.push('\n');
    }
    out
}
