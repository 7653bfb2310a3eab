//! Line-oriented call screen.

use std::io::{self, Write};

use super::controller::CallView;
use super::devices::PermissionStatus;
use super::error::CallError;
use super::media::StreamView;
use super::session::{CallState, SessionSnapshot};

/// Prints what a call screen would show, one line per change.
pub struct ConsoleView<W: Write + Send = io::Stdout> {
    out: W,
    party: String,
    last_line: Option<String>,
    remote_label: &'static str,
}

impl ConsoleView {
    pub fn stdout(party: impl Into<String>) -> Self {
        Self::new(io::stdout(), party)
    }
}

impl<W: Write + Send> ConsoleView<W> {
    pub fn new(out: W, party: impl Into<String>) -> Self {
        Self {
            out,
            party: party.into(),
            last_line: None,
            remote_label: "Remote",
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn line(&mut self, text: &str) {
        if let Err(e) = writeln!(self.out, "[{}] {}", self.party, text) {
            tracing::debug!("Console view write failed: {}", e);
        }
    }
}

/// Text shown while the session is still setting up.
pub fn loading_text(permission: PermissionStatus) -> &'static str {
    match permission {
        PermissionStatus::Prompt => "Please allow camera and microphone access...",
        _ => "Connecting to video call...",
    }
}

fn status_line(snapshot: &SessionSnapshot) -> String {
    let mut line = match snapshot.state {
        CallState::Initializing | CallState::AwaitingMedia => {
            loading_text(snapshot.permission).to_string()
        }
        CallState::AwaitingRemote => format!("Waiting for {}...", snapshot.remote_label),
        CallState::Negotiating => format!("Connecting to {}...", snapshot.remote_label),
        CallState::Connected => format!("In call with {}", snapshot.remote_label),
        CallState::Ended => "Call ended".to_string(),
        CallState::Errored(cause) => {
            format!("{} [{}]", cause, cause.recovery_action().label())
        }
    };

    if !snapshot.state.is_terminal() {
        if snapshot.muted {
            line.push_str(" (Muted)");
        }
        if snapshot.video_off {
            line.push_str(" (Video Off)");
        }
    }
    line
}

impl<W: Write + Send> CallView for ConsoleView<W> {
    fn render(&mut self, snapshot: &SessionSnapshot) {
        self.remote_label = snapshot.remote_label;
        let line = status_line(snapshot);
        if self.last_line.as_deref() != Some(line.as_str()) {
            self.line(&line);
            self.last_line = Some(line);
        }
    }

    fn bind_local(&mut self, stream: StreamView) {
        self.line(&format!("You: showing stream {}", stream.stream_id()));
    }

    fn bind_remote(&mut self, stream: StreamView) {
        let marker = if stream.has_video() && !stream.video_enabled() {
            " (Video Off)"
        } else {
            ""
        };
        let text = format!(
            "{}: showing stream {}{}",
            self.remote_label,
            stream.stream_id(),
            marker
        );
        self.line(&text);
    }

    fn clear_remote(&mut self) {
        let text = format!("{}: no video", self.remote_label);
        self.line(&text);
    }

    fn notice(&mut self, notice: CallError) {
        let text = format!("Notice: {} [{}]", notice, notice.recovery_action().label());
        self.line(&text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::session::{CallSession, Role};

    fn output(view: ConsoleView<Vec<u8>>) -> String {
        String::from_utf8(view.into_inner()).unwrap()
    }

    #[test]
    fn test_loading_text_follows_permission() {
        assert_eq!(
            loading_text(PermissionStatus::Prompt),
            "Please allow camera and microphone access..."
        );
        assert_eq!(
            loading_text(PermissionStatus::Granted),
            "Connecting to video call..."
        );
    }

    #[test]
    fn test_render_prints_changes_once() {
        let session = CallSession::new(Role::Initiator, "APT-9");
        let mut view = ConsoleView::new(Vec::new(), "Doctor");
        view.render(&session.snapshot());
        view.render(&session.snapshot());

        let text = output(view);
        assert_eq!(
            text,
            "[Doctor] Please allow camera and microphone access...\n"
        );
    }

    #[test]
    fn test_error_shows_recovery_action() {
        let session = CallSession::new(Role::Initiator, "APT-9");
        let mut snapshot = session.snapshot();
        snapshot.state = CallState::Errored(CallError::ResolutionTimeout);

        let mut view = ConsoleView::new(Vec::new(), "Doctor");
        view.render(&snapshot);
        view.notice(CallError::ConnectionLost);

        let text = output(view);
        assert!(text.contains("Could not connect to patient. Please try again. [Try again]"));
        assert!(text.contains(
            "Notice: Connection lost. Please rejoin the call to try again. [Back to Appointments]"
        ));
    }

    #[test]
    fn test_video_off_marker() {
        let session = CallSession::new(Role::Responder, "APT-9");
        let mut snapshot = session.snapshot();
        snapshot.state = CallState::Connected;
        snapshot.video_off = true;

        let mut view = ConsoleView::new(Vec::new(), "Patient");
        view.render(&snapshot);
        assert_eq!(output(view), "[Patient] In call with Doctor (Video Off)\n");
    }
}
