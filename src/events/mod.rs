//! Output line routing.
//!
//! Every non-empty line of the primary process output goes to a [`LogSink`]
//! first and is then offered to a [`ResultTracker`]. When a hacking session
//! is enabled, a recognized session announcement triggers a
//! [`SessionLauncher`].

mod results;
mod writer;

use std::io::{self, IsTerminal};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

pub use results::LavaResults;
pub use writer::LogWriter;

/// Test definition announcing a hacking session.
pub const HACKING_SESSION_DEFINITION: &str = "hacking-session";

/// Test case carrying the hacking session connection reference.
pub const HACKING_SESSION_CASE: &str = "tmate";

/// Destination of the job log.
#[cfg_attr(test, mockall::automock)]
pub trait LogSink: Send {
    /// Writes one output line (without trailing newline).
    fn write(&mut self, line: &str) -> io::Result<()>;
}

/// Extracts structured test results from output lines.
#[cfg_attr(test, mockall::automock)]
pub trait ResultTracker: Send {
    /// Parses `line`, recording and returning the result event it carries, if any.
    fn parse(&mut self, line: &str) -> Option<ResultEvent>;

    /// Exit code derived from the recorded results.
    fn exit_code(&self) -> i32;

    /// All recorded results as JSON.
    fn data(&self) -> serde_json::Value;
}

/// Opens an interactive terminal to a hacking session.
#[cfg_attr(test, mockall::automock)]
pub trait SessionLauncher: Send {
    /// Connects to the session identified by `reference`.
    fn launch(&self, reference: &str) -> io::Result<()>;
}

/// One test case result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    /// Outcome (`pass`, `fail`, `skip`, `unknown`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Free-form reference attached to the case (e.g. a session address).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,

    /// Any other field reported with the result.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TestRecord {
    /// Returns true if the case failed.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.result.as_deref() == Some("fail")
    }
}

/// A result extracted from an output line.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultEvent {
    /// Test definition (suite) name.
    pub definition: String,
    /// Test case name.
    pub case: String,
    /// Result payload.
    pub record: TestRecord,
}

impl ResultEvent {
    /// Returns the session reference if this event announces a hacking session.
    #[must_use]
    pub fn hacking_session(&self) -> Option<&str> {
        if self.definition == HACKING_SESSION_DEFINITION && self.case == HACKING_SESSION_CASE {
            self.record.reference.as_deref()
        } else {
            None
        }
    }
}

/// Opens `xterm` running `ssh <reference>` when stdout is a terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct XtermLauncher;

impl SessionLauncher for XtermLauncher {
    fn launch(&self, reference: &str) -> io::Result<()> {
        if !io::stdout().is_terminal() {
            debug!("stdout is not a terminal, not opening a session window");
            return Ok(());
        }

        let mut child = Command::new("xterm")
            .args(["-e", "bash", "-c", &format!("ssh {reference}")])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        // Reaped in the background, the window may outlive the job.
        std::thread::spawn(move || child.wait());
        Ok(())
    }
}

/// Routes output lines to the sink, the tracker and the session launcher.
pub struct EventDispatcher {
    sink: Box<dyn LogSink>,
    results: Box<dyn ResultTracker>,
    hacking_session: bool,
    launcher: Box<dyn SessionLauncher>,
}

impl EventDispatcher {
    /// Creates a dispatcher with hacking sessions disabled.
    pub fn new(sink: Box<dyn LogSink>, results: Box<dyn ResultTracker>) -> Self {
        Self {
            sink,
            results,
            hacking_session: false,
            launcher: Box::new(XtermLauncher),
        }
    }

    /// Enables or disables hacking session detection.
    #[must_use]
    pub fn with_hacking_session(mut self, enabled: bool) -> Self {
        self.hacking_session = enabled;
        self
    }

    /// Replaces the session launcher.
    #[must_use]
    pub fn with_launcher(mut self, launcher: Box<dyn SessionLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Returns true if hacking session detection is enabled.
    #[must_use]
    pub fn hacking_session(&self) -> bool {
        self.hacking_session
    }

    /// Routes one output line.
    ///
    /// Empty lines are dropped. Returns the result event the line carried.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink cannot be written. Launcher failures are
    /// logged and ignored.
    #[instrument(level = "trace", skip(self))]
    pub fn dispatch(&mut self, line: &str) -> io::Result<Option<ResultEvent>> {
        if line.is_empty() {
            return Ok(None);
        }

        self.sink.write(line)?;

        let Some(event) = self.results.parse(line) else {
            return Ok(None);
        };

        if self.hacking_session {
            if let Some(reference) = event.hacking_session() {
                info!(%reference, "Hacking session available");
                if let Err(e) = self.launcher.launch(reference) {
                    warn!(error = %e, "Failed to open hacking session terminal");
                }
            }
        }

        Ok(Some(event))
    }

    /// The result tracker.
    #[must_use]
    pub fn results(&self) -> &dyn ResultTracker {
        self.results.as_ref()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("hacking_session", &self.hacking_session)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;

    fn session_event(reference: &str) -> ResultEvent {
        ResultEvent {
            definition: HACKING_SESSION_DEFINITION.to_string(),
            case: HACKING_SESSION_CASE.to_string(),
            record: TestRecord {
                result: Some("pass".to_string()),
                reference: Some(reference.to_string()),
                extra: serde_json::Map::new(),
            },
        }
    }

    #[test]
    fn test_empty_lines_are_dropped() {
        let mut sink = MockLogSink::new();
        sink.expect_write().never();
        let mut results = MockResultTracker::new();
        results.expect_parse().never();

        let mut dispatcher = EventDispatcher::new(Box::new(sink), Box::new(results));
        assert_eq!(dispatcher.dispatch("").unwrap(), None);
    }

    #[test]
    fn test_sink_sees_line_before_tracker() {
        let mut seq = Sequence::new();
        let mut sink = MockLogSink::new();
        sink.expect_write()
            .withf(|line| line == "hello")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        let mut results = MockResultTracker::new();
        results
            .expect_parse()
            .withf(|line| line == "hello")
            .times(1)
            .in_sequence(&mut seq)
            .return_const(None::<ResultEvent>);

        let mut dispatcher = EventDispatcher::new(Box::new(sink), Box::new(results));
        assert_eq!(dispatcher.dispatch("hello").unwrap(), None);
    }

    #[test]
    fn test_sink_error_is_propagated() {
        let mut sink = MockLogSink::new();
        sink.expect_write()
            .returning(|_| Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        let mut results = MockResultTracker::new();
        results.expect_parse().never();

        let mut dispatcher = EventDispatcher::new(Box::new(sink), Box::new(results));
        assert!(dispatcher.dispatch("hello").is_err());
    }

    #[test]
    fn test_hacking_session_launches_terminal() {
        let mut sink = MockLogSink::new();
        sink.expect_write().returning(|_| Ok(()));
        let mut results = MockResultTracker::new();
        results
            .expect_parse()
            .returning(|_| Some(session_event("ssh://tmate.io/abc")));
        let mut launcher = MockSessionLauncher::new();
        launcher
            .expect_launch()
            .withf(|reference| reference == "ssh://tmate.io/abc")
            .times(1)
            .returning(|_| Err(io::Error::from(io::ErrorKind::NotFound)));

        let mut dispatcher = EventDispatcher::new(Box::new(sink), Box::new(results))
            .with_hacking_session(true)
            .with_launcher(Box::new(launcher));

        // Launcher failure does not fail the dispatch
        let event = dispatcher.dispatch("session line").unwrap();
        assert!(event.is_some());
    }

    #[test]
    fn test_hacking_session_disabled() {
        let mut sink = MockLogSink::new();
        sink.expect_write().returning(|_| Ok(()));
        let mut results = MockResultTracker::new();
        results
            .expect_parse()
            .returning(|_| Some(session_event("ssh://tmate.io/abc")));
        let mut launcher = MockSessionLauncher::new();
        launcher.expect_launch().never();

        let mut dispatcher = EventDispatcher::new(Box::new(sink), Box::new(results))
            .with_launcher(Box::new(launcher));
        assert!(dispatcher.dispatch("session line").unwrap().is_some());
    }

    #[test]
    fn test_hacking_session_requires_marker() {
        let mut event = session_event("ref");
        assert_eq!(event.hacking_session(), Some("ref"));
        event.case = "other".to_string();
        assert_eq!(event.hacking_session(), None);
    }
}
