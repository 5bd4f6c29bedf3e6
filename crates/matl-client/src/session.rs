//! State machine for one execution request.
//!
//! `RunSession::handle` is the only way the state changes. It performs no
//! I/O: everything it wants done (send a submission, start a timer, force a
//! reconnect, ...) comes back as a list of [`Effect`]s for the caller to
//! execute. The caller also supplies the current session id with each input,
//! so the machine never holds on to a stale one.

use std::time::Duration;

use log::{debug, warn};

use crate::analytics::{AnalyticsEvent, JOB_SUBMITTED, SUBMIT_FAILED};
use crate::config::ClientConfig;
use crate::protocol::{CompleteInfo, KillPayload, SubmitPayload};

/// What the user asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub code: String,
    /// Newline-delimited input expressions.
    pub inputs: String,
    pub version: String,
    pub debug: Option<String>,
}

impl RunRequest {
    pub fn new(
        code: impl Into<String>,
        inputs: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            inputs: inputs.into(),
            version: version.into(),
            debug: None,
        }
    }

    pub fn with_debug(mut self, debug: Option<String>) -> Self {
        self.debug = debug;
        self
    }

    fn payload(&self, uid: &str) -> SubmitPayload {
        SubmitPayload {
            code: self.code.clone(),
            inputs: self.inputs.clone(),
            debug: self.debug.clone(),
            version: self.version.clone(),
            uid: Some(uid.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitPhase {
    /// No session id yet; the submission goes out once one is assigned.
    AwaitingSession,
    /// Sent, waiting for the server to acknowledge it.
    AwaitingAck,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Idle,
    Submitting {
        request: RunRequest,
        /// 0 for the first send, incremented on every resubmission.
        attempt: u32,
        phase: SubmitPhase,
    },
    Running {
        request: RunRequest,
    },
}

impl RunState {
    pub fn affordance(&self) -> Affordance {
        match self {
            RunState::Idle => Affordance::Run,
            RunState::Submitting { .. } => Affordance::Busy,
            RunState::Running { .. } => Affordance::Kill,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, RunState::Idle)
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Submitting { .. } => "submitting",
            RunState::Running { .. } => "running",
        }
    }
}

/// What the primary control offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Affordance {
    Run,
    Busy,
    Kill,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Submit(RunRequest),
    /// The connection handed out a (new) session id.
    SessionAssigned,
    Acknowledged { attempt: u32 },
    AckTimedOut { attempt: u32 },
    KillRequested,
    /// Stop whatever is in flight: kills a running program, abandons a
    /// submission that was not acknowledged yet.
    Cancel,
    Complete(CompleteInfo),
    Killed,
    /// Run/Kill button: kills when running, submits otherwise.
    Toggle(RunRequest),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    ClearOutput,
    /// Emit `submit` with an acknowledgement request tagged `attempt`.
    SendSubmit {
        attempt: u32,
        payload: SubmitPayload,
    },
    StartAckTimer {
        attempt: u32,
        after: Duration,
    },
    CancelAckTimer,
    /// Drop the connection and connect again.
    Reconnect,
    SendKill(KillPayload),
    Analytics(AnalyticsEvent),
    /// Something the user should be told about.
    Notify(String),
}

#[derive(Debug, Clone)]
pub struct RunSession {
    state: RunState,
    ack_timeout: Duration,
    resubmit_limit: Option<u32>,
}

impl Default for RunSession {
    fn default() -> Self {
        Self::new(Duration::from_millis(crate::config::DEFAULT_ACK_TIMEOUT_MS), None)
    }
}

impl RunSession {
    pub fn new(ack_timeout: Duration, resubmit_limit: Option<u32>) -> Self {
        Self {
            state: RunState::Idle,
            ack_timeout,
            resubmit_limit,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.ack_timeout(), config.resubmit_limit)
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn affordance(&self) -> Affordance {
        self.state.affordance()
    }

    /// Apply one input. `session_id` is the connection's current session.
    pub fn handle(&mut self, input: Input, session_id: Option<&str>) -> Vec<Effect> {
        let before = self.state.name();
        let effects = match input {
            Input::Submit(request) => self.submit(request, session_id),
            Input::Toggle(request) => match self.state {
                RunState::Running { .. } => self.kill(session_id),
                _ => self.submit(request, session_id),
            },
            Input::SessionAssigned => self.session_assigned(session_id),
            Input::Acknowledged { attempt } => self.acknowledged(attempt),
            Input::AckTimedOut { attempt } => self.ack_timed_out(attempt, session_id),
            Input::KillRequested => self.kill(session_id),
            Input::Cancel => self.cancel(session_id),
            Input::Complete(info) => {
                let was_running = matches!(self.state, RunState::Running { .. });
                let mut effects = self.finish("complete");
                if let (true, Some(false), Some(message)) =
                    (was_running, info.success, info.message)
                {
                    effects.push(Effect::Notify(message));
                }
                effects
            }
            Input::Killed => self.finish("killed"),
        };

        if self.state.name() != before {
            debug!("[session] {} -> {}", before, self.state.name());
        }
        effects
    }

    fn submit(&mut self, request: RunRequest, session_id: Option<&str>) -> Vec<Effect> {
        if !self.state.is_idle() {
            debug!("[session] Ignoring submit while {}", self.state.name());
            return Vec::new();
        }
        if request.code.is_empty() {
            debug!("[session] Ignoring submit without code");
            return Vec::new();
        }

        let mut effects = vec![
            Effect::ClearOutput,
            Effect::StartAckTimer {
                attempt: 0,
                after: self.ack_timeout,
            },
        ];

        let phase = match session_id {
            Some(uid) => {
                effects.push(Effect::SendSubmit {
                    attempt: 0,
                    payload: request.payload(uid),
                });
                SubmitPhase::AwaitingAck
            }
            None => {
                debug!("[session] No session yet, submission deferred");
                SubmitPhase::AwaitingSession
            }
        };

        self.state = RunState::Submitting {
            request,
            attempt: 0,
            phase,
        };
        effects
    }

    fn session_assigned(&mut self, session_id: Option<&str>) -> Vec<Effect> {
        let RunState::Submitting {
            request,
            attempt,
            phase,
        } = &mut self.state
        else {
            return Vec::new();
        };
        let Some(uid) = session_id else {
            return Vec::new();
        };
        if *phase != SubmitPhase::AwaitingSession {
            return Vec::new();
        }

        *phase = SubmitPhase::AwaitingAck;
        vec![Effect::SendSubmit {
            attempt: *attempt,
            payload: request.payload(uid),
        }]
    }

    fn acknowledged(&mut self, acked: u32) -> Vec<Effect> {
        match &self.state {
            RunState::Submitting {
                request, attempt, ..
            } if *attempt == acked => {
                let request = request.clone();
                self.state = RunState::Running { request };
                vec![
                    Effect::CancelAckTimer,
                    Effect::Analytics(AnalyticsEvent::from_triple(JOB_SUBMITTED)),
                ]
            }
            _ => {
                debug!("[session] Ignoring acknowledgement for attempt {}", acked);
                Vec::new()
            }
        }
    }

    fn ack_timed_out(&mut self, timed_out: u32, session_id: Option<&str>) -> Vec<Effect> {
        let RunState::Submitting {
            request, attempt, ..
        } = &self.state
        else {
            return Vec::new();
        };
        if *attempt != timed_out {
            return Vec::new();
        }
        let (request, attempt) = (request.clone(), *attempt);

        warn!(
            "[session] Submission not acknowledged within {:?} (session {}), reconnecting",
            self.ack_timeout,
            session_id.unwrap_or("<none>")
        );

        let mut effects = vec![Effect::Analytics(AnalyticsEvent::from_triple(
            SUBMIT_FAILED,
        ))];

        if let Some(limit) = self.resubmit_limit {
            if attempt >= limit {
                warn!("[session] Giving up after {} resubmissions", attempt);
                self.state = RunState::Idle;
                effects.push(Effect::Notify(format!(
                    "The server did not accept the submission after {} attempts",
                    attempt + 1
                )));
                return effects;
            }
        }

        let next = attempt + 1;
        self.state = RunState::Submitting {
            request,
            attempt: next,
            phase: SubmitPhase::AwaitingSession,
        };
        effects.push(Effect::Reconnect);
        effects.push(Effect::StartAckTimer {
            attempt: next,
            after: self.ack_timeout,
        });
        effects
    }

    fn kill(&mut self, session_id: Option<&str>) -> Vec<Effect> {
        if !matches!(self.state, RunState::Running { .. }) {
            debug!("[session] Ignoring kill while {}", self.state.name());
            return Vec::new();
        }
        self.state = RunState::Idle;
        vec![Effect::SendKill(KillPayload {
            uid: session_id.map(str::to_string),
        })]
    }

    fn cancel(&mut self, session_id: Option<&str>) -> Vec<Effect> {
        match &self.state {
            RunState::Idle => Vec::new(),
            RunState::Running { .. } => self.kill(session_id),
            RunState::Submitting { phase, .. } => {
                let mut effects = vec![Effect::CancelAckTimer];
                // The server may already be running it.
                if *phase == SubmitPhase::AwaitingAck {
                    effects.push(Effect::SendKill(KillPayload {
                        uid: session_id.map(str::to_string),
                    }));
                }
                debug!("[session] Submission abandoned");
                self.state = RunState::Idle;
                effects
            }
        }
    }

    /// `complete` and `killed` only end a run the server acknowledged. While
    /// submitting they belong to the previous run (the server answers a kill
    /// with `complete`), and the acknowledgement still decides.
    fn finish(&mut self, why: &str) -> Vec<Effect> {
        match self.state {
            RunState::Running { .. } => {
                self.state = RunState::Idle;
                Vec::new()
            }
            _ => {
                debug!("[session] Ignoring {} while {}", why, self.state.name());
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RunRequest {
        RunRequest::new(":t!", "120", "22.7.4")
    }

    fn session() -> RunSession {
        RunSession::new(Duration::from_millis(2000), None)
    }

    fn sent_payload(effects: &[Effect]) -> Option<&SubmitPayload> {
        effects.iter().find_map(|effect| match effect {
            Effect::SendSubmit { payload, .. } => Some(payload),
            _ => None,
        })
    }

    #[test]
    fn test_submit_from_idle() {
        let mut run = session();
        let effects = run.handle(Input::Submit(request()), Some("abc"));

        assert_eq!(effects[0], Effect::ClearOutput);
        assert!(effects.contains(&Effect::StartAckTimer {
            attempt: 0,
            after: Duration::from_millis(2000),
        }));
        let payload = sent_payload(&effects).unwrap();
        assert_eq!(payload.uid.as_deref(), Some("abc"));
        assert_eq!(payload.code, ":t!");
        assert_eq!(payload.inputs, "120");
        assert_eq!(payload.version, "22.7.4");
        assert_eq!(run.affordance(), Affordance::Busy);
    }

    #[test]
    fn test_empty_code_is_ignored() {
        let mut run = session();
        let effects = run.handle(Input::Submit(RunRequest::new("", "1", "22.7.4")), Some("abc"));
        assert!(effects.is_empty());
        assert!(run.state().is_idle());
    }

    #[test]
    fn test_second_submit_is_noop() {
        let mut run = session();
        run.handle(Input::Submit(request()), Some("abc"));
        assert!(run.handle(Input::Submit(request()), Some("abc")).is_empty());

        run.handle(Input::Acknowledged { attempt: 0 }, Some("abc"));
        assert!(run.handle(Input::Submit(request()), Some("abc")).is_empty());
        assert_eq!(run.affordance(), Affordance::Kill);
    }

    #[test]
    fn test_ack_moves_to_running() {
        let mut run = session();
        run.handle(Input::Submit(request()), Some("abc"));
        let effects = run.handle(Input::Acknowledged { attempt: 0 }, Some("abc"));

        assert_eq!(effects[0], Effect::CancelAckTimer);
        assert!(matches!(
            &effects[1],
            Effect::Analytics(event) if event.path() == "general/workflow/Job Submitted"
        ));
        assert!(matches!(run.state(), RunState::Running { .. }));
    }

    #[test]
    fn test_ack_timeout_reconnects_then_resubmits_once() {
        let mut run = session();
        run.handle(Input::Submit(request()), Some("abc"));

        let effects = run.handle(Input::AckTimedOut { attempt: 0 }, Some("abc"));
        assert_eq!(
            effects.iter().filter(|e| **e == Effect::Reconnect).count(),
            1
        );
        assert!(sent_payload(&effects).is_none());
        assert!(matches!(
            &effects[0],
            Effect::Analytics(event) if event.path() == "errors/error/Submit failed"
        ));
        assert!(effects.contains(&Effect::StartAckTimer {
            attempt: 1,
            after: Duration::from_millis(2000),
        }));

        // Resubmitted with the fresh session once the reconnect lands.
        let effects = run.handle(Input::SessionAssigned, Some("def"));
        assert_eq!(effects.len(), 1);
        assert_eq!(sent_payload(&effects).unwrap().uid.as_deref(), Some("def"));

        // A late duplicate assignment does not resend.
        assert!(run.handle(Input::SessionAssigned, Some("def")).is_empty());
    }

    #[test]
    fn test_stale_ack_and_timeout_are_ignored() {
        let mut run = session();
        run.handle(Input::Submit(request()), Some("abc"));
        run.handle(Input::AckTimedOut { attempt: 0 }, Some("abc"));

        assert!(run
            .handle(Input::Acknowledged { attempt: 0 }, Some("def"))
            .is_empty());
        assert!(run
            .handle(Input::AckTimedOut { attempt: 0 }, Some("def"))
            .is_empty());
        assert!(matches!(
            run.state(),
            RunState::Submitting { attempt: 1, .. }
        ));
    }

    #[test]
    fn test_resubmit_limit_abandons_run() {
        let mut run = RunSession::new(Duration::from_millis(100), Some(1));
        run.handle(Input::Submit(request()), Some("abc"));
        run.handle(Input::AckTimedOut { attempt: 0 }, Some("abc"));
        run.handle(Input::SessionAssigned, Some("def"));

        let effects = run.handle(Input::AckTimedOut { attempt: 1 }, Some("def"));
        assert!(!effects.contains(&Effect::Reconnect));
        assert!(effects.iter().any(|e| matches!(e, Effect::Notify(_))));
        assert!(run.state().is_idle());
    }

    #[test]
    fn test_submit_without_session_waits() {
        let mut run = session();
        let effects = run.handle(Input::Submit(request()), None);
        assert!(sent_payload(&effects).is_none());
        assert!(effects.contains(&Effect::StartAckTimer {
            attempt: 0,
            after: Duration::from_millis(2000),
        }));

        let effects = run.handle(Input::SessionAssigned, Some("abc"));
        assert_eq!(sent_payload(&effects).unwrap().uid.as_deref(), Some("abc"));
    }

    #[test]
    fn test_kill_while_running() {
        let mut run = session();
        run.handle(Input::Submit(request()), Some("abc"));
        run.handle(Input::Acknowledged { attempt: 0 }, Some("abc"));

        let effects = run.handle(Input::KillRequested, Some("abc"));
        assert_eq!(
            effects,
            vec![Effect::SendKill(KillPayload {
                uid: Some("abc".into())
            })]
        );
        assert!(run.state().is_idle());

        // The server's confirmation arrives after the optimistic reset.
        assert!(run.handle(Input::Killed, Some("abc")).is_empty());
        assert!(run.state().is_idle());
    }

    #[test]
    fn test_kill_while_submitting_is_noop() {
        let mut run = session();
        run.handle(Input::Submit(request()), Some("abc"));
        assert!(run.handle(Input::KillRequested, Some("abc")).is_empty());
        assert_eq!(run.affordance(), Affordance::Busy);
    }

    #[test]
    fn test_complete_returns_to_idle() {
        let mut run = session();
        run.handle(Input::Submit(request()), Some("abc"));
        run.handle(Input::Acknowledged { attempt: 0 }, Some("abc"));
        let effects = run.handle(Input::Complete(CompleteInfo::default()), Some("abc"));
        assert!(effects.is_empty());
        assert!(run.state().is_idle());
        assert_eq!(run.affordance(), Affordance::Run);
    }

    #[test]
    fn test_complete_while_submitting_is_ignored() {
        let mut run = session();
        run.handle(Input::Submit(request()), Some("abc"));
        assert!(run
            .handle(Input::Complete(CompleteInfo::default()), Some("abc"))
            .is_empty());
        assert!(run.handle(Input::Killed, Some("abc")).is_empty());
        assert_eq!(run.affordance(), Affordance::Busy);
    }

    #[test]
    fn test_kill_reply_does_not_end_next_run() {
        let mut run = session();
        run.handle(Input::Submit(request()), Some("abc"));
        run.handle(Input::Acknowledged { attempt: 0 }, Some("abc"));
        run.handle(Input::KillRequested, Some("abc"));

        // Resubmitted right away; the reply to the kill arrives before the ack.
        assert!(sent_payload(&run.handle(Input::Submit(request()), Some("abc"))).is_some());
        let effects = run.handle(
            Input::Complete(CompleteInfo {
                success: Some(false),
                message: Some("User terminated the job".into()),
            }),
            Some("abc"),
        );
        assert!(effects.is_empty());

        let effects = run.handle(Input::Acknowledged { attempt: 0 }, Some("abc"));
        assert_eq!(effects[0], Effect::CancelAckTimer);
        assert!(matches!(run.state(), RunState::Running { .. }));

        // Still one run in flight.
        assert!(run.handle(Input::Submit(request()), Some("abc")).is_empty());
    }

    #[test]
    fn test_cancel_abandons_pending_submission() {
        let mut run = session();
        run.handle(Input::Submit(request()), None);
        let effects = run.handle(Input::Cancel, None);
        assert_eq!(effects, vec![Effect::CancelAckTimer]);
        assert!(run.state().is_idle());

        // A session showing up later sends nothing.
        assert!(run.handle(Input::SessionAssigned, Some("abc")).is_empty());
    }

    #[test]
    fn test_cancel_after_send_kills_on_server() {
        let mut run = session();
        run.handle(Input::Submit(request()), Some("abc"));
        let effects = run.handle(Input::Cancel, Some("abc"));
        assert_eq!(
            effects,
            vec![
                Effect::CancelAckTimer,
                Effect::SendKill(KillPayload {
                    uid: Some("abc".into())
                }),
            ]
        );
        assert!(run.state().is_idle());
    }

    #[test]
    fn test_cancel_while_running_kills() {
        let mut run = session();
        run.handle(Input::Submit(request()), Some("abc"));
        run.handle(Input::Acknowledged { attempt: 0 }, Some("abc"));
        let effects = run.handle(Input::Cancel, Some("abc"));
        assert!(matches!(effects[..], [Effect::SendKill(_)]));
        assert!(run.handle(Input::Cancel, Some("abc")).is_empty());
    }

    #[test]
    fn test_complete_while_idle_is_noop() {
        let mut run = session();
        assert!(run
            .handle(Input::Complete(CompleteInfo::default()), Some("abc"))
            .is_empty());
        assert!(run.handle(Input::Killed, None).is_empty());
    }

    #[test]
    fn test_failed_completion_notifies() {
        let mut run = session();
        run.handle(Input::Submit(request()), Some("abc"));
        run.handle(Input::Acknowledged { attempt: 0 }, Some("abc"));
        let effects = run.handle(
            Input::Complete(CompleteInfo {
                success: Some(false),
                message: Some("Job timed out".into()),
            }),
            Some("abc"),
        );
        assert_eq!(effects, vec![Effect::Notify("Job timed out".into())]);
    }

    #[test]
    fn test_toggle() {
        let mut run = session();
        let effects = run.handle(Input::Toggle(request()), Some("abc"));
        assert!(sent_payload(&effects).is_some());

        // Busy: toggling does nothing.
        assert!(run.handle(Input::Toggle(request()), Some("abc")).is_empty());

        run.handle(Input::Acknowledged { attempt: 0 }, Some("abc"));
        let effects = run.handle(Input::Toggle(request()), Some("abc"));
        assert!(matches!(effects[..], [Effect::SendKill(_)]));
    }

    #[test]
    fn test_debug_flag_forwarded() {
        let mut run = session();
        let effects = run.handle(
            Input::Submit(request().with_debug(Some("1".into()))),
            Some("abc"),
        );
        assert_eq!(sent_payload(&effects).unwrap().debug.as_deref(), Some("1"));
    }
}
