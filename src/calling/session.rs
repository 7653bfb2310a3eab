//! Call session state machine.
//!
//! `transition` is the whole lifecycle table. `CallSession::handle` looks up
//! the next state there, then applies the input's side effects to the
//! session and returns the asynchronous work (`Directive`s) the driver has
//! to start. Inputs the table has no entry for are dropped, which rejects an
//! unanswered inbound call and releases a late media stream.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::devices::PermissionStatus;
use super::error::CallError;
use super::fabric::{
    CallControl, CallId, Endpoint, InboundCall, MediaCall, MediaCallEvent, PeerIdentity,
};
use super::media::{LocalMediaStream, RemoteMediaStream, StreamView};

/// Which side of the consultation we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The clinician. Looks up the patient's identity and places the call.
    Initiator,
    /// The patient. Publishes its identity and answers.
    Responder,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::Initiator => "Doctor",
            Role::Responder => "Patient",
        }
    }

    /// Label for the other party's video surface.
    pub fn remote_label(&self) -> &'static str {
        match self {
            Role::Initiator => "Patient",
            Role::Responder => "Doctor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "cause", rename_all = "snake_case")]
pub enum CallState {
    Initializing,
    AwaitingMedia,
    AwaitingRemote,
    Negotiating,
    Connected,
    Ended,
    Errored(CallError),
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Errored(_))
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallState::Initializing => f.write_str("initializing"),
            CallState::AwaitingMedia => f.write_str("awaiting media"),
            CallState::AwaitingRemote => f.write_str("awaiting remote"),
            CallState::Negotiating => f.write_str("negotiating"),
            CallState::Connected => f.write_str("connected"),
            CallState::Ended => f.write_str("ended"),
            CallState::Errored(e) => write!(f, "errored ({:?})", e),
        }
    }
}

/// Everything that can happen to a session.
pub enum SessionInput {
    /// The fabric registration opened with this identity.
    IdentityAssigned(PeerIdentity),
    MediaAcquired(LocalMediaStream),
    /// The initiator found the responder's identity.
    RemoteResolved(PeerIdentity),
    /// The responder is being called.
    IncomingCall(InboundCall),
    RemoteStream {
        call: CallId,
        stream: RemoteMediaStream,
    },
    RemoteClosed {
        call: CallId,
    },
    Failed(CallError),
    EndRequested,
}

impl SessionInput {
    pub fn kind(&self) -> InputKind {
        match self {
            SessionInput::IdentityAssigned(_) => InputKind::IdentityAssigned,
            SessionInput::MediaAcquired(_) => InputKind::MediaAcquired,
            SessionInput::RemoteResolved(_) => InputKind::RemoteResolved,
            SessionInput::IncomingCall(_) => InputKind::IncomingCall,
            SessionInput::RemoteStream { .. } => InputKind::RemoteStream,
            SessionInput::RemoteClosed { .. } => InputKind::RemoteClosed,
            SessionInput::Failed(e) => InputKind::Failed(*e),
            SessionInput::EndRequested => InputKind::EndRequested,
        }
    }
}

/// Payload-free form of `SessionInput`, the key of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    IdentityAssigned,
    MediaAcquired,
    RemoteResolved,
    IncomingCall,
    RemoteStream,
    RemoteClosed,
    Failed(CallError),
    EndRequested,
}

/// The lifecycle table. `None` means the input is not accepted in `state`.
pub fn transition(role: Role, state: CallState, input: InputKind) -> Option<CallState> {
    use CallState::*;

    match (role, state, input) {
        (_, Ended, _) => None,
        (_, Errored(_), InputKind::EndRequested) => Some(Ended),
        (_, Errored(_), _) => None,
        (_, _, InputKind::EndRequested) => Some(Ended),
        (_, _, InputKind::Failed(cause)) => Some(Errored(cause)),
        (_, Initializing, InputKind::IdentityAssigned) => Some(AwaitingMedia),
        (_, AwaitingMedia, InputKind::MediaAcquired) => Some(AwaitingRemote),
        (Role::Initiator, AwaitingRemote, InputKind::RemoteResolved) => Some(Negotiating),
        (Role::Responder, AwaitingRemote, InputKind::IncomingCall) => Some(Negotiating),
        (_, Negotiating | Connected, InputKind::RemoteStream) => Some(Connected),
        // The remote side hanging up is only a notice; the local user decides
        // when the session ends.
        (_, Negotiating | Connected, InputKind::RemoteClosed) => Some(state),
        _ => None,
    }
}

/// Work the session hands back to its driver.
pub enum Directive {
    AcquireMedia,
    PublishIdentity(PeerIdentity),
    ResolveRemote,
    /// Start forwarding this call's events back as inputs.
    Watch {
        call: CallId,
        events: mpsc::UnboundedReceiver<MediaCallEvent>,
    },
    BindLocal(StreamView),
    BindRemote(StreamView),
    ClearRemote,
    Notice(CallError),
    /// Tell the host application the call is over.
    NotifyEnded,
}

impl Directive {
    pub fn name(&self) -> &'static str {
        match self {
            Directive::AcquireMedia => "acquire-media",
            Directive::PublishIdentity(_) => "publish-identity",
            Directive::ResolveRemote => "resolve-remote",
            Directive::Watch { .. } => "watch",
            Directive::BindLocal(_) => "bind-local",
            Directive::BindRemote(_) => "bind-remote",
            Directive::ClearRemote => "clear-remote",
            Directive::Notice(_) => "notice",
            Directive::NotifyEnded => "notify-ended",
        }
    }
}

struct ActiveCall {
    id: CallId,
    control: Box<dyn CallControl>,
}

/// Presentation state of a session at one instant.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub appointment_id: String,
    pub role: Role,
    #[serde(flatten)]
    pub state: CallState,
    pub permission: PermissionStatus,
    pub local_identity: Option<PeerIdentity>,
    pub remote_identity: Option<PeerIdentity>,
    pub muted: bool,
    pub video_off: bool,
    pub local_bound: bool,
    pub remote_bound: bool,
    pub remote_label: &'static str,
    pub notice: Option<CallError>,
    pub connected_at: Option<DateTime<Utc>>,
}

/// The single call attempt of one call screen.
pub struct CallSession {
    id: String,
    role: Role,
    appointment_id: String,
    state: CallState,
    permission: PermissionStatus,
    local_identity: Option<PeerIdentity>,
    remote_identity: Option<PeerIdentity>,
    endpoint: Option<Box<dyn Endpoint>>,
    local_stream: Option<LocalMediaStream>,
    remote_stream: Option<RemoteMediaStream>,
    active_call: Option<ActiveCall>,
    muted: bool,
    video_off: bool,
    notice: Option<CallError>,
    connected_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl CallSession {
    pub fn new(role: Role, appointment_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            appointment_id: appointment_id.into(),
            state: CallState::Initializing,
            permission: PermissionStatus::Prompt,
            local_identity: None,
            remote_identity: None,
            endpoint: None,
            local_stream: None,
            remote_stream: None,
            active_call: None,
            muted: false,
            video_off: false,
            notice: None,
            connected_at: None,
            ended_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn appointment_id(&self) -> &str {
        &self.appointment_id
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn local_identity(&self) -> Option<&PeerIdentity> {
        self.local_identity.as_ref()
    }

    pub fn remote_identity(&self) -> Option<&PeerIdentity> {
        self.remote_identity.as_ref()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_video_off(&self) -> bool {
        self.video_off
    }

    pub fn has_local_stream(&self) -> bool {
        self.local_stream.is_some()
    }

    pub fn has_remote_stream(&self) -> bool {
        self.remote_stream.is_some()
    }

    pub fn notice(&self) -> Option<CallError> {
        self.notice
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Live tracks still held by the local stream.
    pub fn live_local_tracks(&self) -> usize {
        self.local_stream
            .as_ref()
            .map_or(0, LocalMediaStream::live_track_count)
    }

    pub fn set_permission(&mut self, permission: PermissionStatus) {
        self.permission = permission;
    }

    /// Hand the fabric registration to the session, which destroys it on
    /// teardown.
    pub fn attach_endpoint(&mut self, endpoint: Box<dyn Endpoint>) {
        if let Some(old) = self.endpoint.replace(endpoint) {
            old.destroy();
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id.clone(),
            appointment_id: self.appointment_id.clone(),
            role: self.role,
            state: self.state,
            permission: self.permission,
            local_identity: self.local_identity.clone(),
            remote_identity: self.remote_identity.clone(),
            muted: self.muted,
            video_off: self.video_off,
            local_bound: self.local_stream.is_some(),
            remote_bound: self.remote_stream.is_some(),
            remote_label: self.role.remote_label(),
            notice: self.notice,
            connected_at: self.connected_at,
        }
    }

    /// Apply one input.
    pub fn handle(&mut self, input: SessionInput) -> Vec<Directive> {
        if let SessionInput::RemoteStream { call, .. } | SessionInput::RemoteClosed { call } = &input
        {
            if !self.is_active_call(call) {
                tracing::debug!("Session {}: ignoring event for stale call {}", self.id, call);
                return Vec::new();
            }
        }

        let kind = input.kind();
        let next = match transition(self.role, self.state, kind) {
            Some(next) => next,
            None => {
                match kind {
                    InputKind::IncomingCall | InputKind::RemoteResolved => tracing::warn!(
                        "Session {} ({}): rejecting {:?} in state {}",
                        self.id,
                        self.role,
                        kind,
                        self.state
                    ),
                    _ => tracing::debug!(
                        "Session {}: ignoring {:?} in state {}",
                        self.id,
                        kind,
                        self.state
                    ),
                }
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        match input {
            SessionInput::IdentityAssigned(id) => {
                tracing::info!("Session {}: signaling identity is {}", self.id, id);
                self.local_identity = Some(id);
                out.push(Directive::AcquireMedia);
            }
            SessionInput::MediaAcquired(stream) => {
                out.push(Directive::BindLocal(stream.view()));
                self.local_stream = Some(stream);
                match (self.role, self.local_identity.clone()) {
                    (Role::Responder, Some(id)) => out.push(Directive::PublishIdentity(id)),
                    (Role::Responder, None) => return self.fail(CallError::SignalingError),
                    (Role::Initiator, _) => out.push(Directive::ResolveRemote),
                }
            }
            SessionInput::RemoteResolved(remote) => match self.place_call(&remote) {
                Ok(directive) => {
                    self.remote_identity = Some(remote);
                    out.push(directive);
                }
                Err(e) => return self.fail(e),
            },
            SessionInput::IncomingCall(call) => {
                let peer = call.peer().clone();
                match self.answer_call(call) {
                    Ok(directive) => {
                        self.remote_identity = Some(peer);
                        out.push(directive);
                    }
                    Err(e) => return self.fail(e),
                }
            }
            SessionInput::RemoteStream { call, stream } => {
                tracing::info!("Session {}: remote stream {} on call {}", self.id, stream.id(), call);
                out.push(Directive::BindRemote(stream.view()));
                self.remote_stream = Some(stream);
                self.notice = None;
                self.connected_at.get_or_insert_with(Utc::now);
            }
            SessionInput::RemoteClosed { call } => {
                tracing::warn!("Session {}: remote side closed call {}", self.id, call);
                self.active_call = None;
                self.remote_stream = None;
                self.notice = Some(CallError::ConnectionLost);
                out.push(Directive::ClearRemote);
                out.push(Directive::Notice(CallError::ConnectionLost));
            }
            SessionInput::Failed(cause) => {
                if cause.is_device_error() {
                    tracing::warn!("Session {}: media unavailable in state {}: {}", self.id, self.state, cause);
                } else {
                    tracing::error!("Session {}: failed in state {}: {}", self.id, self.state, cause);
                }
                self.teardown();
                out.push(Directive::ClearRemote);
            }
            SessionInput::EndRequested => {
                tracing::info!("Session {}: call ended by local user", self.id);
                self.teardown();
                out.push(Directive::ClearRemote);
                out.push(Directive::NotifyEnded);
            }
        }

        self.set_state(next);
        out
    }

    fn fail(&mut self, cause: CallError) -> Vec<Directive> {
        self.handle(SessionInput::Failed(cause))
    }

    fn set_state(&mut self, next: CallState) {
        if next != self.state {
            tracing::info!("Session {}: {} -> {}", self.id, self.state, next);
        }
        if next == CallState::Ended {
            self.ended_at.get_or_insert_with(Utc::now);
        }
        self.state = next;
    }

    fn is_active_call(&self, id: &CallId) -> bool {
        self.active_call.as_ref().is_some_and(|c| &c.id == id)
    }

    fn place_call(&mut self, remote: &PeerIdentity) -> Result<Directive, CallError> {
        let local = self.local_stream.as_ref().ok_or(CallError::Unknown)?;
        let endpoint = self.endpoint.as_ref().ok_or(CallError::SignalingError)?;

        tracing::info!("Session {}: calling {}", self.id, remote);
        let call = endpoint.call(remote, local).map_err(|e| {
            tracing::warn!("Session {}: outbound call failed: {}", self.id, e);
            CallError::SignalingError
        })?;
        Ok(self.track_call(call))
    }

    fn answer_call(&mut self, inbound: InboundCall) -> Result<Directive, CallError> {
        let local = self.local_stream.as_ref().ok_or(CallError::Unknown)?;

        tracing::info!("Session {}: answering call {} from {}", self.id, inbound.id(), inbound.peer());
        let call = inbound.answer(local).map_err(|e| {
            tracing::warn!("Session {}: answering failed: {}", self.id, e);
            CallError::SignalingError
        })?;
        Ok(self.track_call(call))
    }

    fn track_call(&mut self, call: MediaCall) -> Directive {
        let MediaCall {
            id,
            peer,
            events,
            control,
        } = call;
        tracing::debug!("Session {}: tracking call {} with {}", self.id, id, peer);
        if let Some(old) = self.active_call.replace(ActiveCall {
            id: id.clone(),
            control,
        }) {
            old.control.close();
        }
        Directive::Watch { call: id, events }
    }

    /// Flip every local audio track. Returns the mute flag.
    pub fn toggle_mute(&mut self) -> bool {
        if let Some(stream) = &self.local_stream {
            for track in stream.audio_tracks() {
                track.set_enabled(!track.is_enabled());
            }
            self.muted = !self.muted;
            tracing::info!("Session {}: muted={}", self.id, self.muted);
        }
        self.muted
    }

    /// Flip every local video track. The tracks keep running so video can
    /// resume without asking for the camera again. Returns the video-off flag.
    pub fn toggle_video(&mut self) -> bool {
        if let Some(stream) = &self.local_stream {
            for track in stream.video_tracks() {
                track.set_enabled(!track.is_enabled());
            }
            self.video_off = !self.video_off;
            tracing::info!("Session {}: video_off={}", self.id, self.video_off);
        }
        self.video_off
    }

    pub fn end_call(&mut self) -> Vec<Directive> {
        self.handle(SessionInput::EndRequested)
    }

    /// Release the camera/microphone, hang up, and drop the fabric
    /// registration. Safe to call more than once.
    pub fn teardown(&mut self) {
        if let Some(mut stream) = self.local_stream.take() {
            stream.release();
        }
        self.remote_stream = None;
        if let Some(call) = self.active_call.take() {
            call.control.close();
        }
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.destroy();
        }
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.teardown();
    }
}
