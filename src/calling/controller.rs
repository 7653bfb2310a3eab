//! Drives one call session.
//!
//! A `CallController` is one task with one `tokio::select!` loop. It reacts
//! to user commands, fabric events, the media request, the identity lookup,
//! and forwarded call events, each handled to completion before the next.
//! The session is only ever touched from inside that loop.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;

use super::devices::{DeviceAccessManager, MediaConstraints, MediaDevices, PermissionStatus};
use super::error::CallError;
use super::fabric::{
    CallId, FabricEvent, MediaCallEvent, PeerIdentity, Registration, RegistrationOptions,
    SignalingFabric,
};
use super::media::{LocalMediaStream, StreamView};
use super::rendezvous::{IdentityResolver, RendezvousChannel};
use super::session::{CallSession, CallState, Directive, Role, SessionInput, SessionSnapshot};
use crate::config::Config;

/// What the host application hands to a call screen.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Shown to the user only.
    pub appointment_id: String,
    pub role: Role,
}

/// Presentation of a session: video surfaces, controls, notices.
pub trait CallView: Send {
    /// Called after every handled event.
    fn render(&mut self, snapshot: &SessionSnapshot);
    fn bind_local(&mut self, stream: StreamView);
    fn bind_remote(&mut self, stream: StreamView);
    fn clear_remote(&mut self);
    fn notice(&mut self, notice: CallError);
}

/// User commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCommand {
    ToggleMute,
    ToggleVideo,
    EndCall,
}

/// Buttons of the call screen. Dropping every clone means the screen went
/// away.
#[derive(Debug, Clone)]
pub struct CallControls {
    tx: mpsc::UnboundedSender<CallCommand>,
}

impl CallControls {
    pub fn toggle_mute(&self) -> bool {
        self.send(CallCommand::ToggleMute)
    }

    pub fn toggle_video(&self) -> bool {
        self.send(CallCommand::ToggleVideo)
    }

    pub fn end_call(&self) -> bool {
        self.send(CallCommand::EndCall)
    }

    fn send(&self, cmd: CallCommand) -> bool {
        if self.tx.send(cmd).is_err() {
            tracing::debug!("Call controller gone -- {:?} dropped", cmd);
            return false;
        }
        true
    }
}

/// How a session finished.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub appointment_id: String,
    pub role: Role,
    pub final_state: CallState,
    pub local_identity: Option<PeerIdentity>,
    pub remote_identity: Option<PeerIdentity>,
    pub connected_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub connected_secs: Option<i64>,
}

/// A call event tagged with the call it belongs to.
struct CallEnvelope {
    call: CallId,
    event: MediaCallEvent,
}

enum Startup {
    Registered(Registration),
    Failed(CallError),
    EndRequested,
    Unmounted,
}

pub struct CallController {
    config: Config,
    session: CallSession,
    devices: DeviceAccessManager,
    fabric: Arc<dyn SignalingFabric>,
    rendezvous: Arc<dyn RendezvousChannel>,
    view: Box<dyn CallView>,
    on_end_call: Option<Box<dyn FnOnce() + Send>>,
    commands: mpsc::UnboundedReceiver<CallCommand>,
    call_tx: mpsc::UnboundedSender<CallEnvelope>,
    call_rx: mpsc::UnboundedReceiver<CallEnvelope>,
    acquiring: Option<BoxFuture<'static, Result<LocalMediaStream, CallError>>>,
    resolving: Option<BoxFuture<'static, Result<PeerIdentity, CallError>>>,
}

impl CallController {
    pub fn new(
        config: Config,
        options: CallOptions,
        fabric: Arc<dyn SignalingFabric>,
        devices: Arc<dyn MediaDevices>,
        rendezvous: Arc<dyn RendezvousChannel>,
        view: Box<dyn CallView>,
        on_end_call: impl FnOnce() + Send + 'static,
    ) -> (Self, CallControls) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (call_tx, call_rx) = mpsc::unbounded_channel();

        let controller = Self {
            config,
            session: CallSession::new(options.role, options.appointment_id),
            devices: DeviceAccessManager::new(devices),
            fabric,
            rendezvous,
            view,
            on_end_call: Some(Box::new(on_end_call)),
            commands: cmd_rx,
            call_tx,
            call_rx,
            acquiring: None,
            resolving: None,
        };
        (controller, CallControls { tx: cmd_tx })
    }

    /// Run the session until the user ends it or the screen goes away.
    pub async fn run(mut self) -> SessionSummary {
        tracing::info!(
            "Starting {} session {} for appointment {}",
            self.session.role(),
            self.session.id(),
            self.session.appointment_id()
        );
        self.render();

        let mut fabric_events = match self.start().await {
            Startup::Registered(Registration { endpoint, events }) => {
                self.session.attach_endpoint(endpoint);
                Some(events)
            }
            Startup::Failed(cause) => {
                self.apply(SessionInput::Failed(cause));
                None
            }
            Startup::EndRequested => {
                self.apply(SessionInput::EndRequested);
                None
            }
            Startup::Unmounted => return self.finish(),
        };

        while self.session.state() != CallState::Ended {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.command(cmd),
                    None => {
                        tracing::info!("Call screen closed, tearing down session {}", self.session.id());
                        break;
                    }
                },
                event = recv_or_pending(&mut fabric_events) => match event {
                    Some(event) => self.fabric_event(event),
                    None => {
                        tracing::debug!("Fabric registration closed");
                        fabric_events = None;
                    }
                },
                result = await_or_pending(&mut self.acquiring) => {
                    self.acquiring = None;
                    match result {
                        Ok(stream) => self.apply(SessionInput::MediaAcquired(stream)),
                        Err(cause) => self.apply(SessionInput::Failed(cause)),
                    }
                },
                result = await_or_pending(&mut self.resolving) => {
                    self.resolving = None;
                    match result {
                        Ok(remote) => self.apply(SessionInput::RemoteResolved(remote)),
                        Err(cause) => self.apply(SessionInput::Failed(cause)),
                    }
                },
                Some(envelope) = self.call_rx.recv() => self.call_event(envelope),
            }
        }

        self.finish()
    }

    /// Permission probe and fabric registration, while still taking commands.
    async fn start(&mut self) -> Startup {
        let startup = startup(
            self.devices.clone(),
            Arc::clone(&self.fabric),
            RegistrationOptions::from(&self.config.signaling),
        );
        tokio::pin!(startup);

        loop {
            tokio::select! {
                (permission, result) = &mut startup => {
                    self.session.set_permission(permission);
                    return match result {
                        Ok(registration) => Startup::Registered(registration),
                        Err(cause) => Startup::Failed(cause),
                    };
                }
                cmd = self.commands.recv() => match cmd {
                    Some(CallCommand::EndCall) => return Startup::EndRequested,
                    Some(cmd) => self.command(cmd),
                    None => return Startup::Unmounted,
                },
            }
        }
    }

    fn finish(mut self) -> SessionSummary {
        self.acquiring = None;
        self.resolving = None;
        self.session.teardown();

        let connected_secs = self.session.connected_at().map(|start| {
            let end = self.session.ended_at().unwrap_or_else(Utc::now);
            (end - start).num_seconds()
        });
        let summary = SessionSummary {
            session_id: self.session.id().to_string(),
            appointment_id: self.session.appointment_id().to_string(),
            role: self.session.role(),
            final_state: self.session.state(),
            local_identity: self.session.local_identity().cloned(),
            remote_identity: self.session.remote_identity().cloned(),
            connected_at: self.session.connected_at(),
            ended_at: self.session.ended_at(),
            connected_secs,
        };
        tracing::info!(
            "Session {} finished in state {}",
            summary.session_id,
            summary.final_state
        );
        summary
    }

    fn command(&mut self, cmd: CallCommand) {
        match cmd {
            CallCommand::ToggleMute => {
                self.session.toggle_mute();
            }
            CallCommand::ToggleVideo => {
                self.session.toggle_video();
            }
            CallCommand::EndCall => {
                self.apply(SessionInput::EndRequested);
                return;
            }
        }
        self.render();
    }

    fn fabric_event(&mut self, event: FabricEvent) {
        match event {
            FabricEvent::Open(id) => self.apply(SessionInput::IdentityAssigned(id)),
            FabricEvent::Call(inbound) => self.apply(SessionInput::IncomingCall(inbound)),
            FabricEvent::Error(raw) => {
                tracing::warn!("Signaling fabric error: {}", raw);
                self.apply(SessionInput::Failed(CallError::SignalingError));
            }
            FabricEvent::Disconnected => {
                tracing::warn!("Signaling fabric disconnected");
                self.apply(SessionInput::Failed(CallError::ConnectionLost));
            }
        }
    }

    fn call_event(&mut self, envelope: CallEnvelope) {
        let input = match envelope.event {
            MediaCallEvent::Stream(stream) => SessionInput::RemoteStream {
                call: envelope.call,
                stream,
            },
            MediaCallEvent::Close => SessionInput::RemoteClosed {
                call: envelope.call,
            },
        };
        self.apply(input);
    }

    /// Hand an input to the session and carry out what it asks for.
    fn apply(&mut self, input: SessionInput) {
        let mut queue = VecDeque::from([input]);
        while let Some(input) = queue.pop_front() {
            for directive in self.session.handle(input) {
                if let Some(follow_up) = self.execute(directive) {
                    queue.push_back(follow_up);
                }
            }
        }

        if self.session.state().is_terminal() {
            self.acquiring = None;
            self.resolving = None;
        }
        self.render();
    }

    fn execute(&mut self, directive: Directive) -> Option<SessionInput> {
        tracing::debug!("Session {}: {}", self.session.id(), directive.name());
        match directive {
            Directive::AcquireMedia => {
                let devices = self.devices.clone();
                let constraints = MediaConstraints::consultation(&self.config.media);
                self.acquiring = Some(async move { devices.acquire(&constraints).await }.boxed());
            }
            Directive::PublishIdentity(id) => {
                let resolver = self.resolver();
                if let Err(e) = resolver.publish(&id) {
                    tracing::warn!("Publishing identity failed: {:#}", e);
                    return Some(SessionInput::Failed(CallError::SignalingError));
                }
            }
            Directive::ResolveRemote => {
                self.resolving = Some(self.resolver().resolve().boxed());
            }
            Directive::Watch { call, events } => self.watch(call, events),
            Directive::BindLocal(stream) => self.view.bind_local(stream),
            Directive::BindRemote(stream) => self.view.bind_remote(stream),
            Directive::ClearRemote => self.view.clear_remote(),
            Directive::Notice(notice) => self.view.notice(notice),
            Directive::NotifyEnded => {
                if let Some(on_end_call) = self.on_end_call.take() {
                    on_end_call();
                }
            }
        }
        None
    }

    fn resolver(&self) -> IdentityResolver {
        let rendezvous = &self.config.rendezvous;
        IdentityResolver::new(
            Arc::clone(&self.rendezvous),
            self.session.role(),
            rendezvous.max_attempts,
            rendezvous.poll_interval(),
        )
    }

    /// Forward a call's events into the loop. The session drops events for
    /// calls other than its active one.
    fn watch(&self, call: CallId, mut events: mpsc::UnboundedReceiver<MediaCallEvent>) {
        let tx = self.call_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let envelope = CallEnvelope {
                    call: call.clone(),
                    event,
                };
                if tx.send(envelope).is_err() {
                    break;
                }
            }
        });
    }

    fn render(&mut self) {
        let snapshot = self.session.snapshot();
        self.view.render(&snapshot);
    }
}

/// Probe the devices, then register. Owns clones so the controller stays
/// free to take commands meanwhile.
async fn startup(
    devices: DeviceAccessManager,
    fabric: Arc<dyn SignalingFabric>,
    options: RegistrationOptions,
) -> (PermissionStatus, Result<Registration, CallError>) {
    match devices.probe_permission().await {
        Ok(status) => {
            let registration = fabric.register(&options).await.map_err(|e| {
                tracing::warn!("Fabric registration failed: {}", e);
                CallError::SignalingError
            });
            (status, registration)
        }
        Err(cause) => (PermissionStatus::Denied, Err(cause)),
    }
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn await_or_pending<F>(fut: &mut Option<F>) -> F::Output
where
    F: Future + Unpin,
{
    match fut {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::devices::PlatformMediaError;
    use crate::calling::loopback::{LoopbackDevices, LoopbackFabric};
    use crate::calling::rendezvous::{LocationRendezvous, SharedLocation};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    #[derive(Default)]
    struct ViewLog {
        states: Vec<CallState>,
        last: Option<SessionSnapshot>,
        local: Option<StreamView>,
        remote: Option<StreamView>,
        notices: Vec<CallError>,
    }

    #[derive(Clone, Default)]
    struct RecordingView(Arc<Mutex<ViewLog>>);

    impl RecordingView {
        fn log(&self) -> std::sync::MutexGuard<'_, ViewLog> {
            self.0.lock().unwrap()
        }

        fn state(&self) -> Option<CallState> {
            self.log().last.as_ref().map(|s| s.state)
        }
    }

    impl CallView for RecordingView {
        fn render(&mut self, snapshot: &SessionSnapshot) {
            let mut log = self.log();
            if log.states.last() != Some(&snapshot.state) {
                log.states.push(snapshot.state);
            }
            log.last = Some(snapshot.clone());
        }

        fn bind_local(&mut self, stream: StreamView) {
            self.log().local = Some(stream);
        }

        fn bind_remote(&mut self, stream: StreamView) {
            self.log().remote = Some(stream);
        }

        fn clear_remote(&mut self) {
            self.log().remote = None;
        }

        fn notice(&mut self, notice: CallError) {
            self.log().notices.push(notice);
        }
    }

    /// Location rendezvous that counts lookups.
    struct CountingRendezvous {
        inner: LocationRendezvous,
        lookups: AtomicU32,
    }

    impl RendezvousChannel for CountingRendezvous {
        fn publish(&self, identity: &PeerIdentity) -> anyhow::Result<()> {
            self.inner.publish(identity)
        }

        fn lookup(&self) -> Option<PeerIdentity> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.lookup()
        }
    }

    struct Party {
        view: RecordingView,
        controls: CallControls,
        devices: Arc<LoopbackDevices>,
        ended: Arc<AtomicBool>,
        task: JoinHandle<SessionSummary>,
    }

    fn spawn_party(
        role: Role,
        fabric: &LoopbackFabric,
        devices: LoopbackDevices,
        rendezvous: Arc<dyn RendezvousChannel>,
    ) -> Party {
        let view = RecordingView::default();
        let devices = Arc::new(devices);
        let ended = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ended);
        let (controller, controls) = CallController::new(
            Config::default(),
            CallOptions {
                appointment_id: "APT-42".to_string(),
                role,
            },
            Arc::new(fabric.clone()),
            devices.clone(),
            rendezvous,
            Box::new(view.clone()),
            move || flag.store(true, Ordering::SeqCst),
        );
        Party {
            view,
            controls,
            devices,
            ended,
            task: tokio::spawn(controller.run()),
        }
    }

    fn location_rendezvous() -> (SharedLocation, Arc<CountingRendezvous>) {
        let location =
            SharedLocation::parse("https://clinic.example/appointments/APT-42/call").unwrap();
        let channel = Arc::new(CountingRendezvous {
            inner: LocationRendezvous::new(location.clone(), "patientPeerId"),
            lookups: AtomicU32::new(0),
        });
        (location, channel)
    }

    async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        for _ in 0..6000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initiator_times_out_without_patient() {
        let fabric = LoopbackFabric::with_identities(["C1"]);
        let (_location, rendezvous) = location_rendezvous();
        let doctor = spawn_party(Role::Initiator, &fabric, LoopbackDevices::new(), rendezvous.clone());

        let started = tokio::time::Instant::now();
        wait_for("timeout", || {
            doctor.view.state() == Some(CallState::Errored(CallError::ResolutionTimeout))
        })
        .await;
        assert!(started.elapsed() >= Duration::from_secs(29));
        assert_eq!(rendezvous.lookups.load(Ordering::SeqCst), 30);

        // Teardown happened on the error path.
        assert_eq!(doctor.devices.live_tracks(), 0);
        assert!(!fabric.is_registered(&PeerIdentity::new("C1")));
        assert!(!doctor.ended.load(Ordering::SeqCst));

        // No further lookups are scheduled.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rendezvous.lookups.load(Ordering::SeqCst), 30);

        // Dismissing the error notifies the host.
        doctor.controls.end_call();
        let summary = doctor.task.await.unwrap();
        assert_eq!(summary.final_state, CallState::Ended);
        assert!(doctor.ended.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_parties_connect_then_remote_hangs_up() {
        let fabric = LoopbackFabric::with_identities(["C1", "R1"]);
        let (location, rendezvous) = location_rendezvous();

        let doctor = spawn_party(Role::Initiator, &fabric, LoopbackDevices::new(), rendezvous.clone());
        wait_for("doctor identity", || {
            doctor.view.log().last.as_ref().and_then(|s| s.local_identity.clone())
                == Some(PeerIdentity::new("C1"))
        })
        .await;

        // The patient joins between the second and third lookup.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let patient = spawn_party(Role::Responder, &fabric, LoopbackDevices::new(), rendezvous.clone());

        wait_for("both connected", || {
            doctor.view.state() == Some(CallState::Connected)
                && patient.view.state() == Some(CallState::Connected)
        })
        .await;

        assert_eq!(location.query_param("patientPeerId").as_deref(), Some("R1"));
        assert_eq!(rendezvous.lookups.load(Ordering::SeqCst), 3);

        let c1 = PeerIdentity::new("C1");
        let r1 = PeerIdentity::new("R1");
        assert_eq!(fabric.outbound_calls(&c1), 1);
        assert_eq!(fabric.answers(&c1), 0);
        assert_eq!(fabric.outbound_calls(&r1), 0);
        assert_eq!(fabric.answers(&r1), 1);

        {
            let log = doctor.view.log();
            assert_eq!(
                log.states,
                [
                    CallState::Initializing,
                    CallState::AwaitingMedia,
                    CallState::AwaitingRemote,
                    CallState::Negotiating,
                    CallState::Connected,
                ]
            );
            assert!(log.local.is_some() && log.remote.is_some());
            let last = log.last.as_ref().unwrap();
            assert_eq!(last.remote_identity, Some(r1.clone()));
            assert_eq!(last.permission, PermissionStatus::Granted);
        }

        // Patient's camera off shows on the doctor's remote surface.
        patient.controls.toggle_video();
        wait_for("video off", || {
            patient.view.log().last.as_ref().is_some_and(|s| s.video_off)
        })
        .await;
        assert!(!doctor.view.log().remote.as_ref().unwrap().video_enabled());
        assert_eq!(patient.devices.live_tracks(), 2);

        // Patient hangs up.
        patient.controls.end_call();
        let patient_summary = patient.task.await.unwrap();
        assert_eq!(patient_summary.final_state, CallState::Ended);
        assert_eq!(patient_summary.remote_identity, Some(c1.clone()));
        assert!(patient.ended.load(Ordering::SeqCst));
        assert_eq!(patient.devices.live_tracks(), 0);

        wait_for("remote cleared", || doctor.view.log().remote.is_none()).await;
        {
            let log = doctor.view.log();
            assert_eq!(log.notices, [CallError::ConnectionLost]);
            assert_eq!(log.last.as_ref().unwrap().state, CallState::Connected);
        }
        assert!(!doctor.ended.load(Ordering::SeqCst));
        assert_eq!(doctor.devices.live_tracks(), 2);

        doctor.controls.end_call();
        let doctor_summary = doctor.task.await.unwrap();
        assert_eq!(doctor_summary.final_state, CallState::Ended);
        assert!(doctor_summary.connected_secs.is_some());
        assert!(doctor.ended.load(Ordering::SeqCst));
        assert_eq!(doctor.devices.live_tracks(), 0);
        assert!(!fabric.is_registered(&c1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_never_registers() {
        let fabric = LoopbackFabric::new();
        let (_location, rendezvous) = location_rendezvous();
        let devices =
            LoopbackDevices::new().fail_next(PlatformMediaError::new("NotAllowedError", "denied"));
        let patient = spawn_party(Role::Responder, &fabric, devices, rendezvous);

        wait_for("errored", || patient.view.state().is_some_and(|s| s.is_terminal())).await;
        {
            let log = patient.view.log();
            let last = log.last.as_ref().unwrap();
            assert_eq!(last.state, CallState::Errored(CallError::PermissionDenied));
            assert_eq!(last.permission, PermissionStatus::Denied);
        }
        assert_eq!(fabric.registrations(), 0);

        patient.controls.end_call();
        let summary = patient.task.await.unwrap();
        assert_eq!(summary.final_state, CallState::Ended);
        assert!(patient.ended.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fabric_disconnect_is_connection_lost() {
        let fabric = LoopbackFabric::with_identities(["R1"]);
        let (_location, rendezvous) = location_rendezvous();
        let patient = spawn_party(Role::Responder, &fabric, LoopbackDevices::new(), rendezvous);

        wait_for("awaiting remote", || {
            patient.view.state() == Some(CallState::AwaitingRemote)
        })
        .await;
        assert_eq!(patient.devices.live_tracks(), 2);

        assert!(fabric.disconnect(&PeerIdentity::new("R1")));
        wait_for("errored", || {
            patient.view.state() == Some(CallState::Errored(CallError::ConnectionLost))
        })
        .await;
        assert_eq!(patient.devices.live_tracks(), 0);
        assert!(!fabric.is_registered(&PeerIdentity::new("R1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fabric_error_is_signaling_error() {
        let fabric = LoopbackFabric::with_identities(["R1"]);
        let (_location, rendezvous) = location_rendezvous();
        let patient = spawn_party(Role::Responder, &fabric, LoopbackDevices::new(), rendezvous);

        wait_for("awaiting remote", || {
            patient.view.state() == Some(CallState::AwaitingRemote)
        })
        .await;

        assert!(fabric.inject_error(&PeerIdentity::new("R1"), "server-error"));
        wait_for("errored", || {
            patient.view.state() == Some(CallState::Errored(CallError::SignalingError))
        })
        .await;
        assert_eq!(patient.devices.live_tracks(), 0);
        assert!(!fabric.is_registered(&PeerIdentity::new("R1")));
        assert!(!patient.ended.load(Ordering::SeqCst));

        patient.controls.end_call();
        let summary = patient.task.await.unwrap();
        assert_eq!(summary.final_state, CallState::Ended);
        assert!(patient.ended.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_registration_is_signaling_error() {
        let fabric = LoopbackFabric::new().refusing_registrations();
        let (_location, rendezvous) = location_rendezvous();
        let doctor = spawn_party(Role::Initiator, &fabric, LoopbackDevices::new(), rendezvous);

        wait_for("errored", || {
            doctor.view.state() == Some(CallState::Errored(CallError::SignalingError))
        })
        .await;
        {
            let log = doctor.view.log();
            assert_eq!(
                log.states,
                [
                    CallState::Initializing,
                    CallState::Errored(CallError::SignalingError)
                ]
            );
            assert!(log.local.is_none());
        }
        // Only the permission probe touched the devices, and it let go.
        assert_eq!(doctor.devices.acquisitions(), 1);
        assert_eq!(doctor.devices.live_tracks(), 0);
        assert!(!doctor.ended.load(Ordering::SeqCst));

        doctor.controls.end_call();
        let summary = doctor.task.await.unwrap();
        assert_eq!(summary.final_state, CallState::Ended);
        assert!(doctor.ended.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmount_releases_everything() {
        let fabric = LoopbackFabric::with_identities(["R1"]);
        let (_location, rendezvous) = location_rendezvous();
        let Party {
            view,
            controls,
            devices,
            ended,
            task,
        } = spawn_party(Role::Responder, &fabric, LoopbackDevices::new(), rendezvous);

        wait_for("awaiting remote", || view.state() == Some(CallState::AwaitingRemote)).await;
        drop(controls);

        let summary = task.await.unwrap();
        assert_eq!(summary.final_state, CallState::AwaitingRemote);
        assert_eq!(devices.live_tracks(), 0);
        assert!(!fabric.is_registered(&PeerIdentity::new("R1")));
        assert!(!ended.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggles_through_controls() {
        let fabric = LoopbackFabric::with_identities(["R1"]);
        let (_location, rendezvous) = location_rendezvous();
        let patient = spawn_party(Role::Responder, &fabric, LoopbackDevices::new(), rendezvous);
        wait_for("awaiting remote", || {
            patient.view.state() == Some(CallState::AwaitingRemote)
        })
        .await;

        patient.controls.toggle_mute();
        wait_for("muted", || patient.view.log().last.as_ref().is_some_and(|s| s.muted)).await;
        assert!(!patient.view.log().local.as_ref().unwrap().audio_enabled());

        patient.controls.toggle_mute();
        wait_for("unmuted", || patient.view.log().last.as_ref().is_some_and(|s| !s.muted)).await;
        assert!(patient.view.log().local.as_ref().unwrap().audio_enabled());

        patient.controls.end_call();
        patient.task.await.unwrap();
        assert_eq!(patient.devices.live_tracks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_insecure_context_fails_fast() {
        let fabric = LoopbackFabric::new();
        let (_location, rendezvous) = location_rendezvous();
        let doctor = spawn_party(Role::Initiator, &fabric, LoopbackDevices::new().insecure(), rendezvous);
        wait_for("errored", || {
            doctor.view.state() == Some(CallState::Errored(CallError::InsecureContext))
        })
        .await;
        assert_eq!(doctor.devices.acquisitions(), 0);
    }
}
