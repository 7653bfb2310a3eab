//! In-process signaling fabric and media devices.
//!
//! Both parties of a consultation can run in one process against these,
//! which is what the `consult` command and the tests do. Media "flows" by
//! handing the caller's track handles to the callee and vice versa, so a
//! mute on one side is visible on the other.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::devices::{MediaConstraints, MediaDevices, PlatformMediaError, VideoRequest};
use super::fabric::{
    CallAnswerer, CallControl, CallId, Endpoint, FabricError, FabricEvent, InboundCall, MediaCall,
    MediaCallEvent, PeerIdentity, Registration, RegistrationOptions, SignalingFabric,
};
use super::media::{LocalMediaStream, MediaTrack, RemoteMediaStream, TrackKind};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct LinkSenders {
    caller: Option<mpsc::UnboundedSender<MediaCallEvent>>,
    callee: Option<mpsc::UnboundedSender<MediaCallEvent>>,
}

/// Both directions of one call. Closing drops both senders, so each side
/// sees `Close` and then the end of its event stream.
struct CallLink {
    id: CallId,
    closed: AtomicBool,
    senders: Mutex<LinkSenders>,
}

impl CallLink {
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("Loopback call {} closed", self.id);
        let senders = std::mem::take(&mut *lock(&self.senders));
        for tx in [senders.caller, senders.callee].into_iter().flatten() {
            let _ = tx.send(MediaCallEvent::Close);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct LinkControl(Arc<CallLink>);

impl CallControl for LinkControl {
    fn close(&self) {
        self.0.close();
    }
}

struct EndpointSlot {
    events: mpsc::UnboundedSender<FabricEvent>,
    calls: Vec<Arc<CallLink>>,
}

#[derive(Default)]
struct FabricState {
    endpoints: HashMap<PeerIdentity, EndpointSlot>,
    scripted_ids: VecDeque<String>,
    outbound: HashMap<PeerIdentity, u32>,
    answers: HashMap<PeerIdentity, u32>,
    refuse_registrations: bool,
    registrations: u32,
}

/// In-memory signaling fabric.
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    state: Arc<Mutex<FabricState>>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out these identities (in order) before falling back to random ones.
    pub fn with_identities<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fabric = Self::new();
        lock(&fabric.state).scripted_ids = ids.into_iter().map(Into::into).collect();
        fabric
    }

    /// Make every registration fail.
    pub fn refusing_registrations(self) -> Self {
        lock(&self.state).refuse_registrations = true;
        self
    }

    pub fn is_registered(&self, id: &PeerIdentity) -> bool {
        lock(&self.state).endpoints.contains_key(id)
    }

    pub fn registrations(&self) -> u32 {
        lock(&self.state).registrations
    }

    /// Outbound calls placed by `id`.
    pub fn outbound_calls(&self, id: &PeerIdentity) -> u32 {
        lock(&self.state).outbound.get(id).copied().unwrap_or(0)
    }

    /// Inbound calls answered by `id`.
    pub fn answers(&self, id: &PeerIdentity) -> u32 {
        lock(&self.state).answers.get(id).copied().unwrap_or(0)
    }

    /// Raise an error event on a registration.
    pub fn inject_error(&self, id: &PeerIdentity, message: &str) -> bool {
        self.emit(id, FabricEvent::Error(message.to_string()))
    }

    /// Simulate losing the fabric connection.
    pub fn disconnect(&self, id: &PeerIdentity) -> bool {
        self.emit(id, FabricEvent::Disconnected)
    }

    fn emit(&self, id: &PeerIdentity, event: FabricEvent) -> bool {
        match lock(&self.state).endpoints.get(id) {
            Some(slot) => slot.events.send(event).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
impl LoopbackFabric {
    /// Calls the endpoint still keeps a link to.
    fn tracked_calls(&self, id: &PeerIdentity) -> usize {
        lock(&self.state)
            .endpoints
            .get(id)
            .map_or(0, |slot| slot.calls.len())
    }
}

#[async_trait]
impl SignalingFabric for LoopbackFabric {
    async fn register(&self, options: &RegistrationOptions) -> Result<Registration, FabricError> {
        let mut state = lock(&self.state);
        if state.refuse_registrations {
            return Err(FabricError("registration refused".to_string()));
        }

        let id = state
            .scripted_ids
            .pop_front()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let id = PeerIdentity::new(id);

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(FabricEvent::Open(id.clone()));
        state.endpoints.insert(
            id.clone(),
            EndpointSlot {
                events: tx,
                calls: Vec::new(),
            },
        );
        state.registrations += 1;

        tracing::debug!(
            "Loopback registered {} ({} ice servers, debug={})",
            id,
            options.ice_servers.len(),
            options.debug_level
        );

        Ok(Registration {
            endpoint: Box::new(LoopbackEndpoint {
                id,
                state: Arc::clone(&self.state),
                destroyed: AtomicBool::new(false),
            }),
            events: rx,
        })
    }
}

struct LoopbackEndpoint {
    id: PeerIdentity,
    state: Arc<Mutex<FabricState>>,
    destroyed: AtomicBool,
}

impl Endpoint for LoopbackEndpoint {
    fn call(
        &self,
        remote: &PeerIdentity,
        local: &LocalMediaStream,
    ) -> Result<MediaCall, FabricError> {
        if self.is_destroyed() {
            return Err(FabricError("endpoint destroyed".to_string()));
        }

        let mut state = lock(&self.state);
        *state.outbound.entry(self.id.clone()).or_default() += 1;

        let callee_events = match state.endpoints.get(remote) {
            Some(slot) => slot.events.clone(),
            None => return Err(FabricError(format!("peer-unavailable: {}", remote))),
        };

        let id = CallId::new(uuid::Uuid::new_v4().to_string());
        let (caller_tx, caller_rx) = mpsc::unbounded_channel();
        let link = Arc::new(CallLink {
            id: id.clone(),
            closed: AtomicBool::new(false),
            senders: Mutex::new(LinkSenders {
                caller: Some(caller_tx),
                callee: None,
            }),
        });

        let answerer = LoopbackAnswerer {
            link: Arc::clone(&link),
            caller: self.id.clone(),
            callee: remote.clone(),
            offered: RemoteMediaStream::new(local.id(), local.tracks().to_vec()),
            state: Arc::clone(&self.state),
            answered: false,
        };
        let inbound = InboundCall::new(id.clone(), self.id.clone(), Box::new(answerer));
        if callee_events.send(FabricEvent::Call(inbound)).is_err() {
            return Err(FabricError(format!("peer-unavailable: {}", remote)));
        }

        for peer in [&self.id, remote] {
            if let Some(slot) = state.endpoints.get_mut(peer) {
                slot.calls.retain(|l| !l.is_closed());
                slot.calls.push(Arc::clone(&link));
            }
        }

        tracing::debug!("Loopback call {} offered {} -> {}", id, self.id, remote);
        Ok(MediaCall {
            id,
            peer: remote.clone(),
            events: caller_rx,
            control: Box::new(LinkControl(link)),
        })
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let slot = lock(&self.state).endpoints.remove(&self.id);
        if let Some(slot) = slot {
            for link in slot.calls {
                link.close();
            }
        }
        tracing::debug!("Loopback endpoint {} destroyed", self.id);
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

struct LoopbackAnswerer {
    link: Arc<CallLink>,
    caller: PeerIdentity,
    callee: PeerIdentity,
    offered: RemoteMediaStream,
    state: Arc<Mutex<FabricState>>,
    answered: bool,
}

impl CallAnswerer for LoopbackAnswerer {
    fn answer(mut self: Box<Self>, local: &LocalMediaStream) -> Result<MediaCall, FabricError> {
        self.answered = true;

        let (callee_tx, callee_rx) = mpsc::unbounded_channel();
        {
            let mut senders = lock(&self.link.senders);
            // Checked under the lock so a concurrent close sees the callee side.
            if self.link.is_closed() {
                return Err(FabricError(format!("call {} already closed", self.link.id)));
            }
            let _ = callee_tx.send(MediaCallEvent::Stream(self.offered.clone()));
            senders.callee = Some(callee_tx);

            let answer = RemoteMediaStream::new(local.id(), local.tracks().to_vec());
            if let Some(caller) = &senders.caller {
                let _ = caller.send(MediaCallEvent::Stream(answer));
            }
        }

        *lock(&self.state)
            .answers
            .entry(self.callee.clone())
            .or_default() += 1;

        Ok(MediaCall {
            id: self.link.id.clone(),
            peer: self.caller.clone(),
            events: callee_rx,
            control: Box::new(LinkControl(Arc::clone(&self.link))),
        })
    }
}

impl Drop for LoopbackAnswerer {
    fn drop(&mut self) {
        if !self.answered {
            tracing::debug!("Loopback call {} rejected by {}", self.link.id, self.callee);
            self.link.close();
        }
    }
}

/// Scripted camera and microphone.
pub struct LoopbackDevices {
    secure: bool,
    media_api: bool,
    failures: Mutex<VecDeque<PlatformMediaError>>,
    handed_out: Mutex<Vec<Arc<MediaTrack>>>,
    last_constraints: Mutex<Option<MediaConstraints>>,
    acquisitions: AtomicU32,
}

impl Default for LoopbackDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackDevices {
    pub fn new() -> Self {
        Self {
            secure: true,
            media_api: true,
            failures: Mutex::new(VecDeque::new()),
            handed_out: Mutex::new(Vec::new()),
            last_constraints: Mutex::new(None),
            acquisitions: AtomicU32::new(0),
        }
    }

    pub fn insecure(mut self) -> Self {
        self.secure = false;
        self
    }

    pub fn without_media_api(mut self) -> Self {
        self.media_api = false;
        self
    }

    /// Fail the next request with `err`. Queued failures are used in order.
    pub fn fail_next(self, err: PlatformMediaError) -> Self {
        lock(&self.failures).push_back(err);
        self
    }

    /// Requests made so far, successful or not.
    pub fn acquisitions(&self) -> u32 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Tracks handed out and not yet stopped.
    pub fn live_tracks(&self) -> usize {
        lock(&self.handed_out).iter().filter(|t| t.is_live()).count()
    }

    pub fn last_constraints(&self) -> Option<MediaConstraints> {
        lock(&self.last_constraints).clone()
    }
}

#[async_trait]
impl MediaDevices for LoopbackDevices {
    fn is_secure_context(&self) -> bool {
        self.secure
    }

    fn supports_media(&self) -> bool {
        self.media_api
    }

    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaStream, PlatformMediaError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_constraints) = Some(constraints.clone());

        if let Some(err) = lock(&self.failures).pop_front() {
            return Err(err);
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, "Loopback Microphone"));
        }
        match &constraints.video {
            VideoRequest::Off => {}
            VideoRequest::Any => tracks.push(MediaTrack::new(TrackKind::Video, "Loopback Camera")),
            VideoRequest::Preferred(v) => tracks.push(MediaTrack::new(
                TrackKind::Video,
                format!("Loopback Camera ({}x{})", v.ideal_width, v.ideal_height),
            )),
        }

        lock(&self.handed_out).extend(tracks.iter().cloned());
        Ok(LocalMediaStream::new(tracks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> LocalMediaStream {
        LocalMediaStream::new(vec![
            MediaTrack::new(TrackKind::Audio, "mic"),
            MediaTrack::new(TrackKind::Video, "cam"),
        ])
    }

    async fn open(reg: &mut Registration) -> PeerIdentity {
        match reg.events.recv().await {
            Some(FabricEvent::Open(id)) => id,
            other => panic!("expected open, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_uses_scripted_ids() {
        let fabric = LoopbackFabric::with_identities(["R1"]);
        let opts = RegistrationOptions::default();
        let mut first = fabric.register(&opts).await.unwrap();
        let mut second = fabric.register(&opts).await.unwrap();
        assert_eq!(open(&mut first).await, PeerIdentity::new("R1"));
        let other = open(&mut second).await;
        assert_ne!(other, PeerIdentity::new("R1"));
        assert!(fabric.is_registered(&other));
        assert_eq!(fabric.registrations(), 2);
    }

    #[tokio::test]
    async fn test_call_and_answer_exchange_streams() {
        let fabric = LoopbackFabric::with_identities(["C1", "R1"]);
        let opts = RegistrationOptions::default();
        let mut caller = fabric.register(&opts).await.unwrap();
        let mut callee = fabric.register(&opts).await.unwrap();
        let caller_id = open(&mut caller).await;
        let callee_id = open(&mut callee).await;

        let caller_stream = stream();
        let callee_stream = stream();
        let mut outbound = caller.endpoint.call(&callee_id, &caller_stream).unwrap();

        let inbound = match callee.events.recv().await {
            Some(FabricEvent::Call(call)) => call,
            other => panic!("expected call, got {:?}", other),
        };
        assert_eq!(inbound.peer(), &caller_id);
        let mut answered = inbound.answer(&callee_stream).unwrap();

        match outbound.events.recv().await {
            Some(MediaCallEvent::Stream(s)) => assert_eq!(s.id(), callee_stream.id()),
            other => panic!("expected stream, got {:?}", other),
        }
        match answered.events.recv().await {
            Some(MediaCallEvent::Stream(s)) => assert_eq!(s.id(), caller_stream.id()),
            other => panic!("expected stream, got {:?}", other),
        }

        assert_eq!(fabric.outbound_calls(&caller_id), 1);
        assert_eq!(fabric.answers(&callee_id), 1);
        assert_eq!(fabric.outbound_calls(&callee_id), 0);

        answered.control.close();
        assert!(matches!(
            outbound.events.recv().await,
            Some(MediaCallEvent::Close)
        ));
        // Both event streams end once the call is closed.
        assert!(outbound.events.recv().await.is_none());
        assert!(matches!(
            answered.events.recv().await,
            Some(MediaCallEvent::Close)
        ));
        assert!(answered.events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_calls_are_pruned() {
        let fabric = LoopbackFabric::with_identities(["C1", "R1"]);
        let opts = RegistrationOptions::default();
        let caller = fabric.register(&opts).await.unwrap();
        let mut callee = fabric.register(&opts).await.unwrap();
        let _ = open(&mut callee).await;
        let (c1, r1) = (PeerIdentity::new("C1"), PeerIdentity::new("R1"));

        let first = caller.endpoint.call(&r1, &stream()).unwrap();
        assert_eq!(fabric.tracked_calls(&c1), 1);
        first.control.close();

        let _second = caller.endpoint.call(&r1, &stream()).unwrap();
        assert_eq!(fabric.tracked_calls(&c1), 1);
        assert_eq!(fabric.tracked_calls(&r1), 1);
        assert_eq!(fabric.outbound_calls(&c1), 2);
    }

    #[tokio::test]
    async fn test_call_unknown_peer_fails() {
        let fabric = LoopbackFabric::new();
        let reg = fabric.register(&RegistrationOptions::default()).await.unwrap();
        let err = reg
            .endpoint
            .call(&PeerIdentity::new("nobody"), &stream())
            .err()
            .unwrap();
        assert!(err.0.contains("peer-unavailable"));
    }

    #[tokio::test]
    async fn test_rejected_call_closes() {
        let fabric = LoopbackFabric::with_identities(["C1", "R1"]);
        let opts = RegistrationOptions::default();
        let caller = fabric.register(&opts).await.unwrap();
        let mut callee = fabric.register(&opts).await.unwrap();
        let _ = open(&mut callee).await;

        let mut outbound = caller.endpoint.call(&PeerIdentity::new("R1"), &stream()).unwrap();
        drop(callee.events.recv().await);
        assert!(matches!(
            outbound.events.recv().await,
            Some(MediaCallEvent::Close)
        ));
        assert_eq!(fabric.answers(&PeerIdentity::new("R1")), 0);
    }

    #[tokio::test]
    async fn test_destroy_unregisters_and_closes_calls() {
        let fabric = LoopbackFabric::with_identities(["C1", "R1"]);
        let opts = RegistrationOptions::default();
        let caller = fabric.register(&opts).await.unwrap();
        let mut callee = fabric.register(&opts).await.unwrap();
        let _ = open(&mut callee).await;

        let mut outbound = caller.endpoint.call(&PeerIdentity::new("R1"), &stream()).unwrap();
        let inbound = match callee.events.recv().await {
            Some(FabricEvent::Call(call)) => call,
            other => panic!("expected call, got {:?}", other),
        };
        let _answered = inbound.answer(&stream()).unwrap();

        callee.endpoint.destroy();
        assert!(callee.endpoint.is_destroyed());
        assert!(!fabric.is_registered(&PeerIdentity::new("R1")));

        assert!(matches!(
            outbound.events.recv().await,
            Some(MediaCallEvent::Stream(_))
        ));
        assert!(matches!(
            outbound.events.recv().await,
            Some(MediaCallEvent::Close)
        ));
    }

    #[tokio::test]
    async fn test_refused_registration() {
        let fabric = LoopbackFabric::new().refusing_registrations();
        assert!(fabric.register(&RegistrationOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_devices_track_handed_out() {
        let devices = LoopbackDevices::new();
        let mut s = devices
            .get_user_media(&MediaConstraints::probe())
            .await
            .unwrap();
        assert_eq!(devices.live_tracks(), 2);
        s.release();
        assert_eq!(devices.live_tracks(), 0);
        assert_eq!(devices.last_constraints(), Some(MediaConstraints::probe()));
    }
}
