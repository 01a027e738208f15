use crate::mavlink::{decode, Frame, StateDelta};
use crate::metrics::Metrics;
use crate::session::{DropQueue, Session, SessionId};
use crate::state::{now_epoch, VehicleState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

pub enum HubEvent {
    Register(Arc<Session>),
    Unregister(SessionId),
    Inbound(Frame),
    Identity { system_id: u8, component_id: u8 },
}

/// The single serialization point between the autopilot link, the attached
/// sessions, and the telemetry store. All session-set and VehicleState
/// mutation happens on the hub task; everyone else holds a `HubHandle`.
pub struct Hub {
    rx: mpsc::UnboundedReceiver<HubEvent>,
    sessions: HashMap<SessionId, Arc<Session>>,
    state: VehicleState,
    state_tx: watch::Sender<VehicleState>,
    telemetry: Arc<DropQueue<StateDelta>>,
    metrics: Metrics,
}

#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubEvent>,
    state_rx: watch::Receiver<VehicleState>,
    next_session_id: Arc<AtomicU64>,
}

impl Hub {
    pub fn new(
        metrics: Metrics,
        telemetry_queue_cap: usize,
    ) -> (Self, HubHandle, Arc<DropQueue<StateDelta>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(VehicleState::default());
        let telemetry = Arc::new(DropQueue::new(telemetry_queue_cap));

        let hub = Hub {
            rx,
            sessions: HashMap::new(),
            state: VehicleState::default(),
            state_tx,
            telemetry: Arc::clone(&telemetry),
            metrics,
        };
        let handle = HubHandle {
            tx,
            state_rx,
            next_session_id: Arc::new(AtomicU64::new(1)),
        };
        (hub, handle, telemetry)
    }

    pub async fn run(mut self) {
        info!("Hub started");

        while let Some(event) = self.rx.recv().await {
            match event {
                HubEvent::Register(session) => self.handle_register(session),
                HubEvent::Unregister(id) => self.handle_unregister(id),
                HubEvent::Inbound(frame) => self.handle_inbound(frame),
                HubEvent::Identity {
                    system_id,
                    component_id,
                } => {
                    self.state.record_identity(system_id, component_id);
                    self.publish_state();
                }
            }
        }

        self.telemetry.close();
        info!("Hub stopped");
    }

    fn handle_register(&mut self, session: Arc<Session>) {
        info!("Hub: session {} attached", session);
        self.metrics.session_opened();
        self.sessions.insert(session.id, session);
    }

    fn handle_unregister(&mut self, id: SessionId) {
        // Idempotent: sessions unregister themselves on close and the hub
        // may also evict them on shutdown.
        if let Some(session) = self.sessions.remove(&id) {
            session.queue.close();
            self.metrics.session_closed();
            info!("Hub: session {} detached", session);
        }
    }

    fn handle_inbound(&mut self, frame: Frame) {
        self.metrics.record_received();
        if frame.msg_id() == crate::mavlink::frame::HEARTBEAT_MSG_ID {
            self.metrics.record_heartbeat();
        }

        // Project the frame into VehicleState and offer the delta to the
        // telemetry store. Unknown ids are forwarded untouched.
        if let Some(delta) = decode(&frame) {
            if !delta.is_empty() {
                self.state.apply(&delta, now_epoch());
                self.publish_state();
                self.telemetry.push(delta);
            }
        }

        debug!(
            "Hub: fan-out msgid={} sysid={} to {} session(s)",
            frame.msg_id(),
            frame.sys_id(),
            self.sessions.len()
        );

        let frame_len = frame.len();
        for session in self.sessions.values() {
            // Frame handles share the packet buffer; a full queue drops that
            // session's oldest entry, never the feed to anyone else.
            if session.queue.push(frame.clone()) {
                self.metrics.record_routed(frame_len);
            } else {
                self.metrics.record_dropped();
            }
        }
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.state.clone());
    }
}

impl HubHandle {
    pub fn allocate_session_id(&self) -> SessionId {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, session: Arc<Session>) {
        let _ = self.tx.send(HubEvent::Register(session));
    }

    pub fn unregister(&self, id: SessionId) {
        let _ = self.tx.send(HubEvent::Unregister(id));
    }

    pub fn publish_frame(&self, frame: Frame) {
        let _ = self.tx.send(HubEvent::Inbound(frame));
    }

    pub fn publish_identity(&self, system_id: u8, component_id: u8) {
        let _ = self.tx.send(HubEvent::Identity {
            system_id,
            component_id,
        });
    }

    /// Current VehicleState snapshot.
    pub fn vehicle_state(&self) -> VehicleState {
        self.state_rx.borrow().clone()
    }

    /// Read-only view channel for observers that want change notifications.
    pub fn state_receiver(&self) -> watch::Receiver<VehicleState> {
        self.state_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mavlink::serialize_v2;
    use crate::session::Transport;
    use std::time::Duration;

    fn armed_heartbeat(seq: u8) -> Frame {
        let mut payload = [0u8; 9];
        payload[6] = 0x81;
        serialize_v2(seq, 1, 1, 0, &payload).unwrap()
    }

    #[tokio::test]
    async fn fan_out_preserves_order_per_session() {
        let (hub, handle, _telemetry) = Hub::new(Metrics::new(), 16);
        tokio::spawn(hub.run());

        let a = Session::new(handle.allocate_session_id(), Transport::Tcp, "a".into(), 64);
        let b = Session::new(
            handle.allocate_session_id(),
            Transport::WebSocket,
            "b".into(),
            64,
        );
        handle.register(Arc::clone(&a));
        handle.register(Arc::clone(&b));

        let frames: Vec<Frame> = (0..10).map(armed_heartbeat).collect();
        for frame in &frames {
            handle.publish_frame(frame.clone());
        }

        for session in [&a, &b] {
            for expected in &frames {
                let got = tokio::time::timeout(Duration::from_secs(1), session.queue.pop())
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(got.as_bytes(), expected.as_bytes());
            }
        }
    }

    #[tokio::test]
    async fn slow_session_drops_do_not_affect_others() {
        let (hub, handle, _telemetry) = Hub::new(Metrics::new(), 16);
        tokio::spawn(hub.run());

        let slow = Session::new(handle.allocate_session_id(), Transport::Tcp, "slow".into(), 4);
        let fast = Session::new(
            handle.allocate_session_id(),
            Transport::Tcp,
            "fast".into(),
            1024,
        );
        handle.register(Arc::clone(&slow));
        handle.register(Arc::clone(&fast));

        for seq in 0..100u8 {
            handle.publish_frame(armed_heartbeat(seq));
        }

        // The fast session sees every frame, in order.
        let mut expected_seq = 0u8;
        for _ in 0..100 {
            let frame = tokio::time::timeout(Duration::from_secs(1), fast.queue.pop())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(frame.sequence(), expected_seq);
            expected_seq = expected_seq.wrapping_add(1);
        }

        // The slow one was truncated to its capacity, drops counted.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(slow.queue.dropped() >= 90);
        assert!(slow.queue.len() <= 4);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let (hub, handle, _telemetry) = Hub::new(Metrics::new(), 16);
        tokio::spawn(hub.run());

        let session = Session::new(handle.allocate_session_id(), Transport::Tcp, "x".into(), 8);
        handle.register(Arc::clone(&session));
        handle.unregister(session.id);
        handle.unregister(session.id);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.queue.is_closed());
    }

    #[tokio::test]
    async fn state_projection_and_telemetry_queue() {
        let (hub, handle, telemetry) = Hub::new(Metrics::new(), 16);
        tokio::spawn(hub.run());

        let mut state_rx = handle.state_receiver();
        handle.publish_identity(1, 1);
        handle.publish_frame(armed_heartbeat(0));

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                state_rx.changed().await.unwrap();
                let state = state_rx.borrow_and_update().clone();
                if state.armed == Some(true) {
                    assert_eq!(state.system_id, Some(1));
                    break;
                }
            }
        })
        .await
        .unwrap();

        let delta = tokio::time::timeout(Duration::from_secs(1), telemetry.pop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delta.armed, Some(true));
    }
}
