//! Per-session state machine.
//!
//! A [`Session`] drives one address through
//! `Connecting -> ServiceDiscovery -> Ready -> Closing -> Closed`, with
//! `Failed` as the terminal for connect and discovery errors. Every input is a
//! [`SessionEvent`]; applying it mutates only the session and returns the
//! [`Effect`]s the runtime must carry out, in order. Nothing here touches a
//! radio, a timer or a listener, so the whole lifecycle is testable without
//! hardware.
//!
//! The listener type is a parameter so the runtime can attach whatever
//! callback handle it uses to each pending action.

use crate::domain::error::{RadioError, Rejection};
use crate::domain::models::{
    ActionKind, ActionRequest, Address, ConnectionHandle, ServiceMap, SessionState,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Input to the state machine
#[derive(Debug)]
pub enum SessionEvent {
    Connected(ConnectionHandle),
    ConnectFailed(RadioError),
    ServicesDiscovered(ServiceMap),
    DiscoveryFailed(RadioError),
    DiscoveryTimedOut,
    CloseRequested,
    /// Peer-initiated disconnect, or loss of the underlying stream
    LinkLost,
    /// The radio acknowledged a disconnect we asked for
    DisconnectConfirmed,
    ActionCompleted {
        id: u64,
        result: Result<Vec<u8>, RadioError>,
    },
    ValueChanged {
        service: Uuid,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

/// Work the runtime performs after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect<L> {
    Discover(ConnectionHandle),
    ArmDiscoveryTimer,
    CancelDiscoveryTimer,
    Disconnect(ConnectionHandle),
    Submit {
        id: u64,
        link: ConnectionHandle,
        request: ActionRequest,
    },
    Ready,
    ActionSucceeded {
        listener: L,
        action: ActionRequest,
        value: Vec<u8>,
    },
    ActionFailed {
        listener: L,
        action: ActionRequest,
    },
    /// The session reached a terminal state; fires exactly once
    Closed,
}

#[derive(Debug, Clone)]
struct PendingAction<L> {
    id: u64,
    request: ActionRequest,
    listener: L,
}

#[derive(Debug)]
pub struct Session<L> {
    address: Address,
    state: SessionState,
    link: Option<ConnectionHandle>,
    services: Option<ServiceMap>,
    pending: Option<PendingAction<L>>,
    subscription: Option<PendingAction<L>>,
    next_action_id: u64,
    notify_descriptor: Uuid,
}

impl<L: Clone> Session<L> {
    /// A new session in `Connecting`.
    ///
    /// `notify_descriptor` is the descriptor a characteristic must carry
    /// before it can be subscribed to.
    pub fn new(address: Address, notify_descriptor: Uuid) -> Self {
        Self {
            address,
            state: SessionState::Connecting,
            link: None,
            services: None,
            pending: None,
            subscription: None,
            next_action_id: 1,
            notify_descriptor,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn link(&self) -> Option<&ConnectionHandle> {
        self.link.as_ref()
    }

    pub fn services(&self) -> Option<&ServiceMap> {
        self.services.as_ref()
    }

    pub fn has_pending_action(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Bind `request` as the pending action, or refuse it.
    ///
    /// A new request ends any active subscription.
    pub fn submit(&mut self, request: ActionRequest, listener: L) -> Result<Vec<Effect<L>>, Rejection> {
        if self.state != SessionState::Ready {
            return Err(Rejection::NotReady {
                address: self.address.clone(),
                state: self.state,
            });
        }
        if self.pending.is_some() {
            return Err(Rejection::ActionPending(self.address.clone()));
        }
        let link = self.link.clone().ok_or(Rejection::NotReady {
            address: self.address.clone(),
            state: self.state,
        })?;

        let characteristic = self
            .services
            .as_ref()
            .and_then(|services| services.characteristic(request.service(), request.characteristic()))
            .ok_or(Rejection::UnknownCharacteristic {
                service: request.service(),
                characteristic: request.characteristic(),
            })?;
        if *request.kind() == ActionKind::Subscribe
            && !characteristic.has_descriptor(self.notify_descriptor)
        {
            return Err(Rejection::NotifyUnsupported(request.characteristic()));
        }

        let id = self.next_action_id;
        self.next_action_id += 1;
        self.subscription = None;
        self.pending = Some(PendingAction {
            id,
            request: request.clone(),
            listener,
        });

        Ok(vec![Effect::Submit { id, link, request }])
    }

    /// Apply one event and return the effects to run, in order
    pub fn apply(&mut self, event: SessionEvent) -> Vec<Effect<L>> {
        use SessionState::*;

        match (self.state, event) {
            // Terminal states only release links that show up late
            (Closed | Failed, SessionEvent::Connected(link)) => vec![Effect::Disconnect(link)],
            (Closed | Failed, _) => Vec::new(),

            (Connecting, SessionEvent::Connected(link)) => {
                self.state = ServiceDiscovery;
                self.link = Some(link.clone());
                vec![Effect::ArmDiscoveryTimer, Effect::Discover(link)]
            }
            (Connecting, SessionEvent::ConnectFailed(e)) => {
                warn!("Connect to {} failed: {}", self.address, e);
                self.terminate(Failed)
            }
            (Connecting, SessionEvent::LinkLost | SessionEvent::CloseRequested) => {
                self.terminate(Closed)
            }
            (Connecting, _) => Vec::new(),

            (ServiceDiscovery, SessionEvent::ServicesDiscovered(services)) => {
                debug!("{} exposes {} services", self.address, services.len());
                self.state = Ready;
                self.services = Some(services);
                vec![Effect::CancelDiscoveryTimer, Effect::Ready]
            }
            (ServiceDiscovery, SessionEvent::DiscoveryFailed(e)) => {
                warn!("Service discovery on {} failed: {}", self.address, e);
                let mut effects = vec![Effect::CancelDiscoveryTimer];
                effects.extend(self.link.clone().map(Effect::Disconnect));
                effects.extend(self.terminate(Failed));
                effects
            }
            (ServiceDiscovery, SessionEvent::DiscoveryTimedOut) => {
                warn!("Service discovery on {} timed out", self.address);
                self.begin_closing()
            }
            (ServiceDiscovery, SessionEvent::CloseRequested) => {
                let mut effects = vec![Effect::CancelDiscoveryTimer];
                effects.extend(self.begin_closing());
                effects
            }
            (ServiceDiscovery, SessionEvent::LinkLost) => {
                let mut effects = vec![Effect::CancelDiscoveryTimer];
                effects.extend(self.terminate(Closed));
                effects
            }
            (ServiceDiscovery, _) => Vec::new(),

            (Ready, SessionEvent::CloseRequested) => self.begin_closing(),
            (Ready | Closing, SessionEvent::LinkLost | SessionEvent::DisconnectConfirmed) => {
                self.terminate(Closed)
            }
            (Ready | Closing, SessionEvent::ActionCompleted { id, result }) => {
                self.complete_action(id, result)
            }
            (
                Ready,
                SessionEvent::ValueChanged {
                    service,
                    characteristic,
                    value,
                },
            ) => self.notify(service, characteristic, value),
            (Ready | Closing, _) => Vec::new(),
        }
    }

    fn begin_closing(&mut self) -> Vec<Effect<L>> {
        self.subscription = None;
        match self.link.clone() {
            Some(link) => {
                self.state = SessionState::Closing;
                vec![Effect::Disconnect(link)]
            }
            None => self.terminate(SessionState::Closed),
        }
    }

    /// Enter a terminal state: fail whatever is outstanding, then report closure
    fn terminate(&mut self, terminal: SessionState) -> Vec<Effect<L>> {
        self.state = terminal;
        self.subscription = None;

        let mut effects = Vec::new();
        if let Some(pending) = self.pending.take() {
            effects.push(Effect::ActionFailed {
                listener: pending.listener,
                action: pending.request,
            });
        }
        effects.push(Effect::Closed);
        effects
    }

    fn complete_action(&mut self, id: u64, result: Result<Vec<u8>, RadioError>) -> Vec<Effect<L>> {
        let pending = match self.pending.take() {
            Some(pending) if pending.id == id => pending,
            other => {
                // Stale completion from an action we already resolved
                self.pending = other;
                return Vec::new();
            }
        };

        let outcome = match (pending.request.kind(), result) {
            (ActionKind::Write(payload), Ok(confirmed)) if confirmed == *payload => Ok(confirmed),
            (ActionKind::Write(_), Ok(confirmed)) => {
                warn!(
                    "Write to {} confirmed {} bytes that differ from the payload",
                    self.address,
                    confirmed.len()
                );
                Err(())
            }
            (ActionKind::Subscribe, Ok(value)) => {
                if self.state == SessionState::Ready {
                    self.subscription = Some(pending.clone());
                }
                Ok(value)
            }
            (ActionKind::Read, Ok(value)) => Ok(value),
            (_, Err(e)) => {
                warn!("{} on {} failed: {}", pending.request, self.address, e);
                Err(())
            }
        };

        match outcome {
            Ok(value) => vec![Effect::ActionSucceeded {
                listener: pending.listener,
                action: pending.request,
                value,
            }],
            Err(()) => vec![Effect::ActionFailed {
                listener: pending.listener,
                action: pending.request,
            }],
        }
    }

    fn notify(&mut self, service: Uuid, characteristic: Uuid, value: Vec<u8>) -> Vec<Effect<L>> {
        // Data on the target means notifications are on, even if the
        // enable acknowledgement has not been applied yet
        let confirms_pending = self.pending.as_ref().is_some_and(|pending| {
            *pending.request.kind() == ActionKind::Subscribe
                && pending.request.target() == (service, characteristic)
        });
        if confirms_pending {
            self.subscription = self.pending.take();
        }

        match &self.subscription {
            Some(subscription) if subscription.request.target() == (service, characteristic) => {
                vec![Effect::ActionSucceeded {
                    listener: subscription.listener.clone(),
                    action: subscription.request.clone(),
                    value,
                }]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::CharacteristicInfo;

    const SERVICE: Uuid = Uuid::from_u128(0x1000);
    const CHAR: Uuid = Uuid::from_u128(0x1001);
    const NOTIFY_CHAR: Uuid = Uuid::from_u128(0x1002);
    const CCCD: Uuid = Uuid::from_u128(0x2902);

    fn link() -> ConnectionHandle {
        ConnectionHandle {
            id: 7,
            address: Address::new("AA:BB"),
        }
    }

    fn services() -> ServiceMap {
        ServiceMap::new().with_service(
            SERVICE,
            vec![
                CharacteristicInfo::new(CHAR),
                CharacteristicInfo::new(NOTIFY_CHAR).with_descriptor(CCCD),
            ],
        )
    }

    fn ready_session() -> Session<&'static str> {
        let mut session = Session::new(Address::new("AA:BB"), CCCD);
        session.apply(SessionEvent::Connected(link()));
        session.apply(SessionEvent::ServicesDiscovered(services()));
        assert_eq!(session.state(), SessionState::Ready);
        session
    }

    fn submitted_id(effects: &[Effect<&'static str>]) -> u64 {
        match effects {
            [Effect::Submit { id, .. }] => *id,
            other => panic!("expected a single submit, got {:?}", other),
        }
    }

    #[test]
    fn test_connect_arms_timer_and_discovers() {
        let mut session: Session<&str> = Session::new(Address::new("AA:BB"), CCCD);
        let effects = session.apply(SessionEvent::Connected(link()));
        assert_eq!(effects, vec![Effect::ArmDiscoveryTimer, Effect::Discover(link())]);
        assert_eq!(session.state(), SessionState::ServiceDiscovery);
    }

    #[test]
    fn test_discovery_success_cancels_timer() {
        let mut session: Session<&str> = Session::new(Address::new("AA:BB"), CCCD);
        session.apply(SessionEvent::Connected(link()));
        let effects = session.apply(SessionEvent::ServicesDiscovered(services()));
        assert_eq!(effects, vec![Effect::CancelDiscoveryTimer, Effect::Ready]);
    }

    #[test]
    fn test_connect_failure_closes_without_action_failure() {
        let mut session: Session<&str> = Session::new(Address::new("AA:BB"), CCCD);
        let effects = session.apply(SessionEvent::ConnectFailed(RadioError::ConnectFailed(
            "unreachable".into(),
        )));
        assert_eq!(effects, vec![Effect::Closed]);
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_timeout_wins_over_late_discovery() {
        let mut session: Session<&str> = Session::new(Address::new("AA:BB"), CCCD);
        session.apply(SessionEvent::Connected(link()));

        let effects = session.apply(SessionEvent::DiscoveryTimedOut);
        assert_eq!(effects, vec![Effect::Disconnect(link())]);
        assert_eq!(session.state(), SessionState::Closing);

        // Late success is discarded
        assert!(session
            .apply(SessionEvent::ServicesDiscovered(services()))
            .is_empty());

        let effects = session.apply(SessionEvent::DisconnectConfirmed);
        assert_eq!(effects, vec![Effect::Closed]);
        assert!(session.apply(SessionEvent::ServicesDiscovered(services())).is_empty());
    }

    #[test]
    fn test_discovery_error_disconnects_and_fails() {
        let mut session: Session<&str> = Session::new(Address::new("AA:BB"), CCCD);
        session.apply(SessionEvent::Connected(link()));
        let effects = session.apply(SessionEvent::DiscoveryFailed(RadioError::Gatt { status: 133 }));
        assert_eq!(
            effects,
            vec![Effect::CancelDiscoveryTimer, Effect::Disconnect(link()), Effect::Closed]
        );
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_single_pending_action() {
        let mut session = ready_session();
        let read = ActionRequest::read(SERVICE, CHAR);
        let write = ActionRequest::write(SERVICE, CHAR, vec![1, 2]);

        let id = submitted_id(&session.submit(read.clone(), "reader").unwrap());
        assert_eq!(
            session.submit(write.clone(), "writer"),
            Err(Rejection::ActionPending(Address::new("AA:BB")))
        );

        let effects = session.apply(SessionEvent::ActionCompleted {
            id,
            result: Ok(vec![9]),
        });
        assert_eq!(
            effects,
            vec![Effect::ActionSucceeded {
                listener: "reader",
                action: read,
                value: vec![9],
            }]
        );
        assert!(!session.has_pending_action());
        assert!(session.submit(write, "writer").is_ok());
    }

    #[test]
    fn test_write_requires_exact_echo() {
        let mut session = ready_session();
        let write = ActionRequest::write(SERVICE, CHAR, vec![1, 2, 3]);

        let id = submitted_id(&session.submit(write.clone(), "w").unwrap());
        let effects = session.apply(SessionEvent::ActionCompleted {
            id,
            result: Ok(vec![1, 2, 4]),
        });
        assert_eq!(
            effects,
            vec![Effect::ActionFailed {
                listener: "w",
                action: write.clone(),
            }]
        );

        let id = submitted_id(&session.submit(write.clone(), "w").unwrap());
        let effects = session.apply(SessionEvent::ActionCompleted {
            id,
            result: Ok(vec![1, 2, 3]),
        });
        assert_eq!(
            effects,
            vec![Effect::ActionSucceeded {
                listener: "w",
                action: write,
                value: vec![1, 2, 3],
            }]
        );
    }

    #[test]
    fn test_rejects_before_ready_and_unknown_targets() {
        let mut session: Session<&str> = Session::new(Address::new("AA:BB"), CCCD);
        assert!(matches!(
            session.submit(ActionRequest::read(SERVICE, CHAR), "r"),
            Err(Rejection::NotReady { state: SessionState::Connecting, .. })
        ));

        let mut session = ready_session();
        assert!(matches!(
            session.submit(ActionRequest::read(SERVICE, Uuid::from_u128(5)), "r"),
            Err(Rejection::UnknownCharacteristic { .. })
        ));
        assert_eq!(
            session.submit(ActionRequest::subscribe(SERVICE, CHAR), "s"),
            Err(Rejection::NotifyUnsupported(CHAR))
        );
    }

    #[test]
    fn test_subscription_repeats_until_new_action() {
        let mut session = ready_session();
        let subscribe = ActionRequest::subscribe(SERVICE, NOTIFY_CHAR);

        let id = submitted_id(&session.submit(subscribe.clone(), "s").unwrap());
        let effects = session.apply(SessionEvent::ActionCompleted {
            id,
            result: Ok(vec![0x01, 0x00]),
        });
        assert_eq!(effects.len(), 1);
        assert!(session.is_subscribed());
        assert!(!session.has_pending_action());

        for value in [vec![1], vec![2]] {
            let effects = session.apply(SessionEvent::ValueChanged {
                service: SERVICE,
                characteristic: NOTIFY_CHAR,
                value: value.clone(),
            });
            assert_eq!(
                effects,
                vec![Effect::ActionSucceeded {
                    listener: "s",
                    action: subscribe.clone(),
                    value,
                }]
            );
        }

        // Notifications for other characteristics are ignored
        assert!(session
            .apply(SessionEvent::ValueChanged {
                service: SERVICE,
                characteristic: CHAR,
                value: vec![3],
            })
            .is_empty());

        session.submit(ActionRequest::read(SERVICE, CHAR), "r").unwrap();
        assert!(!session.is_subscribed());
        assert!(session
            .apply(SessionEvent::ValueChanged {
                service: SERVICE,
                characteristic: NOTIFY_CHAR,
                value: vec![4],
            })
            .is_empty());
    }

    #[test]
    fn test_early_notification_confirms_pending_subscribe() {
        let mut session = ready_session();
        let subscribe = ActionRequest::subscribe(SERVICE, NOTIFY_CHAR);
        let id = submitted_id(&session.submit(subscribe.clone(), "s").unwrap());

        let effects = session.apply(SessionEvent::ValueChanged {
            service: SERVICE,
            characteristic: NOTIFY_CHAR,
            value: vec![7],
        });
        assert_eq!(
            effects,
            vec![Effect::ActionSucceeded {
                listener: "s",
                action: subscribe,
                value: vec![7],
            }]
        );
        assert!(session.is_subscribed());
        assert!(!session.has_pending_action());

        // The acknowledgement arriving afterwards is stale
        assert!(session
            .apply(SessionEvent::ActionCompleted {
                id,
                result: Ok(vec![0x01, 0x00]),
            })
            .is_empty());
    }

    #[test]
    fn test_link_loss_fails_pending_before_close() {
        let mut session = ready_session();
        let read = ActionRequest::read(SERVICE, CHAR);
        let id = submitted_id(&session.submit(read.clone(), "r").unwrap());

        let effects = session.apply(SessionEvent::LinkLost);
        assert_eq!(
            effects,
            vec![
                Effect::ActionFailed {
                    listener: "r",
                    action: read,
                },
                Effect::Closed,
            ]
        );

        // Nothing is reported after closure
        assert!(session
            .apply(SessionEvent::ActionCompleted {
                id,
                result: Ok(vec![1]),
            })
            .is_empty());
    }

    #[test]
    fn test_outcome_produced_while_closing_is_delivered_first() {
        let mut session = ready_session();
        let read = ActionRequest::read(SERVICE, CHAR);
        let id = submitted_id(&session.submit(read.clone(), "r").unwrap());

        assert_eq!(session.apply(SessionEvent::CloseRequested), vec![Effect::Disconnect(link())]);
        let effects = session.apply(SessionEvent::ActionCompleted {
            id,
            result: Ok(vec![5]),
        });
        assert_eq!(
            effects,
            vec![Effect::ActionSucceeded {
                listener: "r",
                action: read,
                value: vec![5],
            }]
        );
        assert_eq!(session.apply(SessionEvent::DisconnectConfirmed), vec![Effect::Closed]);
    }

    #[test]
    fn test_close_while_connecting_releases_late_link() {
        let mut session: Session<&str> = Session::new(Address::new("AA:BB"), CCCD);
        assert_eq!(session.apply(SessionEvent::CloseRequested), vec![Effect::Closed]);
        assert_eq!(
            session.apply(SessionEvent::Connected(link())),
            vec![Effect::Disconnect(link())]
        );
    }

    #[test]
    fn test_closed_fires_once() {
        let mut session = ready_session();
        session.apply(SessionEvent::CloseRequested);
        assert_eq!(session.apply(SessionEvent::DisconnectConfirmed), vec![Effect::Closed]);
        assert!(session.apply(SessionEvent::LinkLost).is_empty());
        assert!(session.apply(SessionEvent::DisconnectConfirmed).is_empty());
    }
}
