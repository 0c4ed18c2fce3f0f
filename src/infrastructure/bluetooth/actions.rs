//! Action pipeline
//!
//! Binds read, write and subscribe requests to a ready session and carries
//! them out on the radio. A session holds at most one action in flight; its
//! outcome goes to the listener passed with the request.

use crate::domain::error::Rejection;
use crate::domain::models::{ActionKind, ActionRequest, Address, ConnectionHandle};
use crate::domain::session::SessionEvent;
use crate::infrastructure::bluetooth::connection::{lookup, SessionHandle, SessionTable};
use crate::infrastructure::bluetooth::listeners::BlueListener;
use std::sync::Arc;
use tracing::debug;

pub struct ActionPipeline {
    sessions: Arc<SessionTable>,
}

impl ActionPipeline {
    pub(crate) fn new(sessions: Arc<SessionTable>) -> Self {
        Self { sessions }
    }

    /// Submit `request` against the session for `address`.
    ///
    /// Refusals come back immediately and never reach `listener`. An accepted
    /// request resolves through exactly one of `on_action_success` /
    /// `on_action_failure`; a subscription keeps reporting successes until
    /// the next request or closure.
    pub fn perform(
        &self,
        address: &Address,
        request: ActionRequest,
        listener: Arc<dyn BlueListener>,
    ) -> Result<(), Rejection> {
        let handle = lookup(&self.sessions, address)
            .ok_or_else(|| Rejection::NoSession(address.clone()))?;
        debug!("{} requested on {}", request, address);
        handle.submit(request, listener)
    }
}

/// Start the radio operation for a freshly bound action
pub(crate) fn submit_to_radio(
    handle: &Arc<SessionHandle>,
    id: u64,
    link: ConnectionHandle,
    request: ActionRequest,
) {
    let session = handle.clone();
    handle.ctx.runtime.spawn(async move {
        let radio = &session.ctx.radio;
        let (service, characteristic) = request.target();
        let result = match request.kind() {
            ActionKind::Read => radio.read(&link, service, characteristic).await,
            ActionKind::Write(payload) => radio.write(&link, service, characteristic, payload).await,
            ActionKind::Subscribe => {
                let descriptor = session.ctx.config.notification_descriptor_uuid;
                radio
                    .subscribe(&link, service, characteristic, descriptor)
                    .await
            }
        };
        session.apply(SessionEvent::ActionCompleted { id, result });
    });
}
