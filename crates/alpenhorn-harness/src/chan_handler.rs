//! A channel-backed [`EventHandler`] for tests.
//!
//! Every callback forwards into an unbounded channel; tests await the
//! receivers with timeouts instead of polling client state.

use std::sync::Arc;

use alpenhorn_client::{
    ClientError, EventHandler, Friend, IncomingCall, IncomingFriendRequest, OutgoingCall,
    OutgoingFriendRequest,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::error;

/// Handler half: give this to the client.
pub struct ChanHandler {
    label: String,
    errors: UnboundedSender<String>,
    confirmed_friend: UnboundedSender<Friend>,
    sent_friend_request: UnboundedSender<OutgoingFriendRequest>,
    received_friend_request: UnboundedSender<IncomingFriendRequest>,
    sent_call: UnboundedSender<OutgoingCall>,
    received_call: UnboundedSender<IncomingCall>,
    unexpected_key: UnboundedSender<(IncomingFriendRequest, OutgoingFriendRequest)>,
}

/// Receiver half: tests await these.
pub struct ChanEvents {
    /// Stringified round-loop errors.
    pub errors: UnboundedReceiver<String>,
    /// Confirmed friendships.
    pub confirmed_friend: UnboundedReceiver<Friend>,
    /// Submitted friend requests.
    pub sent_friend_request: UnboundedReceiver<OutgoingFriendRequest>,
    /// Received friend requests.
    pub received_friend_request: UnboundedReceiver<IncomingFriendRequest>,
    /// Announced calls.
    pub sent_call: UnboundedReceiver<OutgoingCall>,
    /// Received calls.
    pub received_call: UnboundedReceiver<IncomingCall>,
    /// Pin mismatches.
    pub unexpected_key: UnboundedReceiver<(IncomingFriendRequest, OutgoingFriendRequest)>,
}

/// Build a connected handler/receiver pair. `label` prefixes error logs.
pub fn chan_handler(label: &str) -> (Arc<ChanHandler>, ChanEvents) {
    let (errors_tx, errors_rx) = unbounded_channel();
    let (confirmed_tx, confirmed_rx) = unbounded_channel();
    let (sent_req_tx, sent_req_rx) = unbounded_channel();
    let (recv_req_tx, recv_req_rx) = unbounded_channel();
    let (sent_call_tx, sent_call_rx) = unbounded_channel();
    let (recv_call_tx, recv_call_rx) = unbounded_channel();
    let (unexpected_tx, unexpected_rx) = unbounded_channel();

    let handler = Arc::new(ChanHandler {
        label: label.to_string(),
        errors: errors_tx,
        confirmed_friend: confirmed_tx,
        sent_friend_request: sent_req_tx,
        received_friend_request: recv_req_tx,
        sent_call: sent_call_tx,
        received_call: recv_call_tx,
        unexpected_key: unexpected_tx,
    });
    let events = ChanEvents {
        errors: errors_rx,
        confirmed_friend: confirmed_rx,
        sent_friend_request: sent_req_rx,
        received_friend_request: recv_req_rx,
        sent_call: sent_call_rx,
        received_call: recv_call_rx,
        unexpected_key: unexpected_rx,
    };
    (handler, events)
}

impl EventHandler for ChanHandler {
    fn error(&self, err: ClientError) {
        error!(label = %self.label, %err, "client error");
        let _ = self.errors.send(err.to_string());
    }

    fn confirmed_friend(&self, friend: Friend) {
        let _ = self.confirmed_friend.send(friend);
    }

    fn sent_friend_request(&self, request: OutgoingFriendRequest) {
        let _ = self.sent_friend_request.send(request);
    }

    fn received_friend_request(&self, request: IncomingFriendRequest) {
        let _ = self.received_friend_request.send(request);
    }

    fn sent_call(&self, call: OutgoingCall) {
        let _ = self.sent_call.send(call);
    }

    fn received_call(&self, call: IncomingCall) {
        let _ = self.received_call.send(call);
    }

    fn unexpected_signing_key(
        &self,
        incoming: IncomingFriendRequest,
        outgoing: OutgoingFriendRequest,
    ) {
        let _ = self.unexpected_key.send((incoming, outgoing));
    }
}
