//! The callback surface and the records it delivers.
//!
//! The application implements [`EventHandler`]; the client invokes it with
//! the lock released, so handlers may call back into the client freely.
//! Handle types ([`Friend`], [`IncomingFriendRequest`]) carry a non-owning
//! back-reference to the client; after [`Client::close`](crate::Client::close)
//! their methods return [`ClientError::Closed`].

use std::sync::Weak;

use alpenhorn_proto::PkgServerConfig;
use ed25519_dalek::VerifyingKey;

use crate::{client::ClientInner, error::ClientError};

/// Application callbacks.
///
/// Invoked from the client's round loops, never with the client lock held.
/// Callbacks for round `r + 1` are delivered only after every callback for
/// round `r`.
pub trait EventHandler: Send + Sync + 'static {
    /// A round loop hit an error; the round was abandoned and will be
    /// retried with the next announcement.
    fn error(&self, err: ClientError);

    /// A friendship was confirmed; the keywheel now has an entry for them.
    fn confirmed_friend(&self, friend: Friend);

    /// An outgoing friend request was submitted to a round.
    fn sent_friend_request(&self, request: OutgoingFriendRequest);

    /// A friend request arrived that matched no outgoing request.
    fn received_friend_request(&self, request: IncomingFriendRequest);

    /// A call was announced to a friend.
    fn sent_call(&self, call: OutgoingCall);

    /// A friend announced a call to us.
    fn received_call(&self, call: IncomingCall);

    /// A reply's long-term key did not match the pin on our outgoing
    /// request. Nothing was confirmed.
    fn unexpected_signing_key(
        &self,
        incoming: IncomingFriendRequest,
        outgoing: OutgoingFriendRequest,
    );
}

/// A confirmed contact.
#[derive(Clone)]
pub struct Friend {
    pub(crate) username: String,
    pub(crate) long_term_key: VerifyingKey,
    pub(crate) client: Weak<ClientInner>,
}

impl Friend {
    /// The friend's username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The friend's long-term signing key.
    pub fn long_term_key(&self) -> &VerifyingKey {
        &self.long_term_key
    }
}

impl std::fmt::Debug for Friend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Friend").field("username", &self.username).finish_non_exhaustive()
    }
}

/// A queued outgoing friend request, as surfaced to callbacks.
#[derive(Debug, Clone)]
pub struct OutgoingFriendRequest {
    /// Target username.
    pub username: String,
    /// Pinned long-term key, if any.
    pub expected_key: Option<VerifyingKey>,
    /// Dialing round the friendship will synchronize on.
    pub dial_round: u32,
}

/// A friend request received from a mailbox.
#[derive(Clone)]
pub struct IncomingFriendRequest {
    pub(crate) username: String,
    pub(crate) long_term_key: VerifyingKey,
    pub(crate) dh_public: [u8; 32],
    pub(crate) dial_round: u32,
    pub(crate) round: u32,
    pub(crate) verifiers: Vec<PkgServerConfig>,
    pub(crate) client: Weak<ClientInner>,
}

impl IncomingFriendRequest {
    /// The sender's username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The sender's claimed long-term key, verified against their intro
    /// signature.
    pub fn long_term_key(&self) -> &VerifyingKey {
        &self.long_term_key
    }

    /// The sender's ephemeral DH public key.
    pub fn dh_public(&self) -> &[u8; 32] {
        &self.dh_public
    }

    /// The dialing round the sender proposed.
    pub fn dial_round(&self) -> u32 {
        self.dial_round
    }

    /// The add-friend round this request arrived in.
    pub fn round(&self) -> u32 {
        self.round
    }

    /// The PKG committee as of the round the request was created in.
    pub fn verifiers(&self) -> &[PkgServerConfig] {
        &self.verifiers
    }
}

impl std::fmt::Debug for IncomingFriendRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingFriendRequest")
            .field("username", &self.username)
            .field("round", &self.round)
            .finish_non_exhaustive()
    }
}

/// A call announced to a friend.
#[derive(Debug, Clone)]
pub struct OutgoingCall {
    /// The friend who was called.
    pub username: String,
    /// Application-opaque intent, preserved end-to-end.
    pub intent: u8,
    /// The session key both sides derive for this round.
    pub session_key: [u8; 32],
    /// The dialing round the call went out in.
    pub round: u32,
}

/// A call received from a friend.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    /// The friend who called.
    pub username: String,
    /// Application-opaque intent, preserved end-to-end.
    pub intent: u8,
    /// The session key both sides derive for this round.
    pub session_key: [u8; 32],
}

/// Buffered callback, delivered once the lock is released.
pub(crate) enum Event {
    Error(ClientError),
    ConfirmedFriend(Friend),
    SentFriendRequest(OutgoingFriendRequest),
    ReceivedFriendRequest(IncomingFriendRequest),
    SentCall(OutgoingCall),
    ReceivedCall(IncomingCall),
    UnexpectedSigningKey { incoming: IncomingFriendRequest, outgoing: OutgoingFriendRequest },
}

/// Deliver buffered events in order.
pub(crate) fn dispatch(handler: &dyn EventHandler, events: Vec<Event>) {
    for event in events {
        match event {
            Event::Error(err) => handler.error(err),
            Event::ConfirmedFriend(friend) => handler.confirmed_friend(friend),
            Event::SentFriendRequest(request) => handler.sent_friend_request(request),
            Event::ReceivedFriendRequest(request) => handler.received_friend_request(request),
            Event::SentCall(call) => handler.sent_call(call),
            Event::ReceivedCall(call) => handler.received_call(call),
            Event::UnexpectedSigningKey { incoming, outgoing } => {
                handler.unexpected_signing_key(incoming, outgoing);
            },
        }
    }
}
