//! The dialing round engine.
//!
//! Calls are announced with fixed-size tokens sealed under keywheel session
//! keys and received by trial decryption against every friend's key for the
//! round. After a round is processed the wheel is advanced past it for every
//! friend whose key could have been used, so earlier session keys cannot be
//! recovered from a later compromise.

use alpenhorn_crypto::{
    open_dial_token, pad_payload, seal_dial_token, seal_onion, DIAL_TOKEN_LEN,
};
use alpenhorn_proto::{mailbox_id, split_envelopes, ClientMessage, RoundAnnouncement, ServiceId};
use rand::{rngs::OsRng, Rng, RngCore};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use x25519_dalek::PublicKey;

use crate::{
    client::Client,
    error::ClientError,
    handler::{Event, IncomingCall, OutgoingCall},
    persist,
    state::PendingCall,
};

/// Onions submitted per dialing round: real calls first, then filler.
pub(crate) const DIALING_BATCH: usize = 4;

/// Uniform padded payload per onion: pad prefix, mailbox id, token.
const PAYLOAD_PAD_LEN: usize = 4 + 4 + DIAL_TOKEN_LEN;

/// Per-round engine state kept between submission and mailbox retrieval.
pub(crate) struct DialingRound {
    pub round: u32,
    pub num_mailboxes: u32,
}

/// Drive a round from announcement through submission.
pub(crate) async fn handle_announcement(
    client: &Client,
    submit: &mpsc::Sender<ClientMessage>,
    ann: &RoundAnnouncement,
) -> Result<DialingRound, ClientError> {
    client.ensure_config(ServiceId::Dialing, ann.config_hash).await?;

    // A call is actionable once the friend's wheel has reached its base
    // round; calls to friendships that start at a later dialing round stay
    // queued.
    let mut ready: Vec<(PendingCall, [u8; 32])> = Vec::new();
    {
        let mut st = client.inner.lock();
        let mut waiting = Vec::new();
        let queued: Vec<PendingCall> = st.pending_calls.drain(..).collect();
        for call in queued {
            let actionable = ready.len() < DIALING_BATCH
                && st.friends.contains_key(&call.username)
                && st.wheel.base_round(&call.username).is_some_and(|base| base <= ann.round);
            if actionable {
                match st.wheel.session_key(&call.username, ann.round) {
                    Ok(key) => ready.push((call, key)),
                    Err(err) => {
                        debug!(username = %call.username, error = %err, "dropping queued call");
                    },
                }
            } else {
                waiting.push(call);
            }
        }
        st.pending_calls = waiting;
    }

    let onions = build_onions(ann, &ready);
    let window = Duration::from_millis(ann.submit_window_ms);
    let message = ClientMessage::Onions { round: ann.round, onions };
    let submitted = tokio::time::timeout(window, submit.send(message)).await;
    if !matches!(submitted, Ok(Ok(()))) {
        let mut st = client.inner.lock();
        for (call, _) in ready.into_iter().rev() {
            st.pending_calls.insert(0, call);
        }
        return Err(ClientError::Network(format!(
            "round {} submission missed the deadline",
            ann.round
        )));
    }

    let events: Vec<Event> = ready
        .into_iter()
        .map(|(call, session_key)| {
            Event::SentCall(OutgoingCall {
                username: call.username,
                intent: call.intent,
                session_key,
                round: ann.round,
            })
        })
        .collect();
    client.dispatch(events);

    Ok(DialingRound { round: ann.round, num_mailboxes: ann.num_mailboxes })
}

/// Fetch the round mailbox, trial-decrypt its tokens, then advance every
/// participating friend's wheel past the round.
pub(crate) async fn handle_mailbox(
    client: &Client,
    round: &DialingRound,
) -> Result<(), ClientError> {
    let mailbox = mailbox_id(&client.inner.identity.username, round.num_mailboxes);
    let blob =
        client.inner.network.cdn.fetch(ServiceId::Dialing, round.round, mailbox).await?;

    // Session keys we would accept this round, one per friend with a live
    // wheel at or before the round.
    let candidates: Vec<(String, [u8; 32])> = {
        let st = client.inner.lock();
        st.wheel
            .usernames()
            .filter(|name| {
                st.wheel.base_round(name).is_some_and(|base| base <= round.round)
            })
            .filter_map(|name| {
                st.wheel.session_key(name, round.round).ok().map(|key| (name.to_string(), key))
            })
            .collect()
    };

    let mut events = Vec::new();
    if let Some(blob) = &blob {
        let envelopes =
            split_envelopes(blob).map_err(|e| ClientError::Protocol(e.to_string()))?;
        let callee = &client.inner.identity.username;
        for envelope in &envelopes {
            for (username, key) in &candidates {
                if let Some(intent) = open_dial_token(key, round.round, callee, envelope) {
                    events.push(Event::ReceivedCall(IncomingCall {
                        username: username.clone(),
                        intent,
                        session_key: *key,
                    }));
                    break;
                }
            }
        }
    }

    // Forward secrecy: session keys at or before this round become
    // unrecoverable once the round is processed.
    {
        let mut st = client.inner.lock();
        for (username, _) in &candidates {
            st.wheel.erase(username, round.round + 1);
        }
        if !candidates.is_empty() {
            // Both blobs go out together even though only the wheel changed;
            // mtime skew between them would leak which kind of mutation
            // happened.
            if let Err(err) = persist::persist_locked(&client.inner.identity, &st) {
                events.push(Event::Error(err.into()));
            }
        }
    }

    client.dispatch(events);
    Ok(())
}

fn build_onions(ann: &RoundAnnouncement, ready: &[(PendingCall, [u8; 32])]) -> Vec<Vec<u8>> {
    let hops: Vec<PublicKey> = ann.onion_keys.iter().map(|k| PublicKey::from(*k)).collect();
    let mut rng = OsRng;
    let mut onions = Vec::with_capacity(DIALING_BATCH);

    for (call, session_key) in ready {
        let token = seal_dial_token(session_key, ann.round, &call.username, call.intent);
        let mailbox = mailbox_id(&call.username, ann.num_mailboxes);
        onions.push(seal_dead_drop(mailbox, &token, &hops, &mut rng));
    }

    while onions.len() < DIALING_BATCH {
        let mailbox = rng.gen::<u32>() % ann.num_mailboxes.max(1);
        let mut token = vec![0u8; DIAL_TOKEN_LEN];
        rng.fill_bytes(&mut token);
        onions.push(seal_dead_drop(mailbox, &token, &hops, &mut rng));
    }

    onions
}

fn seal_dead_drop(mailbox: u32, token: &[u8], hops: &[PublicKey], rng: &mut OsRng) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + token.len());
    payload.extend_from_slice(&mailbox.to_be_bytes());
    payload.extend_from_slice(token);
    seal_onion(&pad_payload(&payload, PAYLOAD_PAD_LEN), hops, rng)
}
