//! The add-friend round engine.
//!
//! Per round: verify the announced committee against the config head,
//! extract the round identity key from every PKG, promote queued requests to
//! sent (durably, before anything touches the network), submit a fixed-size
//! onion batch, then decrypt the round mailbox and reconcile answers against
//! sent requests.

use alpenhorn_crypto::{
    decrypt, encrypt, friend_seed, pad_payload, seal_onion, unpad_payload, IbeCiphertext,
    IdentityPrivateKey,
};
use alpenhorn_proto::{
    mailbox_id, split_envelopes, ClientMessage, FriendRequestIntro, PkgServerConfig,
    RoundAnnouncement, ServiceId,
};
use rand::{rngs::OsRng, Rng, RngCore};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use x25519_dalek::PublicKey;

use crate::{
    client::Client,
    error::ClientError,
    handler::{Event, Friend, IncomingFriendRequest, OutgoingFriendRequest},
    persist,
    pkg_client::{self, CommitteeKeys},
    state::{ClientState, FriendRecord, IncomingRecord, OutgoingRecord, SentRecord},
};

/// Onions submitted per add-friend round: real requests oldest-first, then
/// filler. Queued requests beyond this wait for the next round.
pub(crate) const ADD_FRIEND_BATCH: usize = 4;

/// Intros are padded to this size before IBE encryption so envelope length
/// does not depend on the username.
const INTRO_PAD_LEN: usize = 512;

/// Wire size of one envelope: compressed G2 point, nonce, padded intro, tag.
const ENVELOPE_LEN: usize = 64 + 24 + INTRO_PAD_LEN + 16;

/// Uniform padded payload per onion: pad prefix, mailbox id, envelope.
const PAYLOAD_PAD_LEN: usize = 4 + 4 + ENVELOPE_LEN;

/// Per-round engine state kept between submission and mailbox retrieval.
pub(crate) struct AddFriendRound {
    pub round: u32,
    pub num_mailboxes: u32,
    pub committee: Vec<PkgServerConfig>,
    pub ibe_key: IdentityPrivateKey,
}

/// Drive a round from announcement through submission.
pub(crate) async fn handle_announcement(
    client: &Client,
    submit: &mpsc::Sender<ClientMessage>,
    ann: &RoundAnnouncement,
) -> Result<AddFriendRound, ClientError> {
    let config = client.ensure_config(ServiceId::AddFriend, ann.config_hash).await?;
    let committee = config.inner.pkg_servers.clone();
    if committee.is_empty() {
        return Err(ClientError::Protocol("add-friend config has no PKG committee".into()));
    }

    let keys = pkg_client::extract_committee(
        &client.inner.network,
        &client.inner.identity,
        ServiceId::AddFriend,
        ann.round,
        &committee,
        &ann.pkg_settings,
    )
    .await?;

    let batch = promote_outgoing(client, ann.round, &committee)?;
    let onions = build_onions(client, ann, &keys, &batch);

    let window = Duration::from_millis(ann.submit_window_ms);
    let message = ClientMessage::Onions { round: ann.round, onions };
    let submitted = tokio::time::timeout(window, submit.send(message)).await;
    if !matches!(submitted, Ok(Ok(()))) {
        let mut st = client.inner.lock();
        demote_round_locked(&mut st, ann.round);
        if let Err(err) = persist::persist_locked(&client.inner.identity, &st) {
            debug!(round = ann.round, error = %err, "persist after demotion failed");
        }
        return Err(ClientError::Network(format!(
            "round {} submission missed the deadline",
            ann.round
        )));
    }

    let mut events: Vec<Event> = batch
        .iter()
        .map(|sent| {
            Event::SentFriendRequest(OutgoingFriendRequest {
                username: sent.username.clone(),
                expected_key: sent.expected_key.map(|k| k.0),
                dial_round: sent.dial_round,
            })
        })
        .collect();

    // The approver's side of the handshake: a just-sent request may answer an
    // incoming request that arrived in an earlier round.
    {
        let mut st = client.inner.lock();
        reconcile_locked(client, &mut st, &mut events);
    }
    client.dispatch(events);

    Ok(AddFriendRound {
        round: ann.round,
        num_mailboxes: ann.num_mailboxes,
        committee,
        ibe_key: keys.ibe_key,
    })
}

/// Fetch and process the round mailbox.
pub(crate) async fn handle_mailbox(
    client: &Client,
    round: &AddFriendRound,
) -> Result<(), ClientError> {
    let mailbox = mailbox_id(&client.inner.identity.username, round.num_mailboxes);
    let blob = client
        .inner
        .network
        .cdn
        .fetch(ServiceId::AddFriend, round.round, mailbox)
        .await?;
    let Some(blob) = blob else {
        return Ok(());
    };
    let envelopes = split_envelopes(&blob).map_err(|e| ClientError::Protocol(e.to_string()))?;

    let mut events = Vec::new();
    {
        let mut st = client.inner.lock();
        let mut mutated = false;

        for envelope in &envelopes {
            let digest: [u8; 32] = Sha256::digest(envelope).into();
            if st.seen_envelopes.contains(&digest) {
                continue;
            }
            let Some(intro) = open_envelope(&round.ibe_key, envelope) else {
                continue;
            };
            if !intro.verify() {
                debug!(round = round.round, "dropping envelope with bad intro signature");
                continue;
            }
            if intro.dial_round <= round.round {
                debug!(round = round.round, "dropping envelope with stale dial round");
                continue;
            }

            st.seen_envelopes.insert(digest);
            let record = IncomingRecord {
                username: intro.username,
                long_term_key: intro.long_term_key,
                dh_public: intro.dh_public,
                dial_round: intro.dial_round,
                round: round.round,
                verifiers: round.committee.clone(),
                envelope_digest: digest,
                warned: false,
            };
            integrate_envelope_locked(client, &mut st, record, &mut events);
            mutated = true;
        }

        if mutated {
            if let Err(err) = persist::persist_locked(&client.inner.identity, &st) {
                events.push(Event::Error(err.into()));
            }
        }
    }

    client.dispatch(events);
    Ok(())
}

/// Promote up to a batch of queued requests to sent, durably.
///
/// The promotion is rolled back if the persist fails: nothing may reach the
/// network unless the sent record is already on disk, or a crash between
/// submit and persist would resend the request next round.
fn promote_outgoing(
    client: &Client,
    round: u32,
    committee: &[PkgServerConfig],
) -> Result<Vec<SentRecord>, ClientError> {
    let mut st = client.inner.lock();

    let take = st.outgoing.len().min(ADD_FRIEND_BATCH);
    let drained: Vec<OutgoingRecord> = st.outgoing.drain(..take).collect();
    let promoted: Vec<SentRecord> = drained
        .iter()
        .map(|rec| SentRecord {
            username: rec.username.clone(),
            expected_key: rec.expected_key,
            dh_public: rec.dh_public,
            dh_private: rec.dh_private.clone(),
            dial_round: rec.dial_round,
            round,
            committee: committee.to_vec(),
        })
        .collect();
    st.sent.extend(promoted.iter().cloned());

    if let Err(err) = persist::persist_locked(&client.inner.identity, &st) {
        let keep = st.sent.len() - promoted.len();
        st.sent.truncate(keep);
        for rec in drained.into_iter().rev() {
            st.outgoing.insert(0, rec);
        }
        return Err(err.into());
    }

    Ok(promoted)
}

/// Build the fixed-size onion batch: one real onion per promoted request,
/// filler onions to random mailboxes for the rest.
fn build_onions(
    client: &Client,
    ann: &RoundAnnouncement,
    keys: &CommitteeKeys,
    batch: &[SentRecord],
) -> Vec<Vec<u8>> {
    let hops: Vec<PublicKey> = ann.onion_keys.iter().map(|k| PublicKey::from(*k)).collect();
    let mut rng = OsRng;
    let mut onions = Vec::with_capacity(ADD_FRIEND_BATCH);

    for sent in batch {
        let intro = FriendRequestIntro::sign(
            client.inner.identity.username.clone(),
            &client.inner.identity.long_term,
            sent.dh_public,
            sent.dial_round,
        );
        let padded_intro = pad_payload(&intro.encode(), INTRO_PAD_LEN);
        let envelope =
            encrypt(&keys.master_public, &sent.username, &padded_intro, &mut rng).to_bytes();

        let mailbox = mailbox_id(&sent.username, ann.num_mailboxes);
        onions.push(seal_dead_drop(mailbox, &envelope, &hops, &mut rng));
    }

    while onions.len() < ADD_FRIEND_BATCH {
        let mailbox = rng.gen::<u32>() % ann.num_mailboxes.max(1);
        let mut envelope = vec![0u8; ENVELOPE_LEN];
        rng.fill_bytes(&mut envelope);
        onions.push(seal_dead_drop(mailbox, &envelope, &hops, &mut rng));
    }

    onions
}

fn seal_dead_drop(mailbox: u32, envelope: &[u8], hops: &[PublicKey], rng: &mut OsRng) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + envelope.len());
    payload.extend_from_slice(&mailbox.to_be_bytes());
    payload.extend_from_slice(envelope);
    seal_onion(&pad_payload(&payload, PAYLOAD_PAD_LEN), hops, rng)
}

fn open_envelope(key: &IdentityPrivateKey, envelope: &[u8]) -> Option<FriendRequestIntro> {
    let ciphertext = IbeCiphertext::from_bytes(envelope).ok()?;
    let padded = decrypt(key, &ciphertext)?;
    let intro_bytes = unpad_payload(&padded).ok()?;
    FriendRequestIntro::decode(&intro_bytes)
}

/// Move this round's sent records back to the front of the outgoing queue.
fn demote_round_locked(st: &mut ClientState, round: u32) {
    let mut restored = Vec::new();
    st.sent.retain(|sent| {
        if sent.round == round {
            restored.push(OutgoingRecord {
                username: sent.username.clone(),
                expected_key: sent.expected_key,
                dh_public: sent.dh_public,
                dh_private: sent.dh_private.clone(),
                dial_round: sent.dial_round,
            });
            false
        } else {
            true
        }
    });
    for rec in restored.into_iter().rev() {
        st.outgoing.insert(0, rec);
    }
}

/// Integrate one freshly decrypted envelope.
///
/// An envelope that answers a sent request confirms the friendship unless
/// the pin disagrees; anything else is surfaced to the application as an
/// incoming request.
fn integrate_envelope_locked(
    client: &Client,
    st: &mut ClientState,
    record: IncomingRecord,
    events: &mut Vec<Event>,
) {
    if let Some(pos) = st.sent.iter().position(|s| s.username == record.username) {
        let pin_mismatch = match st.sent[pos].expected_key {
            Some(pin) => pin.0 != record.long_term_key,
            None => false,
        };
        if pin_mismatch {
            events.push(Event::UnexpectedSigningKey {
                incoming: incoming_handle(client, &record),
                outgoing: OutgoingFriendRequest {
                    username: st.sent[pos].username.clone(),
                    expected_key: st.sent[pos].expected_key.map(|k| k.0),
                    dial_round: st.sent[pos].dial_round,
                },
            });
            let mut record = record;
            record.warned = true;
            st.incoming.push(record);
            return;
        }

        let sent = st.sent.remove(pos);
        confirm_locked(client, st, sent, record, events);
        return;
    }

    events.push(Event::ReceivedFriendRequest(incoming_handle(client, &record)));
    st.incoming.push(record);
}

/// Match sent requests against already-stored incoming requests.
///
/// Runs after each submission: when the user approved an incoming request,
/// the approval's own submission is the moment both halves exist locally.
pub(crate) fn reconcile_locked(client: &Client, st: &mut ClientState, events: &mut Vec<Event>) {
    let mut mutated = false;
    let mut idx = 0;
    while idx < st.sent.len() {
        let username = st.sent[idx].username.clone();
        let Some(inc_pos) = st.incoming.iter().position(|inc| inc.username == username) else {
            idx += 1;
            continue;
        };

        let pin_mismatch = match st.sent[idx].expected_key {
            Some(pin) => pin.0 != st.incoming[inc_pos].long_term_key,
            None => false,
        };
        if pin_mismatch {
            if !st.incoming[inc_pos].warned {
                st.incoming[inc_pos].warned = true;
                events.push(Event::UnexpectedSigningKey {
                    incoming: incoming_handle(client, &st.incoming[inc_pos]),
                    outgoing: OutgoingFriendRequest {
                        username,
                        expected_key: st.sent[idx].expected_key.map(|k| k.0),
                        dial_round: st.sent[idx].dial_round,
                    },
                });
            }
            idx += 1;
            continue;
        }

        let sent = st.sent.remove(idx);
        let incoming = st.incoming.remove(inc_pos);
        confirm_locked(client, st, sent, incoming, events);
        mutated = true;
    }

    if mutated {
        if let Err(err) = persist::persist_locked(&client.inner.identity, st) {
            events.push(Event::Error(err.into()));
        }
    }
}

/// Turn a matched (sent, incoming) pair into a confirmed friend.
///
/// Both sides derive the same keywheel base: the DH output is symmetric and
/// the base round is the max of the two advertised dial rounds.
fn confirm_locked(
    client: &Client,
    st: &mut ClientState,
    sent: SentRecord,
    incoming: IncomingRecord,
    events: &mut Vec<Event>,
) {
    let username = sent.username.clone();

    let our_public = PublicKey::from(sent.dh_public);
    let their_public = PublicKey::from(incoming.dh_public);
    let seed = friend_seed(&sent.dh_private, &our_public, &their_public);
    let base_round = sent.dial_round.max(incoming.dial_round);

    // Re-friending an existing contact re-keys the wheel; both sides run
    // through the same handshake, so both replace their entry.
    if st.friends.contains_key(&username) {
        debug!(%username, "re-confirming existing friend with a fresh keywheel entry");
        st.wheel.remove(&username);
    }
    if let Err(err) = st.wheel.put(&username, seed, base_round) {
        events.push(Event::Error(ClientError::Crypto(err.to_string())));
        return;
    }

    st.friends.insert(
        username.clone(),
        FriendRecord {
            username: username.clone(),
            long_term_key: incoming.long_term_key,
            extra_data: Vec::new(),
        },
    );
    // Any further stored requests for this username are now settled.
    st.incoming.retain(|inc| inc.username != username);

    events.push(Event::ConfirmedFriend(Friend {
        username,
        long_term_key: incoming.long_term_key,
        client: client.weak(),
    }));
}

fn incoming_handle(client: &Client, record: &IncomingRecord) -> IncomingFriendRequest {
    IncomingFriendRequest {
        username: record.username.clone(),
        long_term_key: record.long_term_key,
        dh_public: record.dh_public,
        dial_round: record.dial_round,
        round: record.round,
        verifiers: record.verifiers.clone(),
        client: client.weak(),
    }
}
