//! End-to-end scenarios against the mock universe.
//!
//! Two real clients run their full round loops: friend discovery through
//! the PKG committee and mixchain, calls through the dialing service,
//! persistence across a restart, and a committee change mid-flight.

use std::sync::Arc;
use std::time::Duration;

use alpenhorn_client::Client;
use alpenhorn_harness::{chan_handler, Universe};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

/// Generous bound for multi-round flows; rounds tick every ~250ms.
const WAIT: Duration = Duration::from_secs(30);

/// Window after which an event is asserted NOT to arrive.
const QUIET: Duration = Duration::from_secs(3);

async fn recv<T>(rx: &mut UnboundedReceiver<T>, what: &str) -> T {
    timeout(WAIT, rx.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .unwrap_or_else(|| panic!("channel closed waiting for {what}"))
}

#[tokio::test(flavor = "multi_thread")]
async fn alice_friends_then_calls_bob() {
    let universe = Universe::start();
    let (alice_handler, mut alice_events) = chan_handler("alice");
    let (bob_handler, mut bob_events) = chan_handler("bob");

    let alice = universe.new_user("alice@example.org", alice_handler).await;
    let bob = universe.new_user("bob@example.org", bob_handler).await;

    let (bob_client_path, bob_keywheel_path) = universe.client_paths("bob");
    bob.set_client_persist_path(&bob_client_path);
    bob.set_keywheel_persist_path(&bob_keywheel_path);
    bob.persist().unwrap();

    alice.connect().unwrap();
    bob.connect().unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    alice.send_friend_request(bob.username(), None).unwrap();
    recv(&mut alice_events.sent_friend_request, "alice's request submission").await;

    let request = recv(&mut bob_events.received_friend_request, "bob's incoming request").await;
    assert_eq!(request.username(), alice.username());
    assert_eq!(request.long_term_key(), &alice.long_term_public());
    assert_eq!(
        request.verifiers(),
        universe.addfriend_committee().as_slice(),
        "verifiers must be the committee of the round the request arrived in"
    );

    request.approve().unwrap();
    recv(&mut bob_events.sent_friend_request, "bob's approval submission").await;

    let alice_friend = recv(&mut alice_events.confirmed_friend, "alice's confirmation").await;
    assert_eq!(alice_friend.username(), bob.username());
    let bob_friend = recv(&mut bob_events.confirmed_friend, "bob's confirmation").await;
    assert_eq!(bob_friend.username(), alice.username());

    // Call after confirmation: both ends derive the same session key.
    alice.friend(bob.username()).expect("bob is a friend").call(0).unwrap();
    let out_call = recv(&mut alice_events.sent_call, "alice's call submission").await;
    assert_eq!(out_call.username, bob.username());
    assert_eq!(out_call.intent, 0);

    let in_call = recv(&mut bob_events.received_call, "bob's incoming call").await;
    assert_eq!(in_call.username, alice.username());
    assert_eq!(in_call.intent, 0);
    assert_eq!(out_call.session_key, in_call.session_key, "both sides must agree on the key");

    // Persistence: close bob, reload from disk, call alice again.
    bob.close().unwrap();
    let (bob2_handler, mut bob2_events) = chan_handler("bob2");
    let bob2 =
        Client::load(&bob_client_path, &bob_keywheel_path, universe.network(), bob2_handler)
            .unwrap();
    bob2.connect().unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    bob2.friend(alice.username()).expect("alice survived the restart").call(0).unwrap();
    let out_call = recv(&mut bob2_events.sent_call, "bob2's call submission").await;
    assert_eq!(out_call.username, alice.username());
    let in_call = recv(&mut alice_events.received_call, "alice's incoming call").await;
    assert_eq!(in_call.username, bob2.username());
    assert_eq!(out_call.session_key, in_call.session_key);

    // Committee change: a fourth PKG joins, then bob re-friends alice.
    let new_pkg = universe.launch_pkg();
    alice.register(&new_pkg, None).await.unwrap();
    bob2.register(&new_pkg, None).await.unwrap();
    universe.extend_addfriend_committee(new_pkg).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    bob2.send_friend_request(alice.username(), None).unwrap();
    recv(&mut bob2_events.sent_friend_request, "bob2's request submission").await;

    let request = recv(&mut alice_events.received_friend_request, "alice's incoming request").await;
    let committee = universe.addfriend_committee();
    assert_eq!(committee.len(), 4);
    assert_eq!(
        request.verifiers(),
        committee.as_slice(),
        "verifiers must reflect the extended committee"
    );

    request.approve().unwrap();
    recv(&mut alice_events.sent_friend_request, "alice's approval submission").await;
    recv(&mut alice_events.confirmed_friend, "alice's re-confirmation").await;

    let friend = recv(&mut bob2_events.confirmed_friend, "bob2's re-confirmation").await;
    friend.call(1).unwrap();
    let out_call = recv(&mut bob2_events.sent_call, "bob2's intent-1 call").await;
    assert_eq!(out_call.intent, 1);
    let in_call = recv(&mut alice_events.received_call, "alice's intent-1 call").await;
    assert_eq!(in_call.intent, 1);

    alice.close().unwrap();
    bob2.close().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn pinned_key_mismatch_fires_unexpected_signing_key() {
    let universe = Universe::start();
    let (alice_handler, mut alice_events) = chan_handler("alice");
    let (bob_handler, mut bob_events) = chan_handler("bob");

    let alice = universe.new_user("alice@example.org", alice_handler).await;
    let bob = universe.new_user("bob@example.org", bob_handler).await;
    alice.connect().unwrap();
    bob.connect().unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    // Pin alice's request to a key bob does not hold.
    let wrong_key = SigningKey::generate(&mut OsRng).verifying_key();
    alice.send_friend_request(bob.username(), Some(wrong_key)).unwrap();
    recv(&mut alice_events.sent_friend_request, "alice's request submission").await;

    let request = recv(&mut bob_events.received_friend_request, "bob's incoming request").await;
    request.approve().unwrap();

    // Bob's pin matches alice's real key, so bob confirms.
    recv(&mut bob_events.confirmed_friend, "bob's confirmation").await;

    // Alice sees the mismatch instead of a confirmation.
    let (incoming, outgoing) =
        recv(&mut alice_events.unexpected_key, "alice's pin mismatch").await;
    assert_eq!(incoming.username(), bob.username());
    assert_eq!(incoming.long_term_key(), &bob.long_term_public());
    assert_eq!(outgoing.expected_key, Some(wrong_key));

    assert!(
        timeout(QUIET, alice_events.confirmed_friend.recv()).await.is_err(),
        "a pin mismatch must not auto-confirm"
    );

    alice.close().unwrap();
    bob.close().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_mailbox_delivery_is_idempotent() {
    let universe = Universe::start();
    universe.cdn().set_echo_duplicates(true);

    let (alice_handler, mut alice_events) = chan_handler("alice");
    let (bob_handler, mut bob_events) = chan_handler("bob");

    let alice = universe.new_user("alice@example.org", alice_handler).await;
    let bob = universe.new_user("bob@example.org", bob_handler).await;
    alice.connect().unwrap();
    bob.connect().unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    alice.send_friend_request(bob.username(), None).unwrap();

    let request = recv(&mut bob_events.received_friend_request, "bob's incoming request").await;
    assert_eq!(request.username(), alice.username());
    assert!(
        timeout(QUIET, bob_events.received_friend_request.recv()).await.is_err(),
        "the duplicated envelope must be dropped silently"
    );

    request.approve().unwrap();
    recv(&mut bob_events.confirmed_friend, "bob's confirmation").await;
    recv(&mut alice_events.confirmed_friend, "alice's confirmation").await;
    assert!(
        timeout(QUIET, alice_events.confirmed_friend.recv()).await.is_err(),
        "duplicate delivery must not duplicate the confirmation"
    );

    alice.close().unwrap();
    bob.close().unwrap();
}
