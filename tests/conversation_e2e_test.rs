use std::sync::Arc;

use connect_e2ee::e2ecore::{DecryptionFailure, EncryptedMessage, ProtocolError};
use connect_e2ee::{Client, ClientConfig, DeviceAddress, E2eeError, MemoryDirectory};

fn device(uid: &str, directory: &MemoryDirectory) -> Arc<Client> {
    let config = ClientConfig {
        one_time_pre_key_target: 10,
        one_time_pre_key_low_watermark: 2,
        ..Default::default()
    };
    Client::builder(DeviceAddress::new(uid, "1"))
        .with_config(config)
        .with_directory(Arc::new(directory.clone()))
        .build()
        .unwrap()
}

async fn connected_pair() -> (Arc<Client>, Arc<Client>) {
    let directory = MemoryDirectory::new();
    let alice = device("alice", &directory);
    let bob = device("bob", &directory);
    alice.provision().await.unwrap();
    bob.provision().await.unwrap();
    alice.establish_session(bob.address()).await.unwrap();
    (alice, bob)
}

fn decryption_failure(err: &E2eeError) -> Option<&DecryptionFailure> {
    match err.protocol() {
        Some(ProtocolError::DecryptionFailure(failure)) => Some(failure),
        _ => None,
    }
}

#[tokio::test]
async fn test_long_conversation_with_ratchet_turns() {
    let (alice, bob) = connected_pair().await;

    for round in 0..10 {
        for n in 0..(round % 3 + 1) {
            let text = format!("alice {round}.{n}");
            let wire = alice.encrypt(bob.address(), text.as_bytes()).await.unwrap();
            assert_eq!(
                bob.decrypt(alice.address(), &wire).await.unwrap(),
                text.as_bytes()
            );
        }
        let text = format!("bob {round}");
        let wire = bob.encrypt(alice.address(), text.as_bytes()).await.unwrap();
        assert_eq!(
            alice.decrypt(bob.address(), &wire).await.unwrap(),
            text.as_bytes()
        );
    }

    assert_eq!(
        alice.session_id(bob.address()).await.unwrap(),
        bob.session_id(alice.address()).await.unwrap()
    );
}

#[tokio::test]
async fn test_third_message_arrives_first() {
    let (alice, bob) = connected_pair().await;

    let m1 = alice.encrypt(bob.address(), b"one").await.unwrap();
    let m2 = alice.encrypt(bob.address(), b"two").await.unwrap();
    let m3 = alice.encrypt(bob.address(), b"three").await.unwrap();

    // Every unacknowledged message carries the handshake, so any of them can
    // open the session.
    assert_eq!(bob.decrypt(alice.address(), &m3).await.unwrap(), b"three");
    assert_eq!(bob.decrypt(alice.address(), &m1).await.unwrap(), b"one");
    assert_eq!(bob.decrypt(alice.address(), &m2).await.unwrap(), b"two");
}

#[tokio::test]
async fn test_any_permutation_decrypts() {
    let (alice, bob) = connected_pair().await;

    // Prime the session so the permutation runs on an established chain.
    let first = alice.encrypt(bob.address(), b"hi").await.unwrap();
    bob.decrypt(alice.address(), &first).await.unwrap();
    let reply = bob.encrypt(alice.address(), b"hi back").await.unwrap();
    alice.decrypt(bob.address(), &reply).await.unwrap();

    let mut messages = Vec::new();
    for i in 0..12u32 {
        let text = format!("message {i}");
        let wire = alice.encrypt(bob.address(), text.as_bytes()).await.unwrap();
        messages.push((text, wire));
    }
    // Fixed scramble: stride 5 over 12 visits every index once.
    let order: Vec<usize> = (0..12).map(|i| (i * 5 + 3) % 12).collect();
    for index in order {
        let (text, wire) = &messages[index];
        assert_eq!(
            bob.decrypt(alice.address(), wire).await.unwrap(),
            text.as_bytes()
        );
    }
}

#[tokio::test]
async fn test_reordering_across_ratchet_steps() {
    let (alice, bob) = connected_pair().await;

    let a1 = alice.encrypt(bob.address(), b"a1").await.unwrap();
    let a2 = alice.encrypt(bob.address(), b"a2").await.unwrap();
    bob.decrypt(alice.address(), &a2).await.unwrap();

    let b1 = bob.encrypt(alice.address(), b"b1").await.unwrap();
    alice.decrypt(bob.address(), &b1).await.unwrap();

    // Alice is on a new sending chain now; a1 from the old one is still due.
    let a3 = alice.encrypt(bob.address(), b"a3").await.unwrap();
    assert_eq!(bob.decrypt(alice.address(), &a3).await.unwrap(), b"a3");
    assert_eq!(bob.decrypt(alice.address(), &a1).await.unwrap(), b"a1");
}

#[tokio::test]
async fn test_replay_is_rejected() {
    let (alice, bob) = connected_pair().await;

    let first = alice.encrypt(bob.address(), b"once").await.unwrap();
    let second = alice.encrypt(bob.address(), b"twice").await.unwrap();
    bob.decrypt(alice.address(), &first).await.unwrap();
    bob.decrypt(alice.address(), &second).await.unwrap();

    for replay in [&first, &second] {
        let err = bob.decrypt(alice.address(), replay).await.unwrap_err();
        assert!(matches!(
            decryption_failure(&err),
            Some(DecryptionFailure::DuplicateOrEvicted { .. })
        ));
        assert!(err.is_recoverable());
    }
}

#[tokio::test]
async fn test_tampered_message_leaves_session_intact() {
    let (alice, bob) = connected_pair().await;
    let hello = alice.encrypt(bob.address(), b"hello").await.unwrap();
    bob.decrypt(alice.address(), &hello).await.unwrap();

    let wire = alice.encrypt(bob.address(), b"secret").await.unwrap();
    let mut message = EncryptedMessage::decode(&wire).unwrap();
    let last = message.ciphertext.len() - 1;
    message.ciphertext[last] ^= 0x01;
    let tampered = message.encode().unwrap();

    let err = bob.decrypt(alice.address(), &tampered).await.unwrap_err();
    assert_eq!(
        decryption_failure(&err),
        Some(&DecryptionFailure::Authentication)
    );
    assert_eq!(bob.decrypt(alice.address(), &wire).await.unwrap(), b"secret");
}

#[tokio::test]
async fn test_garbage_is_rejected() {
    let (alice, bob) = connected_pair().await;
    assert!(bob.decrypt(alice.address(), &[]).await.is_err());
    assert!(bob.decrypt(alice.address(), &[9, 1, 2, 3]).await.is_err());
    assert!(!bob.has_session(alice.address()).await.unwrap());
}

#[tokio::test]
async fn test_message_without_session_fails() {
    let (alice, bob) = connected_pair().await;
    let first = alice.encrypt(bob.address(), b"first").await.unwrap();
    bob.decrypt(alice.address(), &first).await.unwrap();
    let reply = bob.encrypt(alice.address(), b"reply").await.unwrap();

    alice.reset_session(bob.address()).await.unwrap();
    let err = alice.decrypt(bob.address(), &reply).await.unwrap_err();
    assert!(matches!(
        err.protocol(),
        Some(ProtocolError::SessionNotEstablished)
    ));
}
