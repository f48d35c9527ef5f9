//! End-to-end registration flow against a real `bncd start` process:
//! PASS/NICK/USER completing registration, then CAP negotiation sent
//! *after* registration must not re-trigger it.

mod common;

use common::TestClient;
use common::TestServer;

#[tokio::test]
async fn pass_nick_user_completes_registration() {
    let server = TestServer::spawn(18765, "alice", "hunter2").await.expect("spawn bncd");
    let mut client = TestClient::connect(&server.address()).await.expect("connect");

    client.send_raw("PASS alice:hunter2").await.expect("send PASS");
    client.send_raw("NICK alice").await.expect("send NICK");
    client.send_raw("USER alice 0 * :Alice").await.expect("send USER");

    let burst = client
        .recv_until(|msg| msg.command == "001")
        .await
        .expect("registration burst");
    assert!(burst.iter().any(|m| m.command == "001"), "expected RPL_WELCOME");
}

#[tokio::test]
async fn cap_end_after_registration_does_not_replay_welcome() {
    let server = TestServer::spawn(18766, "bob", "hunter2").await.expect("spawn bncd");
    let mut client = TestClient::connect(&server.address()).await.expect("connect");

    client.send_raw("PASS bob:hunter2").await.expect("send PASS");
    client.send_raw("NICK bob").await.expect("send NICK");
    client.send_raw("USER bob 0 * :Bob").await.expect("send USER");
    client.recv_until(|msg| msg.command == "001").await.expect("registration burst");

    // Registration already completed above (CAP defaults to locked-true
    // when no CAP LS precedes USER). A client that now negotiates CAP
    // anyway must be rejected, not silently re-registered.
    client.send_raw("CAP LS 302").await.expect("send CAP LS");
    client.send_raw("CAP END").await.expect("send CAP END");

    let replies = client
        .recv_until(|msg| msg.command == "462")
        .await
        .expect("expected ERR_ALREADYREGISTERED");
    assert!(!replies.iter().any(|m| m.command == "001"), "must not replay RPL_WELCOME");
}
