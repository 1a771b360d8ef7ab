//! End-to-end scenarios over a real TCP socket, driving the server through
//! its literal wire exchanges exactly as a real client would.

mod common;

use common::{logged_in_as, Fixture};

#[tokio::test]
async fn create_user_and_login() {
    let fx = Fixture::start().await;
    let mut client = fx.connect().await;

    client.send_line("create_user alice 0770").await;
    assert_eq!(client.read_line().await, "OK");
    client.send_line("login alice").await;
    assert_eq!(client.read_line().await, "OK");

    let home = fx.root_path().join("alice");
    assert!(home.is_dir());
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&home).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o770);
    }
}

#[tokio::test]
async fn write_then_read_back() {
    let (_fx, mut client) = logged_in_as("alice", "0770").await;

    client.send_line("write note.txt 5").await;
    client.send_blob(b"hello").await;
    assert_eq!(client.read_line().await, "OK 5");

    client.send_line("read note.txt").await;
    assert_eq!(client.read_line().await, "OK 5");
    assert_eq!(client.read_blob(5).await, b"hello");
}

#[tokio::test]
async fn sandbox_escape_rejected() {
    let (_fx, mut client) = logged_in_as("alice", "0770").await;

    client.send_line("read ../../../etc/passwd").await;
    assert_eq!(client.read_line().await, "ERR 3 PERM path outside home");
}

#[tokio::test]
async fn permission_denied_across_users() {
    let (fx, mut alice) = logged_in_as("alice", "0770").await;
    alice.send_line("write note.txt 5").await;
    alice.send_blob(b"hello").await;
    assert_eq!(alice.read_line().await, "OK 5");

    let mut bob = fx.connect().await;
    bob.send_line("create_user bob 0770").await;
    assert_eq!(bob.read_line().await, "OK");
    bob.send_line("login bob").await;
    assert_eq!(bob.read_line().await, "OK");

    // alice's note.txt defaults to 0700 (write's create permission); the
    // other triad has no read bit, so bob is denied.
    bob.send_line("read /alice/note.txt").await;
    assert_eq!(bob.read_line().await, "ERR 3 PERM permission denied");
}

#[tokio::test]
async fn transfer_rendezvous_when_recipient_present() {
    let (fx, mut alice) = logged_in_as("alice", "0770").await;
    alice.send_line("write note.txt 5").await;
    alice.send_blob(b"hello").await;
    assert_eq!(alice.read_line().await, "OK 5");

    let mut bob = fx.connect().await;
    bob.send_line("create_user bob 0770").await;
    assert_eq!(bob.read_line().await, "OK");
    bob.send_line("login bob").await;
    assert_eq!(bob.read_line().await, "OK");

    alice.send_line("transfer_request note.txt bob").await;
    assert_eq!(bob.read_line().await, "NOTICE TRANSFER 1 alice note.txt");
    assert_eq!(alice.read_line().await, "OK 1");

    bob.send_line("accept . 1").await;
    assert_eq!(bob.read_line().await, "OK");

    let expected_dest = fx.root_path().join("bob/note.txt");
    assert_eq!(
        alice.read_line().await,
        format!("NOTICE TRANSFER_ACCEPTED 1 {}", expected_dest.to_string_lossy())
    );

    let contents = tokio::fs::read(&expected_dest).await.unwrap();
    assert_eq!(contents, b"hello");
}

#[tokio::test]
async fn rendezvous_blocks_until_recipient_arrives() {
    let (fx, mut alice) = logged_in_as("alice", "0770").await;
    alice.send_line("write note.txt 5").await;
    alice.send_blob(b"hello").await;
    assert_eq!(alice.read_line().await, "OK 5");

    // bob exists (so the broker can resolve a home for him) but is not yet
    // logged in anywhere.
    {
        let mut setup = fx.connect().await;
        setup.send_line("create_user bob 0770").await;
        assert_eq!(setup.read_line().await, "OK");
    }

    alice.send_line("transfer_request note.txt bob").await;
    assert_eq!(alice.read_line().await, "WAITING");

    let alice_wait = tokio::spawn(async move {
        let line = alice.read_line().await;
        (alice, line)
    });

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let mut bob = fx.connect().await;
    bob.send_line("login bob").await;
    assert_eq!(bob.read_line().await, "OK");

    let (_alice, line) = tokio::time::timeout(std::time::Duration::from_secs(2), alice_wait)
        .await
        .expect("alice's wait did not time out")
        .expect("alice's task did not panic");
    assert_eq!(line, "OK 1");
    assert_eq!(bob.read_line().await, "NOTICE TRANSFER 1 alice note.txt");
}
