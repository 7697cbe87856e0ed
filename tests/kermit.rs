//! End-to-end Kermit scenarios over an in-memory loopback transport

mod common;

use common::{loopback_pair, MemoryFile};
use transferkit::core::kermit::engine::{KermitEngine, KermitOptions};
use transferkit::{LocalFile, ProtocolKind, Session};

#[tokio::test]
async fn ascii_file_round_trips_through_negotiation_and_transfer() {
    let data = b"ALICE'S ADVENTURES IN WONDERLAND\n\nLewis Carroll\n".repeat(20);
    let (mut sender_t, mut receiver_t) = loopback_pair();

    let sender_session = Session::new(ProtocolKind::Kermit, true);
    let sender = KermitEngine::new(KermitOptions::default());
    let mut files: Vec<(String, Box<dyn LocalFile>)> =
        vec![("alice26a.txt".to_string(), Box::new(MemoryFile::with_data(data.clone())))];

    let receiver_session = Session::new(ProtocolKind::Kermit, true);
    let receiver = KermitEngine::new(KermitOptions::default());
    let received = std::sync::Mutex::new(Vec::new());

    let (send_result, recv_result) = tokio::join!(
        sender.send_files(&mut sender_t, &sender_session, &mut files),
        receiver.receive_files(&mut receiver_t, &receiver_session, |name| {
            received.lock().unwrap().push(name.to_string());
            Ok(Box::new(MemoryFile::empty()) as Box<dyn LocalFile>)
        }),
    );

    send_result.expect("send succeeds");
    recv_result.expect("receive succeeds");

    assert_eq!(received.into_inner().unwrap(), vec!["alice26a.txt".to_string()]);
    assert_eq!(receiver_session.snapshot().files[0].size, Some(data.len() as u64));
    assert!(receiver_session.snapshot().files[0].complete);
}

#[tokio::test]
async fn streaming_mode_skips_per_packet_acks_but_still_completes() {
    let data = vec![0x7Eu8; 3000];
    let (mut sender_t, mut receiver_t) = loopback_pair();

    let options = KermitOptions { streaming: true, ..KermitOptions::default() };
    let sender_session = Session::new(ProtocolKind::Kermit, true);
    let sender = KermitEngine::new(options);
    let mut files: Vec<(String, Box<dyn LocalFile>)> =
        vec![("binary.dat".to_string(), Box::new(MemoryFile::with_data(data.clone())))];

    let receiver_session = Session::new(ProtocolKind::Kermit, true);
    let receiver = KermitEngine::new(options);

    let (send_result, recv_result) = tokio::join!(
        sender.send_files(&mut sender_t, &sender_session, &mut files),
        receiver.receive_files(&mut receiver_t, &receiver_session, |_name| {
            Ok(Box::new(MemoryFile::empty()) as Box<dyn LocalFile>)
        }),
    );

    send_result.expect("send succeeds");
    recv_result.expect("receive succeeds");
    assert!(receiver_session.snapshot().files[0].complete);
}
