//! End-to-end Ymodem batch scenarios over an in-memory loopback transport

mod common;

use chrono::{DateTime, Utc};

use common::{loopback_pair, MemoryFile};
use transferkit::core::protocol::xmodem::XmodemFlavor;
use transferkit::core::protocol::ymodem::YmodemEngine;
use transferkit::{LocalFile, ProtocolKind, Session};

#[tokio::test]
async fn single_file_batch_round_trips_name_size_and_contents() {
    let data = b"the quick brown fox jumps over the lazy dog".repeat(10);
    let when = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();

    let (mut sender_t, mut receiver_t) = loopback_pair();

    let sender_session = Session::new(ProtocolKind::Ymodem, true);
    let mut sender_file = MemoryFile::with_data(data.clone());
    sender_file.set_modified(when).await.unwrap();
    let sender = YmodemEngine::new(XmodemFlavor::Crc);

    let receiver_session = Session::new(ProtocolKind::Ymodem, true);
    let received_names = std::sync::Mutex::new(Vec::new());
    let receiver = YmodemEngine::new(XmodemFlavor::Crc);

    let mut files = vec![("report.txt".to_string(), Box::new(sender_file) as Box<dyn LocalFile>)];

    let (send_result, recv_result) = tokio::join!(
        sender.send_files(&mut sender_t, &sender_session, &mut files),
        receiver.receive_files(&mut receiver_t, &receiver_session, |name| {
            received_names.lock().unwrap().push(name.to_string());
            Ok(Box::new(MemoryFile::empty()) as Box<dyn LocalFile>)
        }),
    );

    send_result.expect("send succeeds");
    recv_result.expect("receive succeeds");

    assert_eq!(received_names.into_inner().unwrap(), vec!["report.txt".to_string()]);
    assert_eq!(receiver_session.snapshot().files[0].remote_name, "report.txt");
    assert_eq!(receiver_session.snapshot().files[0].size, Some(data.len() as u64));
    assert!(receiver_session.snapshot().files[0].complete);
}

#[tokio::test]
async fn two_file_batch_transfers_both_files_in_order() {
    let (mut sender_t, mut receiver_t) = loopback_pair();

    let sender_session = Session::new(ProtocolKind::Ymodem, true);
    let sender = YmodemEngine::new(XmodemFlavor::Crc);
    let mut files: Vec<(String, Box<dyn LocalFile>)> = vec![
        ("one.txt".to_string(), Box::new(MemoryFile::with_data(b"first file".to_vec()))),
        ("two.txt".to_string(), Box::new(MemoryFile::with_data(b"second file, a bit longer".to_vec()))),
    ];

    let receiver_session = Session::new(ProtocolKind::Ymodem, true);
    let receiver = YmodemEngine::new(XmodemFlavor::Crc);
    let seen = std::sync::Mutex::new(Vec::new());

    let (send_result, recv_result) = tokio::join!(
        sender.send_files(&mut sender_t, &sender_session, &mut files),
        receiver.receive_files(&mut receiver_t, &receiver_session, |name| {
            seen.lock().unwrap().push(name.to_string());
            Ok(Box::new(MemoryFile::empty()))
        }),
    );

    send_result.expect("send succeeds");
    recv_result.expect("receive succeeds");
    assert_eq!(seen.into_inner().unwrap(), vec!["one.txt".to_string(), "two.txt".to_string()]);
    assert_eq!(receiver_session.completed_count(), 2);
}
