//! Teardown behaviour: the disconnect rendezvous, query notification, and
//! fatal protocol errors.

mod common;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use bytes::BytesMut;
use common::{data_msg, recording_hooks, spawn_run};
use futures::StreamExt;
use gridlink::{
    codec::MessageCodec, Connection, ConnectionState, ControlEntry, ControlRecord, InstanceId,
    MessageDesc, MessageId, MessageQueueType, NetConfig, NetError, ProtocolViolation, QueryId,
};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{Encoder, FramedRead};

#[tokio::test]
async fn disconnect_aborts_queued_messages_and_notifies_queries() {
    // No reader on the far side and a buffer smaller than one header, so
    // the first write stays in flight for the whole test.
    let (a_stream, _b_stream) = tokio::io::duplex(16);
    let cfg = Arc::new(
        NetConfig::default().with_send_queue_limit(MessageQueueType::Replication, 16),
    );
    let (hooks, probes) = recording_hooks(8);
    let (mut conn, handle) =
        Connection::new(hooks, cfg, InstanceId(1), InstanceId(2)).expect("conn");
    conn.start(a_stream).expect("start");

    let notified = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&notified);
    handle
        .attach_query(
            QueryId(9),
            Box::new(move |query| seen.lock().expect("lock").push(query)),
        )
        .expect("attach");

    let task = spawn_run(conn);
    // One message in flight, two stranded in the queue.
    for tag in 1..=3 {
        handle
            .send_message(data_msg(tag), MessageQueueType::Replication)
            .await
            .expect("send");
    }

    handle.disconnect();
    let (conn, result) = task.await.expect("join");
    assert!(result.is_ok(), "requested disconnect is not an error");
    assert!(!conn.is_sending());
    assert_eq!(conn.state(), ConnectionState::NotConnected);
    assert_eq!(probes.aborted.load(Ordering::SeqCst), 2);
    assert_eq!(notified.lock().expect("lock").as_slice(), &[QueryId(9)]);

    // Dropping the connection must not abort a second time.
    drop(conn);
    assert_eq!(probes.aborted.load(Ordering::SeqCst), 2);

    let err = handle
        .send_message(data_msg(4), MessageQueueType::Replication)
        .await
        .expect_err("actor is gone");
    assert!(matches!(err, NetError::Closed));
}

#[tokio::test]
async fn detached_queries_are_not_notified() {
    let (a_stream, _b_stream) = tokio::io::duplex(16);
    let (hooks, _probes) = recording_hooks(8);
    let (mut conn, handle) =
        Connection::new(hooks, Arc::new(NetConfig::default()), InstanceId(1), InstanceId(2))
            .expect("conn");
    conn.start(a_stream).expect("start");

    let fired = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&fired);
    handle
        .attach_query(
            QueryId(5),
            Box::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .expect("attach");

    let task = spawn_run(conn);
    handle.detach_query(QueryId(5)).expect("detach");
    handle.disconnect();
    task.await.expect("join").1.expect("clean shutdown");
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn inconsistent_sequence_claim_aborts_the_connection() {
    let (a_stream, raw) = tokio::io::duplex(64 * 1024);
    let cfg = Arc::new(
        NetConfig::default().with_receive_queue_hint(MessageQueueType::Replication, 1),
    );
    let (hooks, probes) = recording_hooks(8);
    let (mut conn, handle) =
        Connection::new(hooks, Arc::clone(&cfg), InstanceId(1), InstanceId(2)).expect("conn");
    conn.start(a_stream).expect("start");

    let notified = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&notified);
    handle
        .attach_query(
            QueryId(7),
            Box::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .expect("attach");
    let task = spawn_run(conn);

    // Learn the connection's generation from its own introduction frame.
    handle
        .publish_receive_state(MessageQueueType::Replication)
        .expect("introduce");
    let (raw_read, mut raw_write) = tokio::io::split(raw);
    let mut frames = FramedRead::new(raw_read, MessageCodec::new(&cfg));
    let intro = frames.next().await.expect("frame").expect("decoded");
    let intro = ControlRecord::from_record(intro.record()).expect("control");
    let peer_gen = intro.entries[0].local_gen_id;

    let control = |local_seq_claim: u64| {
        let mut record = ControlRecord::default();
        record.push(ControlEntry {
            mqt: MessageQueueType::Replication,
            remote_size: 1,
            local_gen_id: 12345,
            remote_gen_id: peer_gen,
            local_seq_num: 0,
            remote_seq_num: local_seq_claim,
        });
        let msg = record.into_message().expect("encode");
        let mut wire = BytesMut::new();
        MessageCodec::new(&cfg).encode(msg, &mut wire).expect("frame");
        wire
    };

    // Introduce our incarnation with a consistent claim first, so the
    // later lie lands inside an established generation.
    raw_write.write_all(&control(0)).await.expect("handshake");

    // One replication message emitted, a second stranded behind credit.
    handle
        .send_message(data_msg(1), MessageQueueType::Replication)
        .await
        .expect("send");
    handle
        .send_message(data_msg(2), MessageQueueType::Replication)
        .await
        .expect("send");
    let emitted = frames.next().await.expect("frame").expect("decoded");
    assert_eq!(emitted.message_id(), MessageId(1));

    // Claim the connection emitted seven messages when it has emitted one.
    raw_write.write_all(&control(7)).await.expect("inject");

    let (_conn, result) = task.await.expect("join");
    assert!(matches!(
        result,
        Err(NetError::Protocol(ProtocolViolation::SequenceClaimAhead {
            claimed: 7,
            local: 1,
            ..
        }))
    ));
    // The stranded message was dropped and the query told.
    assert_eq!(probes.aborted.load(Ordering::SeqCst), 1);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn garbage_control_record_is_fatal() {
    let (a_stream, raw) = tokio::io::duplex(1024);
    let cfg = Arc::new(NetConfig::default());
    let (hooks, _probes) = recording_hooks(8);
    let (mut conn, _handle) =
        Connection::new(hooks, Arc::clone(&cfg), InstanceId(1), InstanceId(2)).expect("conn");
    conn.start(a_stream).expect("start");
    let task = spawn_run(conn);

    // A syntactically valid frame whose control record is garbage.
    let bogus = MessageDesc::new(MessageId(0), bytes::Bytes::from_static(&[0xff, 0xee, 0xdd]));
    let mut wire = BytesMut::new();
    MessageCodec::new(&cfg).encode(bogus, &mut wire).expect("frame");
    let (_raw_read, mut raw_write) = tokio::io::split(raw);
    raw_write.write_all(&wire).await.expect("inject");

    let (_conn, result) = task.await.expect("join");
    assert!(matches!(result, Err(NetError::Malformed(_))));
}

#[tokio::test]
async fn truncated_frame_is_fatal() {
    let (a_stream, raw) = tokio::io::duplex(1024);
    let cfg = Arc::new(NetConfig::default());
    let (hooks, _probes) = recording_hooks(8);
    let (mut conn, _handle) =
        Connection::new(hooks, Arc::clone(&cfg), InstanceId(1), InstanceId(2)).expect("conn");
    conn.start(a_stream).expect("start");
    let task = spawn_run(conn);

    // Half a header, then the peer goes away.
    let (_raw_read, mut raw_write) = tokio::io::split(raw);
    raw_write.write_all(&[1, 2, 3, 4]).await.expect("inject");
    raw_write.shutdown().await.expect("shutdown");
    drop(raw_write);
    drop(_raw_read);

    let (_conn, result) = task.await.expect("join");
    assert!(matches!(result, Err(NetError::Malformed(_)) | Err(NetError::Transport(_))));
}
