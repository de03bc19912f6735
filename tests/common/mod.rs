//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use bytes::Bytes;
use gridlink::{
    Connection, ConnectionStatus, InstanceId, MessageDesc, MessageId, NetError, NetworkHooks,
    QueryId,
};
use tokio::{io::DuplexStream, sync::mpsc, task::JoinHandle};

/// Hooks implementation that records everything the connection reports.
pub struct RecordingHooks {
    data_tx: mpsc::UnboundedSender<MessageDesc>,
    statuses: Arc<Mutex<Vec<ConnectionStatus>>>,
    aborted: Arc<AtomicUsize>,
    capacity: u64,
}

/// Observation side of a [`RecordingHooks`] instance.
pub struct HookProbes {
    pub data_rx: mpsc::UnboundedReceiver<MessageDesc>,
    pub statuses: Arc<Mutex<Vec<ConnectionStatus>>>,
    pub aborted: Arc<AtomicUsize>,
}

impl NetworkHooks for RecordingHooks {
    fn on_data_message(&mut self, _peer: InstanceId, msg: MessageDesc) {
        let _ = self.data_tx.send(msg);
    }

    fn on_status(&mut self, status: ConnectionStatus) {
        self.statuses.lock().expect("status lock").push(status);
    }

    fn on_message_abort(&mut self, _msg: MessageDesc) {
        self.aborted.fetch_add(1, Ordering::SeqCst);
    }

    fn advertised_capacity(&self, _mqt: gridlink::MessageQueueType) -> u64 { self.capacity }
}

/// Build hooks advertising `capacity` messages of receive space.
pub fn recording_hooks(capacity: u64) -> (Box<RecordingHooks>, HookProbes) {
    let (data_tx, data_rx) = mpsc::unbounded_channel();
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let aborted = Arc::new(AtomicUsize::new(0));
    let hooks = Box::new(RecordingHooks {
        data_tx,
        statuses: Arc::clone(&statuses),
        aborted: Arc::clone(&aborted),
        capacity,
    });
    let probes = HookProbes {
        data_rx,
        statuses,
        aborted,
    };
    (hooks, probes)
}

/// A small data message tagged for ordering assertions.
pub fn data_msg(tag: u32) -> MessageDesc {
    MessageDesc::new(MessageId(tag), Bytes::from_static(b"record")).with_query(QueryId(u64::from(tag)))
}

/// Drive the connection on its own task, handing it back on completion.
pub fn spawn_run(
    mut conn: Connection<DuplexStream>,
) -> JoinHandle<(Connection<DuplexStream>, Result<(), NetError>)> {
    tokio::spawn(async move {
        let result = conn.run().await;
        (conn, result)
    })
}
