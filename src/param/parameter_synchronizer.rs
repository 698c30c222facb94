use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::crtp::communicator::CrtpCommunicator;
use crate::crtp::crtp_message::{CrtpMessage, CrtpPort};
use crate::crtp::event_registry::HandlerId;
use crate::util::buf_ext::{BufExt, BufMutExt};


pub const READ_CHANNEL: u8 = 1;
pub const WRITE_CHANNEL: u8 = 2;


#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ParamEvent {
    /// raw value bytes as sent by the copter; decoding them requires the parameter's TOC entry
    ParameterReceived { id: u16, value: Bytes },
    ParameterStored { id: u16 },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ParamRequestKind {
    Read,
    Write(Bytes),
}

#[derive(Clone, Debug)]
struct ParamRequest {
    seq: u64,
    id: u16,
    kind: ParamRequestKind,
}
impl ParamRequest {
    fn channel(&self) -> u8 {
        match self.kind {
            ParamRequestKind::Read => READ_CHANNEL,
            ParamRequestKind::Write(_) => WRITE_CHANNEL,
        }
    }
}


#[derive(Default)]
struct RequestQueue {
    requests: VecDeque<ParamRequest>,
    /// seq of the head request once the worker has sent it
    in_flight: Option<u64>,
}

struct SyncShared {
    use_v2: AtomicBool,
    queue: Mutex<RequestQueue>,
    work_queued: Notify,
    head_answered: Notify,
    events: broadcast::Sender<ParamEvent>,
}
impl SyncShared {
    fn use_v2(&self) -> bool {
        self.use_v2.load(Ordering::Acquire)
    }

    fn on_param_message(&self, message: &CrtpMessage) {
        let channel = message.channel();
        if channel != READ_CHANNEL && channel != WRITE_CHANNEL {
            return;
        }

        let use_v2 = self.use_v2();
        let mut buf = message.payload().clone();
        let Ok(id) = buf.try_read_id(use_v2) else {
            warn!(?message, "parameter response too short - dropping");
            return;
        };

        let answered = {
            let mut queue = self.queue.lock();
            match queue.requests.front() {
                Some(head) if Some(head.seq) == queue.in_flight && head.id == id && head.channel() == channel => {
                    queue.in_flight = None;
                    queue.requests.pop_front()
                }
                _ => None,
            }
        };
        let Some(request) = answered else {
            debug!(?message, "parameter response does not match the pending request - dropping");
            return;
        };
        trace!(seq = request.seq, id, "parameter request answered");

        let event = match request.kind {
            ParamRequestKind::Read => {
                if use_v2 {
                    // status byte
                    if buf.has_remaining() {
                        buf.advance(1);
                    }
                }
                ParamEvent::ParameterReceived { id, value: buf }
            }
            ParamRequestKind::Write(_) => ParamEvent::ParameterStored { id },
        };
        let _ = self.events.send(event);
        self.head_answered.notify_one();
    }
}


struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Serializes parameter reads and writes: the copter handles only one parameter request at a
///  time, so requests are queued and sent one after the other, each only after the previous one
///  was answered. Answers are published as [ParamEvent]s.
pub struct ParameterSynchronizer {
    comm: Arc<dyn CrtpCommunicator>,
    shared: Arc<SyncShared>,
    next_seq: AtomicU64,
    handler_id: HandlerId,
    stop_timeout: Duration,
    worker: tokio::sync::Mutex<Option<Worker>>,
}

impl Drop for ParameterSynchronizer {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.handle.abort();
        }
        self.comm.remove_handler(CrtpPort::Param.into(), self.handler_id);
    }
}

impl ParameterSynchronizer {
    pub fn new(comm: Arc<dyn CrtpCommunicator>, stop_timeout: Duration) -> ParameterSynchronizer {
        let (events, _) = broadcast::channel(128);
        let shared = Arc::new(SyncShared {
            use_v2: AtomicBool::new(false),
            queue: Default::default(),
            work_queued: Notify::new(),
            head_answered: Notify::new(),
            events,
        });

        let handler_id = {
            let shared = shared.clone();
            comm.register_handler(CrtpPort::Param.into(), Arc::new(move |msg: &CrtpMessage| shared.on_param_message(msg)))
        };

        ParameterSynchronizer {
            comm,
            shared,
            next_seq: AtomicU64::new(0),
            handler_id,
            stop_timeout,
            worker: Default::default(),
        }
    }

    pub fn set_use_v2(&self, use_v2: bool) {
        self.shared.use_v2.store(use_v2, Ordering::Release);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ParamEvent> {
        self.shared.events.subscribe()
    }

    pub fn num_pending(&self) -> usize {
        self.shared.queue.lock().requests.len()
    }

    pub fn request_read(&self, id: u16) {
        self.enqueue(id, ParamRequestKind::Read);
    }

    pub fn request_write(&self, id: u16, value: Bytes) {
        self.enqueue(id, ParamRequestKind::Write(value));
    }

    fn enqueue(&self, id: u16, kind: ParamRequestKind) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        trace!(seq, id, ?kind, "queueing parameter request");
        self.shared.queue.lock().requests.push_back(ParamRequest { seq, id, kind });
        self.shared.work_queued.notify_one();
    }

    pub async fn start_processing(&self) -> anyhow::Result<()> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            bail!("parameter synchronizer is already running");
        }

        let (shutdown, shutdown_receiver) = watch::channel(false);
        let handle = tokio::spawn(Self::process(self.comm.clone(), self.shared.clone(), shutdown_receiver));
        *worker = Some(Worker { shutdown, handle });
        Ok(())
    }

    pub async fn stop_processing(&self) -> anyhow::Result<()> {
        let Some(mut worker) = self.worker.lock().await.take() else {
            bail!("parameter synchronizer is not running");
        };

        let _ = worker.shutdown.send(true);
        match timeout(self.stop_timeout, &mut worker.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("parameter worker terminated abnormally: {}", e),
            Err(_) => {
                warn!("parameter worker did not terminate within {:?} - aborting it", self.stop_timeout);
                worker.handle.abort();
            }
        }
        Ok(())
    }

    /// Kills the worker without waiting for it to terminate. Queued requests stay queued.
    pub fn abort_processing(&self) {
        let Ok(mut worker) = self.worker.try_lock() else {
            warn!("parameter worker is being started or stopped concurrently - not aborting it");
            return;
        };
        if let Some(worker) = worker.take() {
            warn!("aborting parameter worker");
            worker.handle.abort();
        }
    }

    async fn process(comm: Arc<dyn CrtpCommunicator>, shared: Arc<SyncShared>, mut shutdown: watch::Receiver<bool>) {
        info!("parameter worker started");

        loop {
            let head = loop {
                let work_queued = shared.work_queued.notified();
                let next = {
                    let mut queue = shared.queue.lock();
                    let head = queue.requests.front().cloned();
                    queue.in_flight = head.as_ref().map(|r| r.seq);
                    head
                };
                if let Some(head) = next {
                    break head;
                }
                tokio::select! {
                    _ = work_queued => {}
                    _ = shutdown.changed() => {
                        info!("parameter worker stopped");
                        return;
                    }
                }
            };

            Self::send_request(comm.as_ref(), &head, shared.use_v2());

            loop {
                let head_answered = shared.head_answered.notified();
                if shared.queue.lock().requests.front().map(|r| r.seq) != Some(head.seq) {
                    break;
                }
                tokio::select! {
                    _ = head_answered => {}
                    _ = shutdown.changed() => {
                        info!("parameter worker stopped");
                        return;
                    }
                }
            }
        }
    }

    fn send_request(comm: &dyn CrtpCommunicator, request: &ParamRequest, use_v2: bool) {
        let mut id_bytes = BytesMut::with_capacity(2);
        id_bytes.put_id(request.id, use_v2);
        let id_bytes = id_bytes.freeze();

        let mut payload = BytesMut::from(id_bytes.as_ref());
        if let ParamRequestKind::Write(value) = &request.kind {
            payload.put_slice(value);
        }
        let payload = payload.freeze();

        let prefix = match request.kind {
            ParamRequestKind::Read => payload.clone(),
            ParamRequestKind::Write(_) => id_bytes,
        };

        debug!(seq = request.seq, id = request.id, channel = request.channel(), "sending parameter request");
        comm.send_expecting_prefix(CrtpMessage::new(CrtpPort::Param, request.channel(), payload), prefix);
    }
}
