use std::mem;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::crtp::communicator::CrtpCommunicator;
use crate::crtp::crtp_message::CrtpMessage;
use crate::crtp::event_registry::HandlerId;
use crate::toc::toc::{Toc, TocEntry, TocKind};
use crate::toc::toc_cache::TocCache;
use crate::util::buf_ext::BufExt;


pub const CMD_TOC_ELEMENT: u8 = 0;
pub const CMD_TOC_INFO: u8 = 1;
pub const CMD_TOC_ITEM_V2: u8 = 2;
pub const CMD_TOC_INFO_V2: u8 = 3;

pub const TOC_CHANNEL: u8 = 0;


enum FetchPhase {
    AwaitingInfo,
    CheckingCache,
    AwaitingElement {
        crc: u32,
        count: u16,
        next: u16,
        entries: Vec<TocEntry>,
    },
    Done,
}

enum Step {
    Ignore,
    CheckCache { crc: u32, count: u16 },
    RequestElement(u16),
    Downloaded(Arc<Toc>),
}

struct FetchState {
    phase: FetchPhase,
    completion: Option<oneshot::Sender<Arc<Toc>>>,
    handler_id: Option<HandlerId>,
}
impl FetchState {
    fn is_abandoned(&self) -> bool {
        self.completion.as_ref().map_or(true, |c| c.is_closed())
    }
}

struct FetchSession {
    kind: TocKind,
    use_v2: bool,
    comm: Arc<dyn CrtpCommunicator>,
    cache: Arc<TocCache>,
    state: Mutex<FetchState>,
}
impl FetchSession {
    fn info_cmd(&self) -> u8 {
        if self.use_v2 { CMD_TOC_INFO_V2 } else { CMD_TOC_INFO }
    }

    fn element_cmd(&self) -> u8 {
        if self.use_v2 { CMD_TOC_ITEM_V2 } else { CMD_TOC_ELEMENT }
    }

    fn request_info(&self) {
        let cmd = self.info_cmd();
        debug!(kind = ?self.kind, "requesting TOC info");
        let message = CrtpMessage::new(self.kind.port(), TOC_CHANNEL, vec![cmd]);
        self.comm.send_expecting_prefix(message, Bytes::from(vec![cmd]));
    }

    fn request_element(&self, idx: u16) {
        let mut payload = BytesMut::with_capacity(3);
        payload.put_u8(self.element_cmd());
        if self.use_v2 {
            payload.put_u16_le(idx);
        }
        else {
            payload.put_u8(idx as u8);
        }
        let payload = payload.freeze();

        trace!(kind = ?self.kind, idx, "requesting TOC element");
        let message = CrtpMessage::new(self.kind.port(), TOC_CHANNEL, payload.clone());
        self.comm.send_expecting_prefix(message, payload);
    }

    /// Runs on the dispatch loop, so everything touching the cache store is moved to a task
    ///  of its own.
    fn on_message(self: &Arc<Self>, message: &CrtpMessage) {
        if message.channel() != TOC_CHANNEL {
            return;
        }

        let step = {
            let mut state = self.state.lock();
            match self.next_step(&mut state.phase, message) {
                Ok(step) => step,
                Err(e) => {
                    warn!(kind = ?self.kind, ?message, "malformed TOC reply: {}", e);
                    Step::Ignore
                }
            }
        };

        match step {
            Step::Ignore => {}
            Step::CheckCache { crc, count } => {
                tokio::spawn(self.clone().on_info(crc, count));
            }
            Step::RequestElement(idx) => self.request_element(idx),
            Step::Downloaded(toc) => {
                let session = self.clone();
                tokio::spawn(async move {
                    session.cache.insert(toc.clone()).await;
                    session.complete(toc);
                });
            }
        }
    }

    fn next_step(&self, phase: &mut FetchPhase, message: &CrtpMessage) -> anyhow::Result<Step> {
        let mut buf = message.payload().clone();
        let cmd = buf.try_read_u8()?;

        match phase {
            FetchPhase::AwaitingInfo if cmd == self.info_cmd() => {
                let count = if self.use_v2 {
                    buf.try_read_u16_le()?
                }
                else {
                    buf.try_read_u8()?.into()
                };
                let crc = buf.try_read_u32_le()?;
                debug!(kind = ?self.kind, count, crc = %format!("{:08X}", crc), "received TOC info");

                *phase = FetchPhase::CheckingCache;
                Ok(Step::CheckCache { crc, count })
            }
            FetchPhase::AwaitingElement { crc, count, next, entries } if cmd == self.element_cmd() => {
                let entry = TocEntry::decode(self.kind, self.use_v2, &mut buf)?;
                if entry.id != *next {
                    trace!(kind = ?self.kind, expected = *next, received = entry.id, "ignoring out-of-sequence TOC element");
                    return Ok(Step::Ignore);
                }

                entries.push(entry);
                if *next + 1 < *count {
                    *next += 1;
                    return Ok(Step::RequestElement(*next));
                }

                let toc = Arc::new(Toc::new(self.kind, *crc, mem::take(entries)));
                *phase = FetchPhase::Done;
                Ok(Step::Downloaded(toc))
            }
            _ => {
                trace!(kind = ?self.kind, ?message, "ignoring TOC message");
                Ok(Step::Ignore)
            }
        }
    }

    async fn on_info(self: Arc<Self>, crc: u32, count: u16) {
        if let Some(toc) = self.cache.lookup(crc).await {
            debug!(kind = ?self.kind, "TOC found in cache");
            self.complete(toc);
            return;
        }
        if count == 0 {
            let toc = Arc::new(Toc::new(self.kind, crc, Vec::new()));
            self.cache.insert(toc.clone()).await;
            self.complete(toc);
            return;
        }

        {
            let mut state = self.state.lock();
            if state.is_abandoned() {
                debug!(kind = ?self.kind, "TOC fetch was abandoned during cache lookup");
                return;
            }
            state.phase = FetchPhase::AwaitingElement {
                crc,
                count,
                next: 0,
                entries: Vec::with_capacity(count as usize),
            };
        }
        self.request_element(0);
    }

    fn complete(&self, toc: Arc<Toc>) {
        debug!(?toc, "TOC fetch complete");
        self.unsubscribe();

        let completion = {
            let mut state = self.state.lock();
            state.phase = FetchPhase::Done;
            state.completion.take()
        };
        if let Some(completion) = completion {
            let _ = completion.send(toc);
        }
    }

    fn unsubscribe(&self) {
        let handler_id = self.state.lock().handler_id.take();
        if let Some(id) = handler_id {
            self.comm.remove_handler(self.kind.port().into(), id);
        }
    }
}


/// Downloads one of the copter's tables of contents: it asks for the number of entries and the
///  TOC's CRC, and unless the cache has a TOC with that CRC, requests the entries one at a time
///  in ascending order.
///
/// Dropping the fetcher abandons the download.
pub struct TocFetcher {
    session: Arc<FetchSession>,
    completion: oneshot::Receiver<Arc<Toc>>,
}

impl Drop for TocFetcher {
    fn drop(&mut self) {
        self.session.unsubscribe();
    }
}

impl TocFetcher {
    pub fn start(kind: TocKind, use_v2: bool, comm: Arc<dyn CrtpCommunicator>, cache: Arc<TocCache>) -> TocFetcher {
        let (completion_sender, completion) = oneshot::channel();

        let session = Arc::new(FetchSession {
            kind,
            use_v2,
            comm: comm.clone(),
            cache,
            state: Mutex::new(FetchState {
                phase: FetchPhase::AwaitingInfo,
                completion: Some(completion_sender),
                handler_id: None,
            }),
        });

        let handler = {
            let session = session.clone();
            Arc::new(move |msg: &CrtpMessage| session.on_message(msg))
        };
        let handler_id = comm.register_handler(kind.port().into(), handler);
        session.state.lock().handler_id = Some(handler_id);

        session.request_info();

        TocFetcher {
            session,
            completion,
        }
    }

    pub async fn completion(mut self) -> anyhow::Result<Arc<Toc>> {
        (&mut self.completion).await
            .map_err(|_| anyhow!("{} TOC fetch was abandoned", self.session.kind.name()))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::sleep;

    use crate::crtp::crtp_message::CrtpPort;
    use crate::test_util::communicator::RecordingCommunicator;
    use crate::toc::toc_cache::MockTocCacheStore;
    use super::*;

    fn info_reply(count: u8, crc: u32) -> CrtpMessage {
        let mut payload = vec![CMD_TOC_INFO, count];
        payload.extend_from_slice(&crc.to_le_bytes());
        CrtpMessage::new(CrtpPort::Param, TOC_CHANNEL, payload)
    }

    fn element_reply(idx: u8, group: &str, name: &str) -> CrtpMessage {
        let mut payload = vec![CMD_TOC_ELEMENT, idx, 0x08];
        payload.extend_from_slice(group.as_bytes());
        payload.push(0);
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        CrtpMessage::new(CrtpPort::Param, TOC_CHANNEL, payload)
    }

    async fn settle() {
        sleep(Duration::from_millis(10)).await;
    }

    fn element_requests(comm: &RecordingCommunicator) -> Vec<Vec<u8>> {
        comm.sent().iter()
            .filter(|m| m.payload().first() == Some(&CMD_TOC_ELEMENT))
            .map(|m| m.payload().to_vec())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_on_cache_miss() {
        let comm = Arc::new(RecordingCommunicator::new());
        let cache = Arc::new(TocCache::in_memory());
        let fetcher = TocFetcher::start(TocKind::Param, false, comm.clone(), cache.clone());

        assert_eq!(comm.sent(), vec![CrtpMessage::new(CrtpPort::Param, 0, vec![CMD_TOC_INFO])]);

        comm.deliver(&info_reply(3, 0xAABBCCDD));
        settle().await;
        comm.deliver(&element_reply(0, "a", "x"));
        comm.deliver(&element_reply(1, "a", "y"));
        comm.deliver(&element_reply(2, "b", "z"));

        let toc = fetcher.completion().await.unwrap();
        assert_eq!(toc.crc(), 0xAABBCCDD);
        assert_eq!(toc.entries().iter().map(|e| e.full_name()).collect::<Vec<_>>(), vec!["a.x", "a.y", "b.z"]);

        assert_eq!(element_requests(&comm), vec![vec![0, 0], vec![0, 1], vec![0, 2]]);
        assert!(cache.lookup(0xAABBCCDD).await.is_some());

        // completed fetches stop listening, and all requests were answered
        assert_eq!(comm.num_handlers(), 0);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(element_requests(&comm).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit() {
        let comm = Arc::new(RecordingCommunicator::new());
        let cache = Arc::new(TocCache::in_memory());
        cache.insert(Arc::new(Toc::new(TocKind::Param, 0xAABBCCDD, vec![
            TocEntry::new(TocKind::Param, 0, 0x08, "a".into(), "x".into()).unwrap(),
        ]))).await;

        let fetcher = TocFetcher::start(TocKind::Param, false, comm.clone(), cache);
        comm.deliver(&info_reply(1, 0xAABBCCDD));

        let toc = fetcher.completion().await.unwrap();
        assert_eq!(toc.len(), 1);
        assert!(element_requests(&comm).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_toc() {
        let comm = Arc::new(RecordingCommunicator::new());
        let fetcher = TocFetcher::start(TocKind::Param, false, comm.clone(), Arc::new(TocCache::in_memory()));
        comm.deliver(&info_reply(0, 0x01020304));

        let toc = fetcher.completion().await.unwrap();
        assert!(toc.is_empty());
        assert!(element_requests(&comm).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignores_unexpected_elements() {
        let comm = Arc::new(RecordingCommunicator::new());
        let fetcher = TocFetcher::start(TocKind::Param, false, comm.clone(), Arc::new(TocCache::in_memory()));

        // elements before the info reply, and out of sequence, are ignored
        comm.deliver(&element_reply(0, "early", "bird"));
        comm.deliver(&info_reply(2, 0x99));
        settle().await;
        comm.deliver(&element_reply(1, "a", "y"));
        comm.deliver(&element_reply(0, "a", "x"));
        comm.deliver(&element_reply(0, "a", "duplicate"));
        comm.deliver(&CrtpMessage::new(CrtpPort::Param, 1, vec![CMD_TOC_ELEMENT, 1, 0x08, b'n', 0, b'o', 0]));
        comm.deliver(&element_reply(1, "a", "y"));

        let toc = fetcher.completion().await.unwrap();
        assert_eq!(toc.entries().iter().map(|e| e.full_name()).collect::<Vec<_>>(), vec!["a.x", "a.y"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_v2_framing() {
        let comm = Arc::new(RecordingCommunicator::new());
        let fetcher = TocFetcher::start(TocKind::Log, true, comm.clone(), Arc::new(TocCache::in_memory()));
        assert_eq!(comm.sent(), vec![CrtpMessage::new(CrtpPort::Logging, 0, vec![CMD_TOC_INFO_V2])]);

        comm.deliver(&CrtpMessage::new(CrtpPort::Logging, 0, vec![CMD_TOC_INFO_V2, 1, 0, 4, 3, 2, 1]));
        settle().await;
        assert_eq!(comm.sent().last().map(|m| m.payload().to_vec()), Some(vec![CMD_TOC_ITEM_V2, 0, 0]));

        comm.deliver(&CrtpMessage::new(CrtpPort::Logging, 0, vec![CMD_TOC_ITEM_V2, 0, 0, 0x07, b's', 0, b'x', 0]));
        let toc = fetcher.completion().await.unwrap();
        assert_eq!(toc.crc(), 0x01020304);
        assert_eq!(toc.find("s.x").map(|e| e.id), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_info_request_is_resent() {
        let comm = Arc::new(RecordingCommunicator::new());
        let _fetcher = TocFetcher::start(TocKind::Param, false, comm.clone(), Arc::new(TocCache::in_memory()));

        sleep(Duration::from_millis(600)).await;
        assert_eq!(comm.sent().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_is_consulted_off_the_dispatch_path() {
        let mut store = MockTocCacheStore::new();
        store.expect_lookup()
            .withf(|crc| *crc == 0x99)
            .times(1)
            .returning(|_| Ok(None));
        store.expect_store()
            .withf(|toc| toc.crc() == 0x99 && toc.len() == 1)
            .times(1)
            .returning(|_| Ok(()));

        let comm = Arc::new(RecordingCommunicator::new());
        let fetcher = TocFetcher::start(TocKind::Param, false, comm.clone(), Arc::new(TocCache::new(Box::new(store))));

        // delivering the info reply returns without the store having been asked
        comm.deliver(&info_reply(1, 0x99));
        assert!(element_requests(&comm).is_empty());

        settle().await;
        assert_eq!(element_requests(&comm), vec![vec![0, 0]]);
        comm.deliver(&element_reply(0, "a", "x"));
        assert_eq!(fetcher.completion().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_during_cache_lookup() {
        let comm = Arc::new(RecordingCommunicator::new());
        let fetcher = TocFetcher::start(TocKind::Param, false, comm.clone(), Arc::new(TocCache::in_memory()));
        comm.deliver(&info_reply(2, 0x99));
        drop(fetcher);

        settle().await;
        assert!(element_requests(&comm).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_unsubscribes() {
        let comm = Arc::new(RecordingCommunicator::new());
        let fetcher = TocFetcher::start(TocKind::Param, false, comm.clone(), Arc::new(TocCache::in_memory()));
        assert_eq!(comm.num_handlers(), 1);
        drop(fetcher);
        assert_eq!(comm.num_handlers(), 0);
    }
}
