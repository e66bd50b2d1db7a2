//! Test doubles for the external collaborators.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::format::Codec;
use crate::negotiate::{StreamDescription, TrackDescription};
use crate::packet::RtpPacket;
use crate::rtp::Ssrc;
use crate::source::{
    consumer_channel, Consumer, ConsumerSender, KeyframeSink, MediaSource, PacketTap,
    PublisherHandle, Request, SessionIndex, SourceRegistry, SsrcAllocator,
};
use crate::streams::TrackKind;
use crate::RtcError;

/// Tap that drops everything.
pub(crate) struct NullTap;

impl PacketTap for NullTap {
    fn tap(&self, _data: &[u8]) {}
}

/// Sequential SSRC allocator starting at 5000.
pub(crate) struct SeqSsrcs(AtomicU32);

impl SeqSsrcs {
    pub fn new() -> Self {
        SeqSsrcs(AtomicU32::new(5000))
    }
}

impl SsrcAllocator for SeqSsrcs {
    fn allocate(&self) -> Ssrc {
        self.0.fetch_add(1, Ordering::Relaxed).into()
    }
}

/// Index that remembers nothing.
pub(crate) struct NullIndex;

impl SessionIndex for NullIndex {
    fn insert(&self, _peer_id: &str) {}
    fn remove(&self, _peer_id: &str) {}
}

/// In-memory stream source with a single consumer fan-out.
pub(crate) struct TestSource {
    desc: Mutex<StreamDescription>,
    publisher: Mutex<Option<PublisherHandle>>,
    consumers: Mutex<Vec<ConsumerSender>>,
    keyframe_requests: Mutex<Vec<Ssrc>>,
    publish_count: AtomicU64,
    packets: AtomicU64,
}

impl TestSource {
    pub fn new() -> Self {
        TestSource {
            desc: Mutex::new(StreamDescription::default()),
            publisher: Mutex::new(None),
            consumers: Mutex::new(vec![]),
            keyframe_requests: Mutex::new(vec![]),
            publish_count: AtomicU64::new(0),
            packets: AtomicU64::new(0),
        }
    }

    pub fn publish_count(&self) -> u64 {
        self.publish_count.load(Ordering::Relaxed)
    }

    pub fn packet_count(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn keyframe_requests(&self) -> Vec<Ssrc> {
        self.keyframe_requests.lock().unwrap().clone()
    }

    pub fn set_tracks(&self, desc: StreamDescription) {
        *self.desc.lock().unwrap() = desc;
    }

    /// Push a packet into all consumers, like a live publisher would.
    pub fn feed(&self, pkt: RtpPacket) {
        for c in self.consumers.lock().unwrap().iter() {
            c.send(pkt.clone());
        }
    }
}

impl KeyframeSink for TestSource {
    fn request_keyframe(&self, ssrc: Ssrc) {
        self.keyframe_requests.lock().unwrap().push(ssrc);
        if let Some(publisher) = self.publisher.lock().unwrap().as_ref() {
            publisher.request_keyframe(ssrc);
        }
    }
}

impl MediaSource for TestSource {
    fn on_publish(&self) -> Result<(), RtcError> {
        self.publish_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn on_unpublish(&self) {}

    fn set_publish_stream(&self, publisher: Option<PublisherHandle>) {
        *self.publisher.lock().unwrap() = publisher;
    }

    fn set_stream_desc(&self, desc: StreamDescription) {
        self.set_tracks(desc);
    }

    fn track_descs(&self, kind: TrackKind, codec: Codec) -> Vec<TrackDescription> {
        self.desc
            .lock()
            .unwrap()
            .tracks()
            .filter(|t| t.kind == kind && t.media.codec == codec)
            .cloned()
            .collect()
    }

    fn subscribe(&self) -> Consumer {
        let (tx, rx) = consumer_channel(128);
        self.consumers.lock().unwrap().push(tx);
        rx
    }

    fn dump_gop_cache(&self, _consumer: &Consumer) {}

    fn on_rtp(&self, pkt: RtpPacket) -> Result<(), RtcError> {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.feed(pkt);
        Ok(())
    }
}

/// Registry handing out one shared [`TestSource`].
pub(crate) struct TestRegistry {
    source: Arc<TestSource>,
}

impl TestRegistry {
    pub fn new() -> Self {
        TestRegistry {
            source: Arc::new(TestSource::new()),
        }
    }

    pub fn source(&self) -> Arc<TestSource> {
        self.source.clone()
    }
}

impl SourceRegistry for TestRegistry {
    fn fetch_or_create(&self, _req: &Request) -> Result<Arc<dyn MediaSource>, RtcError> {
        Ok(self.source.clone())
    }
}
