//! External collaborators of a connection.
//!
//! The cross-connection stream registry, the SSRC allocator, the merge
//! group policy, the packet tap and the server session index are all
//! process-wide concerns owned by the embedding server. They are injected
//! as explicit dependencies at connection construction.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::format::Codec;
use crate::negotiate::{StreamDescription, TrackDescription};
use crate::packet::RtpPacket;
use crate::rtp::Ssrc;
use crate::streams::TrackKind;
use crate::RtcError;

/// Identity of a stream within the server: vhost/app/stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Request {
    pub vhost: String,
    pub app: String,
    pub stream: String,
}

impl Request {
    pub fn new(vhost: impl Into<String>, app: impl Into<String>, stream: impl Into<String>) -> Self {
        Request {
            vhost: vhost.into(),
            app: app.into(),
            stream: stream.into(),
        }
    }

    /// The app/stream tuple as used for msid and logging.
    pub fn stream_url(&self) -> String {
        format!("{}/{}", self.app, self.stream)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.vhost, self.app, self.stream)
    }
}

/// Receives key-frame requests (PLI) relayed from subscribers.
pub trait KeyframeSink: Send + Sync {
    fn request_keyframe(&self, ssrc: Ssrc);
}

/// Allocates fresh SSRCs for play tracks.
pub trait SsrcAllocator: Send + Sync {
    fn allocate(&self) -> Ssrc;
}

/// Maps a track id to its merge group id. Tracks whose merged id differs
/// from their own are alternatives within one group and share a play SSRC.
pub trait MergeGroupPolicy: Send + Sync + fmt::Debug {
    fn merged_track_id(&self, track_id: &str) -> String;
}

/// No merging: every track is its own group.
#[derive(Debug, Default)]
pub struct NoMerge;

impl MergeGroupPolicy for NoMerge {
    fn merged_track_id(&self, track_id: &str) -> String {
        track_id.to_string()
    }
}

/// Optional copy of interesting datagrams for offline analysis.
pub trait PacketTap: Send + Sync {
    fn tap(&self, data: &[u8]);
}

/// The default tap: nothing.
#[derive(Debug, Default)]
pub struct NoTap;

impl PacketTap for NoTap {
    fn tap(&self, _data: &[u8]) {}
}

/// Re-indexes a connection in the server table when the peer 5-tuple
/// changes (the client hopped network interface).
pub trait SessionIndex: Send + Sync {
    fn insert(&self, peer_id: &str);
    fn remove(&self, peer_id: &str);
}

/// The cross-connection stream registry.
pub trait SourceRegistry: Send + Sync {
    /// Fetch or create the shared stream entry for a request.
    fn fetch_or_create(&self, req: &Request) -> Result<Arc<dyn MediaSource>, RtcError>;
}

/// One published stream, shared between its publisher and any number of
/// players. Implementations provide their own synchronization.
pub trait MediaSource: KeyframeSink + Send + Sync {
    /// The publisher is about to feed media.
    fn on_publish(&self) -> Result<(), RtcError>;

    /// The publisher is gone.
    fn on_unpublish(&self);

    /// Sets (or clears) the non-owning "current publisher" slot, through
    /// which subscriber PLIs are relayed.
    fn set_publish_stream(&self, publisher: Option<PublisherHandle>);

    /// Store the negotiated stream description of the publisher.
    fn set_stream_desc(&self, desc: StreamDescription);

    /// Published track descriptions by kind and codec.
    fn track_descs(&self, kind: TrackKind, codec: Codec) -> Vec<TrackDescription>;

    /// Create a consumer receiving the published packets.
    fn subscribe(&self) -> Consumer;

    /// Seed a fresh consumer with the cached SPS/PPS (and whatever else
    /// the GOP cache holds) so decode can start before the next key-frame.
    fn dump_gop_cache(&self, consumer: &Consumer);

    /// Publisher path: feed one depacketized packet into the fan-out.
    fn on_rtp(&self, pkt: RtpPacket) -> Result<(), RtcError>;
}

/// Handle to a live publish stream, used by sources to relay PLI without
/// owning the publisher (no cycles).
#[derive(Debug, Clone)]
pub struct PublisherHandle {
    tx: mpsc::UnboundedSender<Ssrc>,
}

impl PublisherHandle {
    pub fn new(tx: mpsc::UnboundedSender<Ssrc>) -> Self {
        PublisherHandle { tx }
    }
}

impl KeyframeSink for PublisherHandle {
    fn request_keyframe(&self, ssrc: Ssrc) {
        // the publisher is gone when this errors; nothing to relay to
        let _ = self.tx.send(ssrc);
    }
}

/// Consuming side of the per-player packet channel.
///
/// Sources push packets into the [`ConsumerSender`]; the play loop waits
/// here. The wait is the single natural suspension point of the play task
/// and is cancellation-aware through the channel closing.
#[derive(Debug)]
pub struct Consumer {
    rx: mpsc::Receiver<RtpPacket>,
}

/// Producing side of the per-player packet channel.
#[derive(Debug, Clone)]
pub struct ConsumerSender {
    tx: mpsc::Sender<RtpPacket>,
}

/// Create a consumer channel pair. `capacity` bounds how far a slow
/// player can fall behind before the source drops packets for it.
pub fn consumer_channel(capacity: usize) -> (ConsumerSender, Consumer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ConsumerSender { tx }, Consumer { rx })
}

impl ConsumerSender {
    /// Push a packet, dropping it if the consumer is full or gone.
    pub fn send(&self, pkt: RtpPacket) {
        if let Err(e) = self.tx.try_send(pkt) {
            trace!("Consumer not keeping up: {}", e);
        }
    }
}

impl Consumer {
    /// Wait for at least `mw_msgs.max(1)` packets, then drain everything
    /// queued. Returns `None` when the source is gone.
    pub async fn wait(&mut self, mw_msgs: usize) -> Option<Vec<RtpPacket>> {
        let want = mw_msgs.max(1);
        let mut pkts = Vec::with_capacity(want);

        while pkts.len() < want {
            match self.rx.recv().await {
                Some(p) => pkts.push(p),
                None => {
                    if pkts.is_empty() {
                        return None;
                    }
                    break;
                }
            }
        }

        // drain whatever else is already queued
        while let Ok(p) = self.rx.try_recv() {
            pkts.push(p);
        }

        Some(pkts)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::packet::RtpPayload;
    use crate::rtp::RtpHeader;

    fn pkt(seq: u16) -> RtpPacket {
        RtpPacket {
            kind: TrackKind::Audio,
            header: RtpHeader {
                sequence_number: seq,
                ..Default::default()
            },
            payload: RtpPayload::Raw(vec![]),
        }
    }

    #[tokio::test]
    async fn consumer_waits_for_batch() {
        let (tx, mut rx) = consumer_channel(16);

        tx.send(pkt(1));
        tx.send(pkt(2));
        tx.send(pkt(3));

        let batch = rx.wait(2).await.unwrap();
        // waits for 2, drains the third
        assert_eq!(batch.len(), 3);
    }

    #[tokio::test]
    async fn consumer_none_when_source_gone() {
        let (tx, mut rx) = consumer_channel(16);
        drop(tx);
        assert!(rx.wait(0).await.is_none());
    }

    #[test]
    fn no_merge_is_identity() {
        assert_eq!(NoMerge.merged_track_id("abc"), "abc");
    }
}
