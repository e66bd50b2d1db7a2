use std::sync::Arc;

use crate::packet::RtpPacket;
use crate::source::MergeGroupPolicy;

use super::SendTrack;

/// Key-frame gated switching between send tracks of the same merge group.
///
/// A track that belongs to a merge group (its merged id differs from its
/// own, or it shares a merged id with siblings) must not go live mid-GOP.
/// Activation is deferred until a key-frame arrives on the preparing
/// track; at that instant the previously active track goes inactive, so
/// there is at most one active track per group.
#[derive(Debug)]
pub struct StreamSwitchContext {
    merge: Arc<dyn MergeGroupPolicy>,

    /// Track id currently live in its merge group.
    active: Option<String>,

    /// Track id waiting for a key-frame before going live.
    preparing: Option<String>,
}

impl StreamSwitchContext {
    pub fn new(merge: Arc<dyn MergeGroupPolicy>) -> Self {
        StreamSwitchContext {
            merge,
            active: None,
            preparing: None,
        }
    }

    fn in_merge_group(&self, track: &SendTrack) -> bool {
        self.merge.merged_track_id(track.track_id()) != track.track_id()
    }

    /// Called for every track when the play stream is created. Decides
    /// the initial active/preparing split for merge groups.
    pub fn register(&mut self, track: &mut SendTrack) {
        if track.kind() != super::TrackKind::Video || !self.in_merge_group(track) {
            // standalone tracks switch on config alone
            track.set_track_status(true);
            return;
        }

        if self.active.is_none() && self.preparing.is_none() {
            // first group member starts out preparing; it goes live on
            // its first key-frame
            self.preparing = Some(track.track_id().to_string());
        }
        track.set_track_status(false);
    }

    /// Whether this track is the one waiting for a key-frame.
    pub fn is_track_preparing(&self, track: &SendTrack) -> bool {
        self.preparing.as_deref() == Some(track.track_id())
    }

    /// The active track of a merge group must not be deactivated by
    /// `set_track_active`; it only cedes on a key-frame switch.
    pub fn is_track_immutable(&self, track: &SendTrack) -> bool {
        self.in_merge_group(track) && self.active.as_deref() == Some(track.track_id())
    }

    /// A config wants this track active. For merge group members that are
    /// not already live this defers activation to the next key-frame and
    /// returns true (the caller requests a PLI upstream).
    pub fn activate_in_future(&mut self, track: &SendTrack) -> bool {
        if !self.in_merge_group(track) {
            return false;
        }
        if self.active.as_deref() == Some(track.track_id()) {
            return false;
        }

        self.preparing = Some(track.track_id().to_string());
        true
    }

    /// Consult before forwarding a video packet. When `pkt` is a key-frame
    /// on the preparing track, activate it and return the id of the track
    /// to deactivate (the previously active one).
    pub fn try_switch_stream(&mut self, track: &mut SendTrack, pkt: &RtpPacket) -> Option<String> {
        if self.preparing.as_deref() != Some(track.track_id()) {
            return None;
        }
        if !pkt.is_keyframe() {
            return None;
        }

        info!(
            "Stream switch to {} on key-frame, SSRC={}",
            track.track_id(),
            track.ssrc()
        );

        track.set_track_status(true);
        self.preparing = None;

        let prev = self.active.take();
        self.active = Some(track.track_id().to_string());

        // the previous active may be the same track on a re-switch
        prev.filter(|p| p != track.track_id())
    }
}
