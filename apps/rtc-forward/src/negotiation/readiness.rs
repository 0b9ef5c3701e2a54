use crate::peer::{MediaKinds, TrackKind};

/// Decides the single moment the session descriptor may be written: every
/// media kind declared by the accepted offer has delivered a packet.
#[derive(Debug, Default)]
pub struct TrackReadiness {
    expected: MediaKinds,
    flowing: MediaKinds,
    fired: bool,
}

impl TrackReadiness {
    pub fn expect(&mut self, kinds: MediaKinds) {
        self.expected = kinds;
    }

    /// Records traffic for `kind`. Returns true exactly once, on the packet
    /// that completes the expected set.
    pub fn mark_flowing(&mut self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Video => self.flowing.video = true,
            TrackKind::Audio => self.flowing.audio = true,
        }
        if self.fired || self.expected.is_empty() {
            return false;
        }
        let ready = [TrackKind::Video, TrackKind::Audio]
            .into_iter()
            .all(|kind| !self.expected.contains(kind) || self.flowing.contains(kind));
        if ready {
            self.fired = true;
        }
        ready
    }
}
