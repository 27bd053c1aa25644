use crate::Bitfield;

/// The decision point of the downloader (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// `|local| == numBlocks`.
    Complete,
    /// `peer \ local` is empty — this peer has nothing we need.
    PeerHasNothing,
    /// Fetch block `i`. If it came from the unassigned-rarest branch,
    /// `assigned[i]` has already been set by this call; in endgame mode
    /// (all remaining missing blocks already assigned to some worker)
    /// `assigned` is left untouched and duplicate work is expected.
    Index(usize),
}

/// Selects the next block to request from `peer`, given what we already
/// have (`local`) and what's already been handed to some worker
/// (`assigned`). Tie-breaking is always least index.
///
/// This is a pure function: the atomic test-and-set pairing the spec
/// requires (§4.6) is the caller's responsibility — it must hold whatever
/// guard covers `local`/`assigned` for the duration of this call, which is
/// exactly what [`FileTransfer::select_block`](crate::FileTransfer) does.
pub fn select_block(local: &Bitfield, peer: &Bitfield, assigned: &mut Bitfield) -> Decision {
    debug_assert_eq!(local.len(), peer.len());
    debug_assert_eq!(local.len(), assigned.len());

    if local.all() {
        return Decision::Complete;
    }

    // Least index in (peer \ local) \ assigned: unassigned, rare block.
    for i in 0..local.len() {
        if peer[i] && !local[i] && !assigned[i] {
            assigned.set(i, true);
            return Decision::Index(i);
        }
    }

    // Least index in peer \ local: endgame, duplicate work tolerated.
    for i in 0..local.len() {
        if peer[i] && !local[i] {
            return Decision::Index(i);
        }
    }

    Decision::PeerHasNothing
}
