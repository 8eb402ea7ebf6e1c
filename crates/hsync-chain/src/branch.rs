//! A single chain branch: a contiguous run of headers rooted at a checkpoint height,
//! plus the single-writer leader slot peers race to claim (distilled spec §3, invariant 3).
use thiserror::Error;

use hsync_types::network::{Height, CHUNK_SIZE};

use crate::header::Header;

/// Errors raised while extending or forking a branch.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// `save_header`/`connect_chunk` was given a header that doesn't chain onto the tip.
    #[error("header at height {0} does not connect to the branch tip")]
    DoesNotConnect(Height),
    /// `fork` was asked to fork at a height this branch doesn't have locally.
    #[error("no local header at height {0} to fork from")]
    NoSuchLocalHeader(Height),
}

/// A contiguous chain of block headers, identified by the height at which it starts
/// (its checkpoint). Heights below the checkpoint belong to the parent branch, if any.
#[derive(Debug, Clone)]
pub struct Branch {
    /// Height at which this branch starts. For the root branch this is 0.
    checkpoint: Height,
    /// Headers from `checkpoint` onward; `headers[i]` is at height `checkpoint + i`.
    headers: Vec<Header>,
    /// Checkpoint key of the parent branch, if this branch was produced by a fork.
    parent: Option<Height>,
    /// Peer descriptor currently authorized to extend this branch, if any
    /// (distilled spec invariant 3: at most one peer per branch).
    catch_up: Option<String>,
}

impl Branch {
    /// Create a new, empty root branch (checkpoint 0, no parent).
    pub fn root() -> Self {
        Self {
            checkpoint: 0,
            headers: Vec::new(),
            parent: None,
            catch_up: None,
        }
    }

    /// Like [`Branch::root`], but with its backing `Vec` pre-sized to hold
    /// `checkpoints * CHUNK_SIZE` headers (distilled spec §6 "Headers file -
    /// pre-allocated to `80 * |CHECKPOINTS| * 2016` bytes before first use"; this is
    /// the in-memory analogue, sizing a `Vec` rather than a file).
    pub fn root_preallocated(checkpoints: usize) -> Self {
        Self {
            headers: Vec::with_capacity(checkpoints * CHUNK_SIZE as usize),
            ..Self::root()
        }
    }

    /// Checkpoint (identity key) of this branch.
    pub fn checkpoint(&self) -> Height {
        self.checkpoint
    }

    /// Checkpoint key of the parent branch, if any.
    pub fn parent(&self) -> Option<Height> {
        self.parent
    }

    /// Height of the last header stored *locally* in this branch (not counting the
    /// parent's prefix). `None` if this branch has no headers of its own yet.
    pub fn local_height(&self) -> Option<Height> {
        if self.headers.is_empty() {
            None
        } else {
            Some(self.checkpoint + self.headers.len() as u64 - 1)
        }
    }

    /// Look up a header at `height`, if it falls within this branch's own slice
    /// (i.e. `height >= checkpoint`). Heights below the checkpoint must be resolved
    /// via the parent, which only the registry can do.
    pub fn get_local(&self, height: Height) -> Option<&Header> {
        if height < self.checkpoint {
            return None;
        }
        self.headers.get((height - self.checkpoint) as usize)
    }

    /// Whether `header` matches what this branch has stored locally at its height.
    pub fn check_header_local(&self, header: &Header) -> bool {
        self.get_local(header.height) == Some(header)
    }

    /// Whether `header` would be a valid next header for this branch
    /// (distilled spec invariant 1: only call `save_header` when this returned true).
    ///
    /// `check_height` mirrors the original's `check_height` flag (distilled spec
    /// §4.E binary-search step): when `false`, only hash-linking is checked, not that
    /// the height immediately follows the tip — used once the exact fork height is
    /// already known and only hash continuity matters.
    pub fn can_connect(&self, header: &Header, check_height: bool) -> bool {
        match self.local_height() {
            None => {
                if check_height && header.height != self.checkpoint {
                    return false;
                }
                true
            }
            Some(tip_height) => {
                let tip = self.headers.last().expect("local_height implies headers non-empty");
                if check_height && header.height != tip_height + 1 {
                    return false;
                }
                header.prev_hash == tip.hash
            }
        }
    }

    /// Append `header` to this branch. Fails if [`Branch::can_connect`] would return
    /// false for it.
    pub fn save_header(&mut self, header: Header) -> Result<(), Error> {
        if !self.can_connect(&header, true) {
            return Err(Error::DoesNotConnect(header.height));
        }
        self.headers.push(header);
        Ok(())
    }

    /// Truncate this branch to empty and set `header` as its new sole entry, updating
    /// its checkpoint to `header.height`. Used when a checkpoint conflict is detected
    /// (distilled spec §4.E, binary-search "checkpoint conflicts with existing fork").
    pub fn reset_to(&mut self, header: Header) {
        self.checkpoint = header.height;
        self.headers.clear();
        self.headers.push(header);
    }

    /// Fork this branch at `header`, producing a new branch rooted at `header.height`
    /// with this branch as its parent. `header` must connect to this branch's local
    /// state at that height (the caller is expected to have already confirmed this
    /// branch's stored header at that height differs from `header`).
    pub fn fork(&self, header: Header) -> Branch {
        Branch {
            checkpoint: header.height,
            headers: vec![header],
            parent: Some(self.checkpoint),
            catch_up: None,
        }
    }

    /// Attempt to connect a full 2016-header chunk starting at `idx * CHUNK_SIZE`.
    /// Fails (returning `false`, without partial mutation) if any header in the chunk
    /// fails to connect to what precedes it.
    pub fn connect_chunk(&mut self, idx: u64, chunk: &[Header]) -> bool {
        let expected_start = idx * CHUNK_SIZE;
        if let Some(first) = chunk.first() {
            if first.height != expected_start {
                return false;
            }
        }

        let mut probe = self.clone();
        for header in chunk {
            if probe.save_header(*header).is_err() {
                return false;
            }
        }
        *self = probe;
        true
    }

    /// Current leader peer, if any.
    pub fn leader(&self) -> Option<&str> {
        self.catch_up.as_deref()
    }

    /// Claim leadership for `peer`. Returns `false` (and leaves the slot untouched) if
    /// another peer already holds it — enforcing invariant 3.
    pub fn claim_leader(&mut self, peer: &str) -> bool {
        match &self.catch_up {
            Some(existing) if existing != peer => false,
            _ => {
                self.catch_up = Some(peer.to_string());
                true
            }
        }
    }

    /// Release leadership, if held by `peer`. Releasing when not the leader is a no-op.
    pub fn release_leader(&mut self, peer: &str) {
        if self.catch_up.as_deref() == Some(peer) {
            self.catch_up = None;
        }
    }

    /// Unconditionally clear the leader slot, regardless of who holds it — used by
    /// `connection_down` (distilled spec §4.C/§7), since a departing peer may still
    /// formally hold the slot when its connection drops.
    pub fn clear_leader(&mut self) {
        self.catch_up = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(height: Height, hash: u8, prev: u8) -> Header {
        Header {
            height,
            hash: crate::header::BlockHash([hash; 32]),
            prev_hash: crate::header::BlockHash([prev; 32]),
        }
    }

    #[test]
    fn empty_root_branch_connects_only_genesis() {
        let b = Branch::root();
        assert!(b.can_connect(&h(0, 1, 0), true));
        assert!(!b.can_connect(&h(1, 1, 0), true));
    }

    #[test]
    fn save_header_extends_and_rejects_gap() {
        let mut b = Branch::root();
        b.save_header(h(0, 1, 0)).unwrap();
        assert_eq!(b.local_height(), Some(0));
        assert!(b.save_header(h(2, 3, 1)).is_err());
        b.save_header(h(1, 2, 1)).unwrap();
        assert_eq!(b.local_height(), Some(1));
    }

    #[test]
    fn connect_chunk_all_or_nothing() {
        let mut b = Branch::root();
        let good = vec![h(0, 1, 0), h(1, 2, 1), h(2, 3, 2)];
        assert!(b.connect_chunk(0, &good));
        assert_eq!(b.local_height(), Some(2));

        let mut b2 = Branch::root();
        let bad = vec![h(0, 1, 0), h(1, 2, 1), h(2, 9, 9)]; // prev mismatch at index 2
        assert!(!b2.connect_chunk(0, &bad));
        assert_eq!(b2.local_height(), None);
    }

    #[test]
    fn leader_slot_is_single_writer() {
        let mut b = Branch::root();
        assert!(b.claim_leader("peerA"));
        assert!(!b.claim_leader("peerB"));
        assert!(b.claim_leader("peerA")); // re-claiming by the holder is fine
        b.release_leader("peerB"); // no-op, not the holder
        assert_eq!(b.leader(), Some("peerA"));
        b.release_leader("peerA");
        assert_eq!(b.leader(), None);
    }

    #[test]
    fn fork_produces_child_rooted_at_header_height() {
        let mut b = Branch::root();
        b.save_header(h(0, 1, 0)).unwrap();
        b.save_header(h(1, 2, 1)).unwrap();
        let forked = b.fork(h(1, 9, 1));
        assert_eq!(forked.checkpoint(), 1);
        assert_eq!(forked.parent(), Some(0));
        assert_eq!(forked.local_height(), Some(1));
    }

    #[test]
    fn reset_to_replaces_contents_and_checkpoint() {
        let mut b = Branch::root();
        b.save_header(h(0, 1, 0)).unwrap();
        b.reset_to(h(5, 9, 8));
        assert_eq!(b.checkpoint(), 5);
        assert_eq!(b.local_height(), Some(5));
    }
}
