//! Owns every [`Branch`] and resolves heights/headers across parent links, implementing
//! the global chain operations the synchronizer needs: which branch (if any) a header
//! belongs to or extends, forking, and picking the current branch.
use std::collections::HashMap;

use hsync_types::network::Height;

use crate::branch::Branch;
use crate::header::Header;

/// All known branches, keyed by checkpoint height.
#[derive(Debug, Clone)]
pub struct Registry {
    branches: HashMap<Height, Branch>,
}

impl Default for Registry {
    fn default() -> Self {
        let mut branches = HashMap::new();
        branches.insert(0, Branch::root());
        Self { branches }
    }
}

impl Registry {
    /// A fresh registry containing only the empty root branch.
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh registry whose root branch is pre-sized for `checkpoints` worth of
    /// headers (SPEC_FULL.md §3 supplemented feature 7: mirrors the original's
    /// header-file pre-allocation without claiming to be a real disk format).
    pub fn preallocate(checkpoints: usize) -> Self {
        let mut branches = HashMap::new();
        branches.insert(0, Branch::root_preallocated(checkpoints));
        Self { branches }
    }

    /// Look up a branch by its checkpoint key.
    pub fn branch(&self, checkpoint: Height) -> Option<&Branch> {
        self.branches.get(&checkpoint)
    }

    /// Mutably look up a branch by its checkpoint key.
    pub fn branch_mut(&mut self, checkpoint: Height) -> Option<&mut Branch> {
        self.branches.get_mut(&checkpoint)
    }

    /// Iterate every branch's checkpoint key.
    pub fn checkpoints(&self) -> impl Iterator<Item = Height> + '_ {
        self.branches.keys().copied()
    }

    /// Resolve the header at `height` by walking up `branch`'s parent chain as needed.
    pub fn read_header(&self, branch: Height, height: Height) -> Option<&Header> {
        let mut current = self.branches.get(&branch)?;
        loop {
            if let Some(header) = current.get_local(height) {
                return Some(header);
            }
            let parent = current.parent()?;
            current = self.branches.get(&parent)?;
        }
    }

    /// The tip height of `branch` itself (not an ancestor) - its own local height if
    /// it has saved anything, falling back to its parent's tip otherwise.
    pub fn height(&self, branch: Height) -> Option<Height> {
        let mut current = self.branches.get(&branch)?;
        loop {
            if let Some(height) = current.local_height() {
                return Some(height);
            }
            current = self.branches.get(&current.parent()?)?;
        }
    }

    /// Does any branch already have exactly `header` at its height?
    pub fn check_header(&self, header: &Header) -> Option<Height> {
        self.branches
            .iter()
            .find(|(_, b)| b.check_header_local(header))
            .map(|(checkpoint, _)| *checkpoint)
    }

    /// Which branch (if any) could accept `header` as its very next local header?
    pub fn can_connect(&self, header: &Header, check_height: bool) -> Option<Height> {
        self.branches
            .iter()
            .find(|(_, b)| b.can_connect(header, check_height))
            .map(|(checkpoint, _)| *checkpoint)
    }

    /// Fork `branch` at `header`, inserting the new branch into the registry and
    /// returning its checkpoint key.
    pub fn fork(&mut self, branch: Height, header: Header) -> Option<Height> {
        let parent = self.branches.get(&branch)?;
        let child = parent.fork(header);
        let key = child.checkpoint();
        self.branches.insert(key, child);
        Some(key)
    }

    /// Save `header` onto `branch` in place.
    pub fn save_header(&mut self, branch: Height, header: Header) -> Result<(), crate::branch::Error> {
        self.branches
            .get_mut(&branch)
            .ok_or(crate::branch::Error::DoesNotConnect(header.height))?
            .save_header(header)
    }

    /// Reset `branch` to a single new header at a different checkpoint, used when a
    /// checkpoint conflict invalidates everything previously stored on it.
    pub fn reset_branch(&mut self, branch: Height, header: Header) {
        if let Some(b) = self.branches.get_mut(&branch) {
            b.reset_to(header);
        } else {
            self.branches.insert(branch, {
                let mut fresh = Branch::root();
                fresh.reset_to(header);
                fresh
            });
        }
    }

    /// Pick the branch a freshly-started engine should resume on
    /// (SPEC_FULL.md §11: a live peer's attached branch takes precedence over a stale
    /// persisted index, since the latter may point at a branch pruned or superseded
    /// since the last run).
    pub fn current(&self, persisted_index: Height, main_peer_branch: Option<Height>) -> Height {
        match main_peer_branch {
            Some(checkpoint) if self.branches.contains_key(&checkpoint) => checkpoint,
            _ if self.branches.contains_key(&persisted_index) => persisted_index,
            _ => 0,
        }
    }

    /// Group peer descriptors by the branch checkpoint they're attached to, for
    /// `get_blockchains()` (SPEC_FULL.md supplemented feature).
    pub fn peers_by_branch<'a>(
        &self,
        attachments: impl Iterator<Item = (&'a str, Height)>,
    ) -> HashMap<Height, Vec<&'a str>> {
        let mut grouped: HashMap<Height, Vec<&'a str>> = HashMap::new();
        for (peer, branch) in attachments {
            if self.branches.contains_key(&branch) {
                grouped.entry(branch).or_default().push(peer);
            }
        }
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::BlockHash;

    fn h(height: Height, hash: u8, prev: u8) -> Header {
        Header {
            height,
            hash: BlockHash([hash; 32]),
            prev_hash: BlockHash([prev; 32]),
        }
    }

    #[test]
    fn save_and_read_through_root() {
        let mut r = Registry::new();
        r.save_header(0, h(0, 1, 0)).unwrap();
        r.save_header(0, h(1, 2, 1)).unwrap();
        assert_eq!(r.read_header(0, 0), Some(&h(0, 1, 0)));
        assert_eq!(r.read_header(0, 1), Some(&h(1, 2, 1)));
    }

    #[test]
    fn fork_resolves_parent_prefix() {
        let mut r = Registry::new();
        r.save_header(0, h(0, 1, 0)).unwrap();
        r.save_header(0, h(1, 2, 1)).unwrap();
        r.save_header(0, h(2, 3, 2)).unwrap();

        let forked = r.fork(0, h(2, 9, 2)).unwrap();
        assert_eq!(forked, 2);
        // height 0 and 1 still resolve via the parent
        assert_eq!(r.read_header(forked, 0), Some(&h(0, 1, 0)));
        assert_eq!(r.read_header(forked, 1), Some(&h(1, 2, 1)));
        // height 2 resolves on the fork itself, distinct from the parent's
        assert_eq!(r.read_header(forked, 2), Some(&h(2, 9, 2)));
        assert_eq!(r.read_header(0, 2), Some(&h(2, 3, 2)));
    }

    #[test]
    fn check_header_finds_owning_branch() {
        let mut r = Registry::new();
        r.save_header(0, h(0, 1, 0)).unwrap();
        assert_eq!(r.check_header(&h(0, 1, 0)), Some(0));
        assert_eq!(r.check_header(&h(0, 9, 0)), None);
    }

    #[test]
    fn current_prefers_live_peer_branch_over_persisted_index() {
        let mut r = Registry::new();
        r.fork(0, h(5, 1, 0));
        assert_eq!(r.current(0, Some(5)), 5);
        assert_eq!(r.current(0, None), 0);
        assert_eq!(r.current(5, Some(99)), 0); // neither exists, falls back to root
    }

    #[test]
    fn preallocate_yields_a_usable_empty_root_branch() {
        let mut r = Registry::preallocate(5);
        assert_eq!(r.height(0), None);
        r.save_header(0, h(0, 1, 0)).unwrap();
        assert_eq!(r.height(0), Some(0));
    }
}
