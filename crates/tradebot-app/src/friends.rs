// Friends-list bookkeeping.

use std::collections::HashSet;

use tradebot_core::protocol::{FriendEntry, FriendRelationship, SteamId};

/// Result of applying one friends-list entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FriendChange {
    /// Newly tracked. `accept_invite` is set for pending invitations.
    Added { accept_invite: bool },
    Removed,
    Unchanged,
}

/// Peers the bot is friends with or has a pending invitation from.
#[derive(Debug, Default)]
pub struct FriendSet {
    members: HashSet<SteamId>,
}

impl FriendSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, entry: &FriendEntry) -> FriendChange {
        let tracked = self.members.contains(&entry.steam_id);
        match entry.relationship {
            FriendRelationship::None | FriendRelationship::Blocked | FriendRelationship::Ignored => {
                if tracked && self.members.remove(&entry.steam_id) {
                    FriendChange::Removed
                } else {
                    FriendChange::Unchanged
                }
            }
            FriendRelationship::PendingInvitee
            | FriendRelationship::RequestInitiator
            | FriendRelationship::Friend => {
                if tracked {
                    FriendChange::Unchanged
                } else {
                    self.members.insert(entry.steam_id);
                    FriendChange::Added {
                        accept_invite: entry.relationship == FriendRelationship::PendingInvitee,
                    }
                }
            }
        }
    }

    pub fn contains(&self, id: SteamId) -> bool {
        self.members.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
