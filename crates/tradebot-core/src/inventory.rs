// Inventory and item-schema snapshots.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::protocol::SteamId;

/// One item in a backpack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryItem {
    pub id: u64,
    #[serde(default)]
    pub original_id: u64,
    pub defindex: u32,
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub quality: u32,
}

/// Snapshot of a user's backpack at fetch time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub owner: Option<SteamId>,
    pub items: Vec<InventoryItem>,
}

impl Inventory {
    pub fn new(owner: SteamId, items: Vec<InventoryItem>) -> Self {
        Self {
            owner: Some(owner),
            items,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn find(&self, id: u64) -> Option<&InventoryItem> {
        self.items.iter().find(|item| item.id == id)
    }

    /// All items with the given definition index.
    pub fn items_with_defindex(&self, defindex: u32) -> impl Iterator<Item = &InventoryItem> {
        self.items.iter().filter(move |item| item.defindex == defindex)
    }
}

/// Outcome of a successful inventory request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventoryFetch {
    Available(Inventory),
    /// The owner's backpack is private or otherwise access-restricted.
    Restricted,
}

/// Item definitions, fetched once per process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSchema {
    pub items: HashMap<u32, SchemaItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaItem {
    pub defindex: u32,
    pub name: String,
}

impl ItemSchema {
    pub fn from_items(items: impl IntoIterator<Item = SchemaItem>) -> Self {
        Self {
            items: items.into_iter().map(|i| (i.defindex, i)).collect(),
        }
    }

    pub fn name_of(&self, defindex: u32) -> Option<&str> {
        self.items.get(&defindex).map(|i| i.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
