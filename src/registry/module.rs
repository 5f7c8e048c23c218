use crossbeam::sync::ShardedLock;
use serde::{Deserialize, Serialize};

use crate::{serialize::serde_hex, Address};

/// A loaded image and the address range `[base, end)` it occupies
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleImage {
    pub name: String,
    #[serde(with = "serde_hex")]
    pub base: Address,
    #[serde(with = "serde_hex")]
    pub end: Address,
}

impl ModuleImage {
    pub fn contains(&self, address: Address) -> bool {
        self.base <= address && address < self.end
    }
}

/// Append-only list of images reported by the host. Lookups vastly outnumber
/// loads, hence the reader-biased lock.
#[derive(Default)]
pub struct ModuleRegistry {
    images: ShardedLock<Vec<ModuleImage>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_image_load(&self, name: &str, base: Address, end: Address) -> ModuleImage {
        let image = ModuleImage {
            name: name.to_owned(),
            base,
            end,
        };
        self.images
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(image.clone());
        image
    }

    /// The first recorded image whose range contains `address`
    pub fn find_owner(&self, address: Address) -> Option<ModuleImage> {
        self.images
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|image| image.contains(address))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.images.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
