// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use super::*;
use md5::{Digest, Md5};

// 40 MD5 digests per node, 4 ring points per digest
const HASHES_PER_NODE: usize = 40;
const POINTS_PER_HASH: usize = 4;

/// Consistent hashing on a 32-bit ring. Each node contributes 160
/// virtual points derived from the MD5 of `"endpoint-i"`; a key lands on
/// the first point at or after its own MD5-derived hash, wrapping at the
/// end of the ring. Replicas walk forward, skipping nodes that are
/// already chosen. The ring is built once from the node set.
pub struct Ketama {
    ring: Vec<(u32, usize)>,
    nodes: Vec<Arc<Node>>,
}

impl Ketama {
    pub fn new(nodes: Vec<Arc<Node>>) -> Self {
        let mut ring = Vec::with_capacity(nodes.len() * HASHES_PER_NODE * POINTS_PER_HASH);

        for (index, node) in nodes.iter().enumerate() {
            let name = node.endpoint().to_string();
            for i in 0..HASHES_PER_NODE {
                let digest = Md5::digest(format!("{name}-{i}").as_bytes());
                for point in 0..POINTS_PER_HASH {
                    let offset = point * 4;
                    let value = u32::from_le_bytes([
                        digest[offset],
                        digest[offset + 1],
                        digest[offset + 2],
                        digest[offset + 3],
                    ]);
                    ring.push((value, index));
                }
            }
        }

        ring.sort_unstable();

        Self { ring, nodes }
    }

    fn key_hash(key: &[u8]) -> u32 {
        let digest = Md5::digest(key);
        u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
    }
}

impl Locator for Ketama {
    fn locate(&self, request: &Arc<dyn Request>) -> Vec<Arc<Node>> {
        if self.ring.is_empty() {
            return Vec::new();
        }

        let wanted = request.replicas() as usize + 1;
        let hash = Self::key_hash(request.key());

        // first point at or after the key hash, wrapping at the end
        let start = self.ring.partition_point(|(point, _)| *point < hash) % self.ring.len();

        let mut chosen: Vec<usize> = Vec::new();
        let mut located = Vec::new();
        for offset in 0..self.ring.len() {
            let (_, index) = self.ring[(start + offset) % self.ring.len()];
            if chosen.contains(&index) {
                continue;
            }
            chosen.push(index);
            located.push(self.nodes[index].clone());
            if located.len() == wanted || chosen.len() == self.nodes.len() {
                break;
            }
        }

        located
    }
}
