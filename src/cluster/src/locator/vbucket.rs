// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use super::*;
use crate::hash::bucket_hash;
use std::io::{Error, ErrorKind};

/// The bucket-to-node assignment supplied with the cluster topology.
/// Each row lists the primary node index followed by up to `R` replica
/// indices; `-1` marks an unassigned slot.
#[derive(Clone, Debug)]
pub struct VBucketMap {
    buckets: Vec<Vec<i32>>,
}

impl VBucketMap {
    pub fn new(buckets: Vec<Vec<i32>>) -> Result<Self, Error> {
        if buckets.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "vbucket map has no buckets",
            ));
        }

        Ok(Self { buckets })
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn entry(&self, bucket: usize) -> &[i32] {
        &self.buckets[bucket]
    }
}

/// Partition-aware location. The key hashes to a bucket, the bucket id
/// is written back into the request (servers reject requests whose
/// embedded vbucket does not match their ownership), and the bucket row
/// supplies the primary plus replicas in order.
pub struct VBucketServerMap {
    nodes: Vec<Arc<Node>>,
    map: VBucketMap,
}

impl VBucketServerMap {
    pub fn new(nodes: Vec<Arc<Node>>, map: VBucketMap) -> Self {
        Self { nodes, map }
    }
}

impl Locator for VBucketServerMap {
    fn locate(&self, request: &Arc<dyn Request>) -> Vec<Arc<Node>> {
        let bucket = bucket_hash(request.key()) as usize % self.map.bucket_count();
        request.set_vbucket(bucket as u16);

        let wanted = request.replicas() as usize + 1;
        self.map
            .entry(bucket)
            .iter()
            .filter(|index| **index >= 0)
            .filter_map(|index| self.nodes.get(*index as usize).cloned())
            .take(wanted)
            .collect()
    }
}
