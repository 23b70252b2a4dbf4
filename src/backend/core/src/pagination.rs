//! Limit/offset pagination for the read API.

use serde::{Deserialize, Serialize};

/// Requested page, before clamping.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PageRequest {
    pub limit: Option<u32>,
    pub offset: Option<u64>,
}

impl PageRequest {
    /// Apply defaults and clamp the limit to the configured maximum. A
    /// limit of zero is treated as the default rather than an empty page.
    pub fn clamp(&self, default_limit: u32, max_limit: u32) -> (u32, u64) {
        let limit = match self.limit {
            None | Some(0) => default_limit,
            Some(limit) => limit.min(max_limit),
        };
        (limit, self.offset.unwrap_or(0))
    }
}

/// Page envelope returned alongside results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageMeta {
    pub total: u64,
    pub limit: u32,
    pub offset: u64,
    pub has_more: bool,
}

impl PageMeta {
    pub fn new(total: u64, limit: u32, offset: u64, returned: usize) -> Self {
        Self {
            total,
            limit,
            offset,
            has_more: offset + (returned as u64) < total,
        }
    }
}
