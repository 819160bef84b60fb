use bytes::{Buf, BufMut};

use crate::common::{LodeError, PageNumber, Result};

/// A freelist trunk page: next trunk, leaf count, then leaf page numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreelistTrunk {
    pub next: Option<PageNumber>,
    pub leaves: Vec<PageNumber>,
}

impl FreelistTrunk {
    /// Most leaves a trunk may legally hold.
    pub fn max_leaves(usable: usize) -> usize {
        usable / 4 - 2
    }

    /// Leaves this engine stores per trunk before starting a new one.
    pub fn leaf_capacity(usable: usize) -> usize {
        usable / 4 - 8
    }

    pub fn decode(data: &[u8], usable: usize) -> Result<Self> {
        let mut buf = &data[..usable];
        let next = buf.get_u32();
        let count = buf.get_u32() as usize;
        if count > Self::max_leaves(usable) {
            return Err(LodeError::corrupt(format!(
                "freelist trunk claims {count} leaves"
            )));
        }
        let leaves = (0..count)
            .map(|_| PageNumber::new(buf.get_u32()))
            .collect::<Vec<_>>();
        if leaves.iter().any(|pgno| !pgno.is_valid()) {
            return Err(LodeError::corrupt("freelist leaf page number 0"));
        }
        Ok(Self {
            next: (next != 0).then_some(PageNumber::new(next)),
            leaves,
        })
    }

    pub fn encode(&self, data: &mut [u8]) {
        let mut buf = &mut data[..];
        buf.put_u32(self.next.map_or(0, |p| p.as_u32()));
        buf.put_u32(self.leaves.len() as u32);
        for leaf in &self.leaves {
            buf.put_u32(leaf.as_u32());
        }
    }
}
