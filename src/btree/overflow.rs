//! Overflow chains: payload bytes that do not fit in a cell live on a list
//! of pages, each starting with the page number of the next one.

use crate::common::{LodeError, PageNumber, Result};
use crate::pager::Pager;
use crate::storage::page::CellInfo;

const NEXT_POINTER_SIZE: usize = 4;

fn chunk_size(pager: &Pager) -> usize {
    pager.usable_size() - NEXT_POINTER_SIZE
}

/// Writes `spill` to a new overflow chain and returns its first page.
pub(super) fn write_chain(pager: &Pager, spill: &[u8]) -> Result<Option<PageNumber>> {
    if spill.is_empty() {
        return Ok(None);
    }
    let chunks = spill.chunks(chunk_size(pager)).collect::<Vec<_>>();
    let pages = chunks
        .iter()
        .map(|_| pager.allocate_page())
        .collect::<Result<Vec<_>>>()?;

    for (i, chunk) in chunks.iter().enumerate() {
        let next = pages.get(i + 1).map_or(0, |p| p.as_u32());
        let mut page = pager.page_mut(pages[i])?;
        let mut data = page.data_mut();
        data[..NEXT_POINTER_SIZE].copy_from_slice(&next.to_be_bytes());
        data[NEXT_POINTER_SIZE..NEXT_POINTER_SIZE + chunk.len()].copy_from_slice(chunk);
    }
    Ok(pages.first().copied())
}

/// Pages of the chain starting at `first` that holds `len` bytes.
pub(super) fn chain_pages(pager: &Pager, first: PageNumber, len: u64) -> Result<Vec<PageNumber>> {
    let chunk = chunk_size(pager) as u64;
    let expected = len.div_ceil(chunk) as usize;
    let mut pages = Vec::with_capacity(expected);
    let mut next = first.as_u32();

    while pages.len() < expected {
        if next == 0 {
            return Err(LodeError::corrupt(format!(
                "overflow chain from page {} ends after {} of {expected} pages",
                first.as_u32(),
                pages.len()
            )));
        }
        let pgno = PageNumber::new(next);
        let page = pager.read_page(pgno)?;
        let data = page.data();
        next = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        pages.push(pgno);
    }
    if next != 0 {
        return Err(LodeError::corrupt(format!(
            "overflow chain from page {} is longer than its payload",
            first.as_u32()
        )));
    }
    Ok(pages)
}

/// Returns the whole payload of a cell, following its overflow chain.
pub(super) fn read_payload(pager: &Pager, cell: &[u8], info: &CellInfo) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(info.payload_len as usize);
    payload.extend_from_slice(&cell[info.local.clone()]);
    let Some(first) = info.overflow else {
        return Ok(payload);
    };

    let chunk = chunk_size(pager);
    for pgno in chain_pages(pager, first, info.payload_len - info.local.len() as u64)? {
        let page = pager.read_page(pgno)?;
        let data = page.data();
        let take = (info.payload_len as usize - payload.len()).min(chunk);
        payload.extend_from_slice(&data[NEXT_POINTER_SIZE..NEXT_POINTER_SIZE + take]);
    }
    Ok(payload)
}

/// Returns every page of a cell's overflow chain to the freelist.
pub(super) fn free_chain(pager: &Pager, info: &CellInfo) -> Result<()> {
    let Some(first) = info.overflow else {
        return Ok(());
    };
    for pgno in chain_pages(pager, first, info.payload_len - info.local.len() as u64)? {
        pager.free_page(pgno)?;
    }
    Ok(())
}
