// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Chain operations over a file allocation table, parameterised by the
//! index width, the on-disk endianness and the reserved index values.
//!
//! Every operation comes in two forms with identical semantics: one over an
//! in-memory mirror (a slice of indices) and one, suffixed `_at`, over a
//! [`DataStorage`] holding the raw table. Drivers keep a mirror and write
//! through to the store; `fsck`-style tooling works on the store alone.

use retrovfs_ds::DataStorage;
use retrovfs_err::{FatError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// An unsigned integer usable as a FAT cell.
pub trait FatIndex: Copy + Eq + Ord {
    /// Cell size on disk, in bytes.
    const ENTRY_SIZE: u64;

    fn to_u64(self) -> u64;

    /// Truncating conversion; callers only pass values that fit.
    fn from_u64(value: u64) -> Self;

    fn read_at<DS: DataStorage>(store: &DS, endianness: Endianness, addr: u64) -> Result<Self>;

    fn write_at<DS: DataStorage>(self, store: &DS, endianness: Endianness, addr: u64)
        -> Result<()>;
}

impl FatIndex for u16 {
    const ENTRY_SIZE: u64 = 2;

    fn to_u64(self) -> u64 {
        self as u64
    }

    fn from_u64(value: u64) -> Self {
        value as u16
    }

    fn read_at<DS: DataStorage>(store: &DS, endianness: Endianness, addr: u64) -> Result<Self> {
        let mut raw = [0; 2];
        store.read(addr, &mut raw).map_err(|_| FatError::Io)?;
        Ok(match endianness {
            Endianness::Little => u16::from_le_bytes(raw),
            Endianness::Big => u16::from_be_bytes(raw),
        })
    }

    fn write_at<DS: DataStorage>(
        self,
        store: &DS,
        endianness: Endianness,
        addr: u64,
    ) -> Result<()> {
        let raw = match endianness {
            Endianness::Little => self.to_le_bytes(),
            Endianness::Big => self.to_be_bytes(),
        };
        store.write(addr, &raw).map_err(|_| FatError::Io.into())
    }
}

impl FatIndex for u32 {
    const ENTRY_SIZE: u64 = 4;

    fn to_u64(self) -> u64 {
        self as u64
    }

    fn from_u64(value: u64) -> Self {
        value as u32
    }

    fn read_at<DS: DataStorage>(store: &DS, endianness: Endianness, addr: u64) -> Result<Self> {
        let mut raw = [0; 4];
        store.read(addr, &mut raw).map_err(|_| FatError::Io)?;
        Ok(match endianness {
            Endianness::Little => u32::from_le_bytes(raw),
            Endianness::Big => u32::from_be_bytes(raw),
        })
    }

    fn write_at<DS: DataStorage>(
        self,
        store: &DS,
        endianness: Endianness,
        addr: u64,
    ) -> Result<()> {
        let raw = match endianness {
            Endianness::Little => self.to_le_bytes(),
            Endianness::Big => self.to_be_bytes(),
        };
        store.write(addr, &raw).map_err(|_| FatError::Io.into())
    }
}

/// The fixed attributes of a FAT flavour.
#[derive(Debug, Clone, Copy)]
pub struct FatAttrs<I: FatIndex> {
    pub endianness: Endianness,
    pub free: I,
    pub data_min: I,
    pub data_max: I,
    pub end_of_chain: I,
    pub reserved: I,
}

impl<I: FatIndex> FatAttrs<I> {
    pub const fn new(
        endianness: Endianness,
        free: I,
        data_min: I,
        data_max: I,
        end_of_chain: I,
        reserved: I,
    ) -> Self {
        Self {
            endianness,
            free,
            data_min,
            data_max,
            end_of_chain,
            reserved,
        }
    }
}

/// Per-volume attributes: table length in cells and its base address on the
/// store.
#[derive(Debug, Clone, Copy, Default)]
pub struct FatDynAttrs<I: FatIndex> {
    pub length: I,
    pub base_addr: u64,
}

fn in_data_range<I: FatIndex>(attrs: &FatAttrs<I>, index: I) -> bool {
    index >= attrs.data_min && index <= attrs.data_max
}

fn cell_addr<I: FatIndex>(dyn_attrs: &FatDynAttrs<I>, index: I) -> u64 {
    dyn_attrs.base_addr + index.to_u64() * I::ENTRY_SIZE
}

/// Counts the cells holding the free marker in `[data_min, len)`.
pub fn count_free<I: FatIndex>(fat: &[I], attrs: &FatAttrs<I>, len: I) -> I {
    let mut count = 0;

    for i in attrs.data_min.to_u64()..len.to_u64() {
        if fat[i as usize] == attrs.free {
            count += 1;
        }
    }

    I::from_u64(count)
}

pub fn count_free_at<I: FatIndex, DS: DataStorage>(
    store: &DS,
    attrs: &FatAttrs<I>,
    dyn_attrs: &FatDynAttrs<I>,
) -> Result<I> {
    let mut count = 0;

    for i in attrs.data_min.to_u64()..dyn_attrs.length.to_u64() {
        let cell = I::read_at(store, attrs.endianness, cell_addr(dyn_attrs, I::from_u64(i)))?;
        if cell == attrs.free {
            count += 1;
        }
    }

    Ok(I::from_u64(count))
}

/// Walks at most `n` links from `start`, leaving in `start` the deepest
/// cell visited: the reached cluster on success, the terminator holder on
/// [`FatError::EndOfChain`].
pub fn get_nth<I: FatIndex>(
    fat: &[I],
    attrs: &FatAttrs<I>,
    len: I,
    start: &mut I,
    mut n: u64,
) -> Result<()> {
    if !in_data_range(attrs, *start) || *start >= len {
        return Err(FatError::BadStart.into());
    }

    while n > 0 {
        let next = fat[start.to_u64() as usize];
        if !in_data_range(attrs, next) {
            break;
        }
        if next >= len {
            return Err(FatError::ChainOob.into());
        }

        *start = next;
        n -= 1;
    }

    if n > 0 {
        return Err(FatError::EndOfChain.into());
    }

    Ok(())
}

pub fn get_nth_at<I: FatIndex, DS: DataStorage>(
    store: &DS,
    attrs: &FatAttrs<I>,
    dyn_attrs: &FatDynAttrs<I>,
    start: &mut I,
    mut n: u64,
) -> Result<()> {
    if !in_data_range(attrs, *start) || *start >= dyn_attrs.length {
        return Err(FatError::BadStart.into());
    }

    while n > 0 {
        let next = I::read_at(store, attrs.endianness, cell_addr(dyn_attrs, *start))?;
        if !in_data_range(attrs, next) {
            break;
        }
        if next >= dyn_attrs.length {
            return Err(FatError::ChainOob.into());
        }

        *start = next;
        n -= 1;
    }

    if n > 0 {
        return Err(FatError::EndOfChain.into());
    }

    Ok(())
}

/// Returns the cluster list from `start`, excluding the end-of-chain
/// marker.
pub fn follow<I: FatIndex>(fat: &[I], attrs: &FatAttrs<I>, len: I, start: I) -> Result<Vec<I>> {
    if !in_data_range(attrs, start) || start >= len {
        return Err(FatError::BadStart.into());
    }

    let mut chain = vec![start];

    loop {
        let next = fat[chain[chain.len() - 1].to_u64() as usize];
        if !in_data_range(attrs, next) {
            break;
        }

        // chain points OOB, likely corrupt
        if next >= len {
            return Err(FatError::ChainOob.into());
        }

        chain.push(next);
    }

    Ok(chain)
}

pub fn follow_at<I: FatIndex, DS: DataStorage>(
    store: &DS,
    attrs: &FatAttrs<I>,
    dyn_attrs: &FatDynAttrs<I>,
    start: I,
) -> Result<Vec<I>> {
    if !in_data_range(attrs, start) || start >= dyn_attrs.length {
        return Err(FatError::BadStart.into());
    }

    let mut chain = Vec::new();
    let mut cluster = start;

    loop {
        if cluster >= dyn_attrs.length {
            return Err(FatError::ChainOob.into());
        }

        chain.push(cluster);

        let next = I::read_at(store, attrs.endianness, cell_addr(dyn_attrs, cluster))?;
        if !in_data_range(attrs, next) {
            break;
        }

        cluster = next;
    }

    Ok(chain)
}

/// First free index in `[max(offset, data_min), len)`, or the end-of-chain
/// marker when none is left.
pub fn find_next_free<I: FatIndex>(fat: &[I], attrs: &FatAttrs<I>, len: I, offset: I) -> I {
    if !in_data_range(attrs, offset) {
        return attrs.end_of_chain;
    }

    for i in offset.to_u64()..len.to_u64() {
        if fat[i as usize] == attrs.free {
            return I::from_u64(i);
        }
    }

    attrs.end_of_chain
}

pub fn find_next_free_at<I: FatIndex, DS: DataStorage>(
    store: &DS,
    attrs: &FatAttrs<I>,
    dyn_attrs: &FatDynAttrs<I>,
    offset: I,
) -> Result<I> {
    if !in_data_range(attrs, offset) {
        return Ok(attrs.end_of_chain);
    }

    for i in offset.to_u64()..dyn_attrs.length.to_u64() {
        let cell = I::read_at(store, attrs.endianness, cell_addr(dyn_attrs, I::from_u64(i)))?;
        if cell == attrs.free {
            return Ok(I::from_u64(i));
        }
    }

    Ok(attrs.end_of_chain)
}

/// Appends free indices to `chain` until it holds `need` clusters. Does not
/// write the table.
pub fn find_free_chain<I: FatIndex>(
    fat: &[I],
    attrs: &FatAttrs<I>,
    len: I,
    need: u64,
    chain: &mut Vec<I>,
) -> Result<()> {
    if need < chain.len() as u64 {
        return Ok(()); //nothing to do, not an error
    }

    let missing = need - chain.len() as u64;
    let mut last = attrs.data_min;

    for _ in 0..missing {
        last = find_next_free(fat, attrs, len, last);

        if last == attrs.end_of_chain {
            return Err(FatError::NoFreeClusters.into());
        }

        chain.push(last);
        last = I::from_u64(last.to_u64() + 1);
    }

    Ok(())
}

pub fn find_free_chain_at<I: FatIndex, DS: DataStorage>(
    store: &DS,
    attrs: &FatAttrs<I>,
    dyn_attrs: &FatDynAttrs<I>,
    need: u64,
    chain: &mut Vec<I>,
) -> Result<()> {
    if need < chain.len() as u64 {
        return Ok(()); //nothing to do, not an error
    }

    let missing = need - chain.len() as u64;
    let mut last = attrs.data_min;

    for _ in 0..missing {
        last = find_next_free_at(store, attrs, dyn_attrs, last)?;

        if last == attrs.end_of_chain {
            return Err(FatError::NoFreeClusters.into());
        }

        chain.push(last);
        last = I::from_u64(last.to_u64() + 1);
    }

    Ok(())
}

fn check_chain_size<I: FatIndex>(attrs: &FatAttrs<I>, len: I, chain: &[I]) -> Result<()> {
    if chain.is_empty() {
        return Err(FatError::EmptyChain.into());
    }
    if chain.len() as u64 > len.to_u64() - attrs.data_min.to_u64() {
        return Err(FatError::ChainTooLarge.into());
    }

    Ok(())
}

/// Links `chain[i] -> chain[i + 1]` and terminates the last cluster.
pub fn write_chain<I: FatIndex>(
    fat: &mut [I],
    attrs: &FatAttrs<I>,
    len: I,
    chain: &[I],
) -> Result<()> {
    check_chain_size(attrs, len, chain)?;

    if !in_data_range(attrs, chain[0]) || chain[0] >= len {
        return Err(FatError::ChainOob.into());
    }

    for i in 0..chain.len() - 1 {
        // links stay within the data range, the terminator is added by hand
        if !in_data_range(attrs, chain[i + 1]) || chain[i + 1] >= len {
            return Err(FatError::ChainOob.into());
        }

        fat[chain[i].to_u64() as usize] = chain[i + 1];
    }

    fat[chain[chain.len() - 1].to_u64() as usize] = attrs.end_of_chain;

    Ok(())
}

pub fn write_chain_at<I: FatIndex, DS: DataStorage>(
    store: &DS,
    attrs: &FatAttrs<I>,
    dyn_attrs: &FatDynAttrs<I>,
    chain: &[I],
) -> Result<()> {
    check_chain_size(attrs, dyn_attrs.length, chain)?;

    if !in_data_range(attrs, chain[0]) || chain[0] >= dyn_attrs.length {
        return Err(FatError::ChainOob.into());
    }

    for i in 0..chain.len() - 1 {
        if !in_data_range(attrs, chain[i + 1]) || chain[i + 1] >= dyn_attrs.length {
            return Err(FatError::ChainOob.into());
        }

        chain[i + 1].write_at(store, attrs.endianness, cell_addr(dyn_attrs, chain[i]))?;
    }

    attrs.end_of_chain.write_at(
        store,
        attrs.endianness,
        cell_addr(dyn_attrs, chain[chain.len() - 1]),
    )?;

    Ok(())
}

/// Marks every cluster of `chain` free, last to first, so an interrupted
/// run never strands a tail whose head is already gone.
pub fn free_chain<I: FatIndex>(
    fat: &mut [I],
    attrs: &FatAttrs<I>,
    len: I,
    chain: &[I],
) -> Result<()> {
    check_chain_size(attrs, len, chain)?;

    for &cluster in chain.iter().rev() {
        if !in_data_range(attrs, cluster) || cluster >= len {
            return Err(FatError::ChainOob.into());
        }

        fat[cluster.to_u64() as usize] = attrs.free;
    }

    Ok(())
}

pub fn free_chain_at<I: FatIndex, DS: DataStorage>(
    store: &DS,
    attrs: &FatAttrs<I>,
    dyn_attrs: &FatDynAttrs<I>,
    chain: &[I],
) -> Result<()> {
    check_chain_size(attrs, dyn_attrs.length, chain)?;

    for &cluster in chain.iter().rev() {
        if !in_data_range(attrs, cluster) || cluster >= dyn_attrs.length {
            return Err(FatError::ChainOob.into());
        }

        attrs
            .free
            .write_at(store, attrs.endianness, cell_addr(dyn_attrs, cluster))?;
    }

    Ok(())
}

/// Frees `chain[keep..]` and terminates the chain at `chain[keep - 1]`.
/// No-op when the chain is already short enough.
pub fn shrink_chain<I: FatIndex>(
    fat: &mut [I],
    attrs: &FatAttrs<I>,
    len: I,
    chain: &[I],
    keep: usize,
) -> Result<()> {
    if chain.is_empty() || keep >= chain.len() {
        return Ok(());
    }

    free_chain(fat, attrs, len, &chain[keep..])?;

    if keep > 0 {
        let last = chain[keep - 1];
        if !in_data_range(attrs, last) || last >= len {
            return Err(FatError::ChainOob.into());
        }

        fat[last.to_u64() as usize] = attrs.end_of_chain;
    }

    Ok(())
}

pub fn shrink_chain_at<I: FatIndex, DS: DataStorage>(
    store: &DS,
    attrs: &FatAttrs<I>,
    dyn_attrs: &FatDynAttrs<I>,
    chain: &[I],
    keep: usize,
) -> Result<()> {
    if chain.is_empty() || keep >= chain.len() {
        return Ok(());
    }

    free_chain_at(store, attrs, dyn_attrs, &chain[keep..])?;

    if keep > 0 {
        let last = chain[keep - 1];
        if !in_data_range(attrs, last) || last >= dyn_attrs.length {
            return Err(FatError::ChainOob.into());
        }

        attrs
            .end_of_chain
            .write_at(store, attrs.endianness, cell_addr(dyn_attrs, last))?;
    }

    Ok(())
}

/// Writes `cur -> next` through to both the store and the mirror.
pub fn write_cluster<I: FatIndex, DS: DataStorage>(
    fat: &mut [I],
    store: &DS,
    attrs: &FatAttrs<I>,
    dyn_attrs: &FatDynAttrs<I>,
    cur: I,
    next: I,
) -> Result<()> {
    next.write_at(store, attrs.endianness, cell_addr(dyn_attrs, cur))?;
    fat[cur.to_u64() as usize] = next;

    Ok(())
}

/// Appends `next` after `cur` and terminates it, write-through.
pub fn extend_chain<I: FatIndex, DS: DataStorage>(
    fat: &mut [I],
    store: &DS,
    attrs: &FatAttrs<I>,
    dyn_attrs: &FatDynAttrs<I>,
    cur: I,
    next: I,
) -> Result<()> {
    if !in_data_range(attrs, cur) || cur >= dyn_attrs.length {
        return Err(FatError::BadStart.into());
    }
    if !in_data_range(attrs, next) || next >= dyn_attrs.length {
        return Err(FatError::BadNextCls.into());
    }

    write_cluster(fat, store, attrs, dyn_attrs, cur, next)?;
    write_cluster(fat, store, attrs, dyn_attrs, next, attrs.end_of_chain)?;

    Ok(())
}

/// Successor of `cur` if it has one; otherwise finds the next free cluster,
/// stores it in `dst` and reports [`FatError::Alloc`] so the caller knows
/// to allocate.
pub fn get_next_or_free<I: FatIndex>(
    fat: &[I],
    attrs: &FatAttrs<I>,
    len: I,
    cur: I,
    dst: &mut I,
) -> Result<()> {
    if !in_data_range(attrs, cur) || cur >= len {
        return Err(FatError::BadStart.into());
    }

    let next = fat[cur.to_u64() as usize];
    if in_data_range(attrs, next) {
        if next >= len {
            return Err(FatError::ChainOob.into());
        }

        *dst = next;
    } else {
        *dst = find_next_free(fat, attrs, len, attrs.data_min);

        return Err(FatError::Alloc.into());
    }

    Ok(())
}

pub fn get_next_or_free_at<I: FatIndex, DS: DataStorage>(
    store: &DS,
    attrs: &FatAttrs<I>,
    dyn_attrs: &FatDynAttrs<I>,
    cur: I,
    dst: &mut I,
) -> Result<()> {
    if !in_data_range(attrs, cur) || cur >= dyn_attrs.length {
        return Err(FatError::BadStart.into());
    }

    let next = I::read_at(store, attrs.endianness, cell_addr(dyn_attrs, cur))?;
    if in_data_range(attrs, next) {
        if next >= dyn_attrs.length {
            return Err(FatError::ChainOob.into());
        }

        *dst = next;
    } else {
        *dst = find_next_free_at(store, attrs, dyn_attrs, attrs.data_min)?;

        return Err(FatError::Alloc.into());
    }

    Ok(())
}

/// Reads the whole table from the store into a fresh mirror.
pub fn load_mirror<I: FatIndex, DS: DataStorage>(
    store: &DS,
    attrs: &FatAttrs<I>,
    dyn_attrs: &FatDynAttrs<I>,
) -> Result<Vec<I>> {
    let mut mirror = Vec::with_capacity(dyn_attrs.length.to_u64() as usize);

    for i in 0..dyn_attrs.length.to_u64() {
        mirror.push(I::read_at(
            store,
            attrs.endianness,
            cell_addr(dyn_attrs, I::from_u64(i)),
        )?);
    }

    Ok(mirror)
}

#[cfg(test)]
mod tests {
    use retrovfs_ds::MemStorage;
    use retrovfs_err::{Error, FatError};

    use super::*;

    const ATTRS: FatAttrs<u16> = FatAttrs::new(Endianness::Little, 0, 1, 0x7FFE, 0x7FFF, 0x8000);

    fn dyn_attrs(len: u16) -> FatDynAttrs<u16> {
        FatDynAttrs {
            length: len,
            base_addr: 0,
        }
    }

    fn store_from(fat: &[u16]) -> MemStorage {
        let mut raw = Vec::with_capacity(fat.len() * 2);
        for cell in fat {
            raw.extend_from_slice(&cell.to_le_bytes());
        }
        MemStorage::new(raw)
    }

    #[test]
    fn count_free_skips_reserved_zero() {
        let fat = [0x8000, 0, 2, 0x7FFF, 0, 0];
        assert_eq!(count_free(&fat, &ATTRS, 6), 4);

        let store = store_from(&fat);
        assert_eq!(count_free_at(&store, &ATTRS, &dyn_attrs(6)).unwrap(), 4);
    }

    #[test]
    fn get_nth_walks_links() {
        let fat = [0x8000, 3, 0x7FFF, 2, 0];

        let mut cluster = 1;
        get_nth(&fat, &ATTRS, 5, &mut cluster, 2).unwrap();
        assert_eq!(cluster, 2);

        let store = store_from(&fat);
        let mut cluster = 1;
        get_nth_at(&store, &ATTRS, &dyn_attrs(5), &mut cluster, 2).unwrap();
        assert_eq!(cluster, 2);
    }

    #[test]
    fn get_nth_reports_terminator_holder() {
        let fat = [0x8000, 3, 0x7FFF, 2, 0];

        let mut cluster = 1;
        assert_eq!(
            get_nth(&fat, &ATTRS, 5, &mut cluster, 5),
            Err(Error::Fat(FatError::EndOfChain))
        );
        assert_eq!(cluster, 2);
    }

    #[test]
    fn get_nth_rejects_bad_start() {
        let fat = [0x8000, 0x7FFF, 0, 0];

        let mut cluster = 0;
        assert_eq!(
            get_nth(&fat, &ATTRS, 4, &mut cluster, 1),
            Err(Error::Fat(FatError::BadStart))
        );

        let mut cluster = 9;
        assert_eq!(
            get_nth(&fat, &ATTRS, 4, &mut cluster, 1),
            Err(Error::Fat(FatError::BadStart))
        );
    }

    #[test]
    fn follow_excludes_terminator() {
        // 1 -> 4 -> 2 -> end
        let fat = [0x8000, 4, 0x7FFF, 0, 2, 0];
        assert_eq!(follow(&fat, &ATTRS, 6, 1).unwrap(), vec![1, 4, 2]);

        let store = store_from(&fat);
        assert_eq!(
            follow_at(&store, &ATTRS, &dyn_attrs(6), 1).unwrap(),
            vec![1, 4, 2]
        );
    }

    #[test]
    fn follow_detects_oob_links() {
        let fat = [0x8000, 9, 0, 0];
        assert_eq!(
            follow(&fat, &ATTRS, 4, 1),
            Err(Error::Fat(FatError::ChainOob))
        );
    }

    #[test]
    fn find_free_chain_collects_and_exhausts() {
        let fat = [0x8000, 0x7FFF, 0, 5, 0, 0x7FFF];

        let mut chain = Vec::new();
        find_free_chain(&fat, &ATTRS, 6, 2, &mut chain).unwrap();
        assert_eq!(chain, vec![2, 4]);

        let mut chain = Vec::new();
        assert_eq!(
            find_free_chain(&fat, &ATTRS, 6, 3, &mut chain),
            Err(Error::Fat(FatError::NoFreeClusters))
        );

        let store = store_from(&fat);
        let mut chain = Vec::new();
        find_free_chain_at(&store, &ATTRS, &dyn_attrs(6), 2, &mut chain).unwrap();
        assert_eq!(chain, vec![2, 4]);
    }

    #[test]
    fn write_then_follow_round_trips() {
        let mut fat = [0u16; 8];
        fat[0] = 0x8000;

        let chain = vec![3, 1, 5];
        write_chain(&mut fat, &ATTRS, 8, &chain).unwrap();
        assert_eq!(follow(&fat, &ATTRS, 8, 3).unwrap(), chain);

        let store = store_from(&[0x8000, 0, 0, 0, 0, 0, 0, 0]);
        write_chain_at(&store, &ATTRS, &dyn_attrs(8), &chain).unwrap();
        assert_eq!(follow_at(&store, &ATTRS, &dyn_attrs(8), 3).unwrap(), chain);
    }

    #[test]
    fn write_chain_rejects_empty_and_oversized() {
        let mut fat = [0u16; 4];
        assert_eq!(
            write_chain(&mut fat, &ATTRS, 4, &[]),
            Err(Error::Fat(FatError::EmptyChain))
        );
        assert_eq!(
            write_chain(&mut fat, &ATTRS, 4, &[1, 2, 3, 1]),
            Err(Error::Fat(FatError::ChainTooLarge))
        );
    }

    #[test]
    fn free_chain_clears_cells() {
        let mut fat = [0x8000, 2, 3, 0x7FFF, 0];
        free_chain(&mut fat, &ATTRS, 5, &[1, 2, 3]).unwrap();
        assert_eq!(fat, [0x8000, 0, 0, 0, 0]);
    }

    #[test]
    fn shrink_chain_keeps_prefix() {
        let mut fat = [0x8000, 2, 3, 0x7FFF, 0];
        shrink_chain(&mut fat, &ATTRS, 5, &[1, 2, 3], 1).unwrap();
        assert_eq!(fat, [0x8000, 0x7FFF, 0, 0, 0]);

        // keep >= len is a no-op
        let mut fat = [0x8000, 0x7FFF, 0, 0, 0];
        shrink_chain(&mut fat, &ATTRS, 5, &[1], 4).unwrap();
        assert_eq!(fat, [0x8000, 0x7FFF, 0, 0, 0]);
    }

    #[test]
    fn extend_chain_writes_through() {
        let store = store_from(&[0x8000, 0x7FFF, 0, 0]);
        let mut fat = [0x8000, 0x7FFF, 0, 0];

        extend_chain(&mut fat, &store, &ATTRS, &dyn_attrs(4), 1, 2).unwrap();
        assert_eq!(fat, [0x8000, 2, 0x7FFF, 0]);
        assert_eq!(load_mirror(&store, &ATTRS, &dyn_attrs(4)).unwrap(), fat);
    }

    #[test]
    fn get_next_or_free_signals_allocation() {
        let fat = [0x8000, 2, 0x7FFF, 0];

        let mut next = 0;
        get_next_or_free(&fat, &ATTRS, 4, 1, &mut next).unwrap();
        assert_eq!(next, 2);

        assert_eq!(
            get_next_or_free(&fat, &ATTRS, 4, 2, &mut next),
            Err(Error::Fat(FatError::Alloc))
        );
        assert_eq!(next, 3);

        let store = store_from(&fat);
        let mut next = 0;
        assert_eq!(
            get_next_or_free_at(&store, &ATTRS, &dyn_attrs(4), 2, &mut next),
            Err(Error::Fat(FatError::Alloc))
        );
        assert_eq!(next, 3);
    }

    #[test]
    fn mirror_and_store_forms_agree() {
        let fat = [0x8000u16, 3, 0x7FFF, 5, 0, 0x7FFF, 0, 0];
        let store = store_from(&fat);
        let dyn_attrs = dyn_attrs(8);

        assert_eq!(
            count_free(&fat, &ATTRS, 8),
            count_free_at(&store, &ATTRS, &dyn_attrs).unwrap()
        );
        assert_eq!(
            follow(&fat, &ATTRS, 8, 1).unwrap(),
            follow_at(&store, &ATTRS, &dyn_attrs, 1).unwrap()
        );
        assert_eq!(
            find_next_free(&fat, &ATTRS, 8, 1),
            find_next_free_at(&store, &ATTRS, &dyn_attrs, 1).unwrap()
        );
    }
}
