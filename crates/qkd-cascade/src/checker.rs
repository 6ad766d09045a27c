//! # Parity Checker
//!
//! One checker per cascade pass. It owns the pass's bit permutation, a
//! prefix array of partial parity sums over the permuted key, the ordered
//! partition of `[0, n)` into parity blocks, and the subset of blocks
//! currently known to hold odd differential parity.
//!
//! Two exchanges are implemented here as frame-level operations (the frame
//! owns the checkers and carries the traffic counters):
//!
//! - parity calculation over a set of blocks, comparing with the peer
//! - binary-search correction of the odd blocks, smallest first
//!
//! Notifications keep all passes coherent: a correction discovered in pass
//! k flips the differential parity of the containing block in every other
//! pass, exposing fresh odd blocks there.

use crate::category::Category;
use crate::errors::CascadeError;
use crate::frame::Frame;
use crate::transport::CascadeChannel;
use shared_types::BitBuffer;
use std::collections::{BTreeMap, BTreeSet};

/// A parity block in permuted bit space, keyed by its offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParityBlock {
    pub size: u64,
    /// Current differential parity between the two endpoints.
    pub diffparity: bool,
}

/// Working entry during a parity calculation round.
#[derive(Debug, Clone, Copy)]
struct CalcBlock {
    offset: u64,
    size: u64,
    /// True if this block's parity must be compared with the peer.
    exchange: bool,
    diffparity: bool,
}

/// Parity bookkeeping for a single cascade pass.
pub struct ParityChecker {
    pub(crate) perm: Vec<u64>,
    pub(crate) inv_perm: Vec<u64>,
    /// Prefix XOR of the permuted key at initialisation: n+1 bits,
    /// `s[0] = 0`, `s[i+1] = s[i] ^ bit(inv_perm[i])`.
    partial_parity_sums: BitBuffer,
    /// Permuted positions changed since initialisation.
    changed_bits: BTreeSet<u64>,
    /// Permuted positions known correct.
    correct_bits: BTreeSet<u64>,
    /// Ordered partition of the permuted bit range.
    blocks: BTreeMap<u64, ParityBlock>,
    /// Odd-parity blocks as (size, offset), smallest first.
    odd_blocks: BTreeSet<(u64, u64)>,
}

impl ParityChecker {
    /// Build the checker's parity state for a frame.
    ///
    /// Computes the partial parity sums along the inverse permutation and
    /// carries over the frame's already-proven correct bits into permuted
    /// space. Block partitioning and the first exchange happen in
    /// [`Frame::add_checker`].
    pub(crate) fn new(
        frame: &Frame,
        perm: Vec<u64>,
        inv_perm: Vec<u64>,
    ) -> Result<Self, CascadeError> {
        let bits = frame.num_bits();

        let mut sums = BitBuffer::new(((bits + 1) as usize + 7) / 8);
        let mut running = false;
        for i in 0..bits {
            running ^= frame.key.data.get_bit(inv_perm[i as usize])?;
            sums.set_bit(i + 1, running)?;
        }

        let mut correct_bits = BTreeSet::new();
        for &pos in &frame.correct_bits {
            correct_bits.insert(perm[pos as usize]);
        }

        Ok(Self {
            perm,
            inv_perm,
            partial_parity_sums: sums,
            changed_bits: BTreeSet::new(),
            correct_bits,
            blocks: BTreeMap::new(),
            odd_blocks: BTreeSet::new(),
        })
    }

    /// Blocks currently known odd, ordered by (size, offset).
    pub fn odd_blocks(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.odd_blocks.iter().copied()
    }

    pub fn has_odd_blocks(&self) -> bool {
        !self.odd_blocks.is_empty()
    }

    /// Number of proven-correct bits inside `[offset, offset+size)`.
    fn count_correct_in(&self, offset: u64, size: u64) -> u64 {
        self.correct_bits.range(offset..offset + size).count() as u64
    }

    /// Block parity at initialisation corrected by the parity of the count
    /// of changed bits falling inside the block.
    fn block_parity(&self, offset: u64, size: u64) -> Result<bool, CascadeError> {
        let base = self.partial_parity_sums.get_bit(offset + size)?
            ^ self.partial_parity_sums.get_bit(offset)?;
        let changed = self.changed_bits.range(offset..offset + size).count();
        Ok(base ^ (changed % 2 == 1))
    }

    /// A local bit changed: track it and flip the containing block.
    pub(crate) fn notify_bit_change_local(&mut self, pos: u64) -> Result<(), CascadeError> {
        self.notify_bit_change_remote(pos)?;
        self.changed_bits.insert(self.perm[pos as usize]);
        Ok(())
    }

    /// A bit changed (here or at the peer): flip the differential parity of
    /// the containing parity block and move it into or out of the odd set.
    pub(crate) fn notify_bit_change_remote(&mut self, pos: u64) -> Result<(), CascadeError> {
        let p = self.perm[pos as usize];

        let (&offset, block) =
            self.blocks
                .range_mut(..=p)
                .next_back()
                .ok_or(CascadeError::Protocol(format!(
                    "no parity block at or below permuted position {p}"
                )))?;
        if p >= offset + block.size {
            return Err(CascadeError::Protocol(format!(
                "parity block lookup failed for permuted position {p}"
            )));
        }

        block.diffparity = !block.diffparity;
        let entry = (block.size, offset);
        if block.diffparity {
            self.odd_blocks.insert(entry);
        } else if !self.odd_blocks.remove(&entry) {
            return Err(CascadeError::Protocol(format!(
                "odd parity block ({}, {offset}) missing on removal",
                block.size
            )));
        }
        Ok(())
    }

    /// A bit was proven correct: record it in permuted space.
    pub(crate) fn notify_correct_bit(&mut self, pos: u64) {
        self.correct_bits.insert(self.perm[pos as usize]);
    }
}

impl Frame {
    /// Register the checker for a new pass and run its first parity
    /// exchange over `categories`.
    ///
    /// Returns the index of the new checker. Any block whose differential
    /// parity comes back odd is queued for correction.
    pub fn add_checker<C: CascadeChannel>(
        &mut self,
        perm: Vec<u64>,
        inv_perm: Vec<u64>,
        categories: &[Category],
        chan: &mut C,
    ) -> Result<usize, CascadeError> {
        let checker = ParityChecker::new(self, perm, inv_perm)?;
        self.checkers.push(checker);
        let idx = self.checkers.len() - 1;

        let mut category_offset = 0u64;
        for category in categories {
            let mut calc: Vec<CalcBlock> = Vec::with_capacity(category.block_count() as usize);
            for i in 0..category.block_count() {
                let offset = category_offset + i * category.k;
                // the last block absorbs the remainder
                let size = category.k.min(category.size - i * category.k);
                calc.push(CalcBlock {
                    offset,
                    size,
                    exchange: false,
                    diffparity: false,
                });
            }

            self.calculate_block_diffparities(idx, &mut calc, category.diffparity_must_be_even, chan)?;

            let checker = &mut self.checkers[idx];
            for b in &calc {
                checker.blocks.insert(
                    b.offset,
                    ParityBlock {
                        size: b.size,
                        diffparity: b.diffparity,
                    },
                );
                if b.diffparity {
                    checker.odd_blocks.insert((b.size, b.offset));
                }
            }
            category_offset += category.size;
        }

        Ok(idx)
    }

    /// Compute the differential parities of `blocks` against the peer.
    ///
    /// Blocks made up entirely of proven-correct bits need no exchange and
    /// get parity 0 locally. If the total differential parity across the
    /// blocks must be even, one parity fewer is transmitted and the last
    /// one is recovered as the XOR of the others. A size-1 block that comes
    /// back even proves its bit correct.
    fn calculate_block_diffparities<C: CascadeChannel>(
        &mut self,
        idx: usize,
        blocks: &mut [CalcBlock],
        total_must_be_even: bool,
        chan: &mut C,
    ) -> Result<(), CascadeError> {
        let bits = self.num_bits();

        let mut exchange_count = 0usize;
        {
            let checker = &self.checkers[idx];
            for b in blocks.iter_mut() {
                if b.offset + b.size > bits {
                    return Err(CascadeError::BlockOutOfRange {
                        offset: b.offset,
                        size: b.size,
                        bits,
                    });
                }
                if checker.count_correct_in(b.offset, b.size) == b.size {
                    b.exchange = false;
                    b.diffparity = false;
                } else {
                    b.exchange = true;
                    exchange_count += 1;
                }
            }
        }
        if exchange_count == 0 {
            return Ok(());
        }

        // with a fixed even total the final parity is redundant
        let send_count = if total_must_be_even {
            exchange_count - 1
        } else {
            exchange_count
        };

        let mut diff: Vec<u8> = Vec::new();
        if send_count > 0 {
            let mut local: Vec<u8> = Vec::with_capacity(send_count);
            {
                let checker = &self.checkers[idx];
                for b in blocks.iter() {
                    if local.len() >= send_count {
                        break;
                    }
                    if !b.exchange {
                        continue;
                    }
                    local.push(checker.block_parity(b.offset, b.size)? as u8);
                }
            }
            self.add_transmitted_parities(local.len() as u64);

            chan.send(local.clone())?;
            let remote = chan.recv()?;
            if remote.len() != local.len() {
                return Err(CascadeError::Protocol(format!(
                    "parity exchange size mismatch: sent {}, received {}",
                    local.len(),
                    remote.len()
                )));
            }
            diff = local
                .iter()
                .zip(remote.iter())
                .map(|(a, b)| a ^ b)
                .collect();

            self.add_transmitted_messages(1);
        }

        let mut parity_sum = false;
        let mut j = 0usize;
        let mut newly_correct: Vec<u64> = Vec::new();
        {
            let checker = &self.checkers[idx];
            for b in blocks.iter_mut() {
                if !b.exchange {
                    continue;
                }
                if j < send_count {
                    b.diffparity = diff[j] != 0;
                    parity_sum ^= b.diffparity;
                    j += 1;
                } else {
                    // the untransmitted parity closes the even total
                    b.diffparity = parity_sum;
                }
                if !b.diffparity && b.size == 1 && !checker.correct_bits.contains(&b.offset) {
                    newly_correct.push(checker.inv_perm[b.offset as usize]);
                }
            }
        }
        for pos in newly_correct {
            self.notify_correct_bit(pos)?;
        }
        Ok(())
    }

    /// Binary-search the given checker's odd blocks down to single-bit
    /// errors, smallest blocks first.
    ///
    /// Bob flips each located error; Alice only records the remote change.
    /// Either way the position is then proven correct and propagated to all
    /// passes.
    pub fn correct_blocks<C: CascadeChannel>(
        &mut self,
        idx: usize,
        is_bob: bool,
        chan: &mut C,
    ) -> Result<(), CascadeError> {
        let mut working: Vec<u64> = self.checkers[idx]
            .odd_blocks
            .iter()
            .map(|&(_, offset)| offset)
            .collect();

        for &offset in &working {
            let block = self.checkers[idx]
                .blocks
                .get(&offset)
                .ok_or(CascadeError::Protocol(format!(
                    "correction requested for unknown block at {offset}"
                )))?;
            if !block.diffparity {
                return Err(CascadeError::Protocol(format!(
                    "correction requested for even-parity block at {offset}"
                )));
            }
        }

        while !working.is_empty() {
            let mut calc: Vec<CalcBlock> = Vec::new();
            let mut keep: Vec<u64> = Vec::new();

            for &offset in &working {
                let size = self.checkers[idx]
                    .blocks
                    .get(&offset)
                    .ok_or(CascadeError::Protocol(format!(
                        "working block at {offset} vanished"
                    )))?
                    .size;

                if size > 1 {
                    let h1_size = (size + 1) / 2;
                    let h2_offset = offset + h1_size;
                    let h2_size = size - h1_size;

                    let checker = &self.checkers[idx];
                    // prefer the half whose parity is already known
                    if checker.count_correct_in(h2_offset, h2_size) == h2_size {
                        calc.push(CalcBlock {
                            offset: h2_offset,
                            size: h2_size,
                            exchange: false,
                            diffparity: false,
                        });
                    } else {
                        calc.push(CalcBlock {
                            offset,
                            size: h1_size,
                            exchange: false,
                            diffparity: false,
                        });
                    }
                    keep.push(offset);
                } else {
                    // single odd bit: this is the error
                    let pos = self.checkers[idx].inv_perm[offset as usize];
                    if is_bob {
                        self.flip_bit(pos)?;
                    } else {
                        self.notify_bit_change_remote(pos)?;
                    }
                    self.notify_correct_bit(pos)?;
                }
            }

            self.calculate_block_diffparities(idx, &mut calc, false, chan)?;
            if calc.len() != keep.len() {
                return Err(CascadeError::Protocol(
                    "parity containers diverged after exchange".to_string(),
                ));
            }

            let mut next: Vec<u64> = Vec::with_capacity(keep.len());
            let mut newly_correct: Vec<u64> = Vec::new();
            {
                let checker = &mut self.checkers[idx];
                for (c, &offset) in calc.iter().zip(keep.iter()) {
                    let size = checker
                        .blocks
                        .get(&offset)
                        .ok_or(CascadeError::Protocol(format!(
                            "split target at {offset} vanished"
                        )))?
                        .size;
                    let h1_size = (size + 1) / 2;
                    let h2_offset = offset + h1_size;
                    let h2_size = size - h1_size;

                    // we either calculated the second half directly, or the
                    // first; the other half's parity follows since exactly
                    // one of the two is odd
                    let h1_diff = (c.offset == h2_offset) ^ c.diffparity;
                    let h2_diff = !h1_diff;

                    if !h1_diff && h1_size == 1 && !checker.correct_bits.contains(&offset) {
                        newly_correct.push(checker.inv_perm[offset as usize]);
                    }
                    if !h2_diff && h2_size == 1 && !checker.correct_bits.contains(&h2_offset) {
                        newly_correct.push(checker.inv_perm[h2_offset as usize]);
                    }

                    if !checker.odd_blocks.remove(&(size, offset)) {
                        return Err(CascadeError::Protocol(format!(
                            "odd set out of step at block ({size}, {offset})"
                        )));
                    }
                    checker.blocks.remove(&offset);
                    checker.blocks.insert(
                        offset,
                        ParityBlock {
                            size: h1_size,
                            diffparity: h1_diff,
                        },
                    );
                    checker.blocks.insert(
                        h2_offset,
                        ParityBlock {
                            size: h2_size,
                            diffparity: h2_diff,
                        },
                    );

                    let (odd_offset, odd_size) = if h1_diff {
                        (offset, h1_size)
                    } else {
                        (h2_offset, h2_size)
                    };
                    checker.odd_blocks.insert((odd_size, odd_offset));
                    next.push(odd_offset);
                }
            }
            for pos in newly_correct {
                self.notify_correct_bit(pos)?;
            }

            working = next;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permutation::identity_permutation;
    use crate::transport::MemoryChannel;
    use shared_types::Key;
    use std::thread;

    fn run_pair<F, G>(alice: F, bob: G)
    where
        F: FnOnce(&mut MemoryChannel) + Send + 'static,
        G: FnOnce(&mut MemoryChannel) + Send + 'static,
    {
        let (mut chan_a, mut chan_b) = MemoryChannel::pair();
        let ha = thread::spawn(move || alice(&mut chan_a));
        let hb = thread::spawn(move || bob(&mut chan_b));
        ha.join().unwrap();
        hb.join().unwrap();
    }

    #[test]
    fn test_first_exchange_flags_odd_blocks() {
        // 16-bit keys differing in bit 3: with k=8 the first block is odd
        let alice_key = Key::new(1, vec![0b0000_0000, 0b0000_0000]);
        let mut bob_key = alice_key.clone();
        bob_key.data.flip_bit(3).unwrap();

        run_pair(
            move |chan| {
                let mut frame = Frame::new(alice_key);
                let (perm, inv) = identity_permutation(16);
                let idx = frame
                    .add_checker(perm, inv, &[Category::new(16, 8, false)], chan)
                    .unwrap();
                let odd: Vec<_> = frame.checker(idx).odd_blocks().collect();
                assert_eq!(odd, vec![(8, 0)]);
            },
            move |chan| {
                let mut frame = Frame::new(bob_key);
                let (perm, inv) = identity_permutation(16);
                let idx = frame
                    .add_checker(perm, inv, &[Category::new(16, 8, false)], chan)
                    .unwrap();
                assert!(frame.checker(idx).has_odd_blocks());
            },
        );
    }

    #[test]
    fn test_correct_blocks_locates_and_fixes_single_error() {
        let alice_key = Key::new(1, vec![0x5A, 0x00]);
        let mut bob_key = alice_key.clone();
        bob_key.data.flip_bit(11).unwrap();
        let reference = alice_key.clone();

        run_pair(
            move |chan| {
                let mut frame = Frame::new(alice_key);
                let (perm, inv) = identity_permutation(16);
                frame
                    .add_checker(perm, inv, &[Category::new(16, 8, false)], chan)
                    .unwrap();
                frame.correct_blocks(0, false, chan).unwrap();
                // alice records the remote correction without flipping
                assert_eq!(frame.corrected_bits().iter().copied().collect::<Vec<_>>(), vec![11]);
            },
            move |chan| {
                let mut frame = Frame::new(bob_key);
                let (perm, inv) = identity_permutation(16);
                frame
                    .add_checker(perm, inv, &[Category::new(16, 8, false)], chan)
                    .unwrap();
                frame.correct_blocks(0, true, chan).unwrap();
                assert_eq!(frame.key().data.as_octets(), reference.data.as_octets());
                assert!(!frame.checker(0).has_odd_blocks());
            },
        );
    }
}
