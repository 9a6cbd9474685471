//! Transaction records and the page checksum they carry.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Where one page of a transaction landed in the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageLocation {
    pub offset: u64,
    pub checksum: [u32; 2],
}

/// One committed (or in-flight) set of page writes.
///
/// Transaction ids are dense per file: for every committed id k > 0, id k−1
/// is committed as well, which is what makes the pending log replayable as a
/// contiguous prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tx {
    pub tx_id: u64,
    /// Page index → location; empty for a placeholder.
    pub pages: BTreeMap<u32, PageLocation>,
    /// Virtual file size after this transaction.
    pub file_size: u64,
    /// Lowest transaction id any peer still viewed when this committed; only
    /// set on finalizing commits.
    pub oldest_tx_in_use: Option<u64>,
    /// Offsets this transaction's installation displaced. Filled in by the
    /// installing side, never carried on the wire.
    #[serde(skip)]
    pub reclaimable: Vec<u64>,
}

impl Tx {
    pub fn new(tx_id: u64, file_size: u64) -> Self {
        Tx {
            tx_id,
            pages: BTreeMap::new(),
            file_size,
            oldest_tx_in_use: None,
            reclaimable: Vec::new(),
        }
    }
}

const CHECKSUM_MOD: u64 = 0xFFFF_FFFF;

/// Two running sums over the page's little-endian 32-bit words, each reduced
/// mod 2^32 − 1. A trailing partial word is zero-padded.
pub fn page_checksum(page: &[u8]) -> [u32; 2] {
    let mut h1: u64 = 0;
    let mut h2: u64 = 0;
    let mut words = page.chunks_exact(4);
    for word in &mut words {
        let v = u32::from_le_bytes(word.try_into().expect("exact chunk")) as u64;
        h1 = (h1 + v) % CHECKSUM_MOD;
        h2 = (h2 + h1) % CHECKSUM_MOD;
    }
    let tail = words.remainder();
    if !tail.is_empty() {
        let mut word = [0u8; 4];
        word[..tail.len()].copy_from_slice(tail);
        let v = u32::from_le_bytes(word) as u64;
        h1 = (h1 + v) % CHECKSUM_MOD;
        h2 = (h2 + h1) % CHECKSUM_MOD;
    }
    [h1 as u32, h2 as u32]
}

pub fn verify_checksum(page: &[u8], checksum: [u32; 2]) -> bool {
    page_checksum(page) == checksum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_known_vectors() {
        assert_eq!(page_checksum(&[]), [0, 0]);
        // Words 1, 2: h1 runs 1, 3; h2 runs 1, 4.
        assert_eq!(page_checksum(&[1, 0, 0, 0, 2, 0, 0, 0]), [3, 4]);
        // A tail shorter than a word is zero-padded.
        assert_eq!(page_checksum(&[1]), page_checksum(&[1, 0, 0, 0]));
    }

    #[test]
    fn checksum_reduces_mod_2_32_minus_1() {
        // A word of all ones is congruent to zero mod 2^32 − 1.
        assert_eq!(page_checksum(&[0xff, 0xff, 0xff, 0xff]), [0, 0]);
        let two_words = [0xff, 0xff, 0xff, 0xff, 1, 0, 0, 0];
        assert_eq!(page_checksum(&two_words), [1, 1]);
    }

    #[test]
    fn checksum_detects_corruption() {
        let mut page = vec![7u8; 4096];
        let checksum = page_checksum(&page);
        assert!(verify_checksum(&page, checksum));
        page[100] ^= 0x01;
        assert!(!verify_checksum(&page, checksum));
    }

    #[test]
    fn record_round_trips_without_reclaimable() {
        let mut tx = Tx::new(3, 8192);
        tx.pages.insert(
            1,
            PageLocation {
                offset: 4096,
                checksum: [1, 2],
            },
        );
        tx.oldest_tx_in_use = Some(2);
        tx.reclaimable.push(999);

        let bytes = bincode::serialize(&tx).unwrap();
        let back: Tx = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back.tx_id, 3);
        assert_eq!(back.pages, tx.pages);
        assert_eq!(back.oldest_tx_in_use, Some(2));
        assert!(back.reclaimable.is_empty(), "reclaimable is local state");
    }
}
