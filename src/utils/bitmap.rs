//! Bitmap data structure helper, used for quorum tallies over a node list.

use std::fmt;

use crate::utils::PaxlockError;

use fixedbitset::FixedBitSet;

/// Compact bitmap for node index -> bool mapping. Node indices are positions
/// in the node list a Paxos run was started with.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap(FixedBitSet);

impl Bitmap {
    /// Creates a new bitmap of given size with all slots false.
    pub fn new(size: u8) -> Self {
        if size == 0 {
            panic!("invalid bitmap size {}", size);
        }
        Bitmap(FixedBitSet::with_capacity(size as usize))
    }

    /// Creates a new bitmap of given size from vec literal. Indices in the
    /// vec are bits to be set as true.
    pub fn from(size: u8, ones: Vec<u8>) -> Self {
        let mut bitmap = Self::new(size);
        for idx in ones {
            if let Err(e) = bitmap.set(idx, true) {
                panic!("{}", e);
            }
        }
        bitmap
    }

    /// Sets bit at index to given flag.
    #[inline]
    pub fn set(&mut self, idx: u8, flag: bool) -> Result<(), PaxlockError> {
        if idx as usize >= self.0.len() {
            return Err(PaxlockError(format!("index {} out of bound", idx)));
        }
        self.0.set(idx as usize, flag);
        Ok(())
    }

    /// Gets the bit flag at index.
    #[inline]
    pub fn get(&self, idx: u8) -> Result<bool, PaxlockError> {
        if idx as usize >= self.0.len() {
            return Err(PaxlockError(format!("index {} out of bound", idx)));
        }
        Ok(self.0[idx as usize])
    }

    /// Returns the size of the bitmap.
    #[inline]
    pub fn size(&self) -> u8 {
        self.0.len() as u8
    }

    /// Returns the number of trues in the bitmap.
    #[inline]
    pub fn count(&self) -> u8 {
        self.0.count_ones(..) as u8
    }

    /// True if the set bits form a strict majority of the whole map.
    #[inline]
    pub fn is_majority(&self) -> bool {
        self.count() as usize > self.0.len() / 2
    }

    /// Iterates over the indices whose bit is set.
    #[inline]
    pub fn ones(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.ones().map(|i| i as u8)
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}; [", self.size())?;
        for (n, i) in self.ones().enumerate() {
            if n > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", i)?;
        }
        write!(f, "]}}")
    }
}
