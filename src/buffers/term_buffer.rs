use std::sync::atomic::{AtomicU64, Ordering};
use anyhow::bail;
use crate::frame::FRAME_ALIGNMENT;
use crate::safe_converter::PrecheckedCast;

const WORD: usize = size_of::<u64>();

/// A term's storage, bounds checked and safe to share between the receive context (writer),
///  the scheduler (gap scanning and cleaning) and consumers (reading rebuilt data).
///
/// Storage is a sequence of 8 byte words, little endian. The first word of a frame holds the
///  frame length in its low 32 bits, and it is the word that *publishes* a frame: it is written
///  last and with release semantics, so a reader that sees a non-zero frame length (acquire)
///  sees the complete frame. This is the per-frame 'received' marker gap scanning relies on.
pub struct TermBuffer {
    words: Box<[AtomicU64]>,
}

impl TermBuffer {
    pub fn new(length: usize) -> anyhow::Result<TermBuffer> {
        if length % WORD != 0 {
            bail!("term buffer length {} is not a multiple of {}", length, WORD);
        }

        let num_words = length / WORD;
        let mut words = Vec::new();
        if words.try_reserve_exact(num_words).is_err() {
            bail!("unable to allocate term buffer of {} bytes", length);
        }
        words.extend((0..num_words).map(|_| AtomicU64::new(0)));

        Ok(TermBuffer {
            words: words.into_boxed_slice(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.words.len() * WORD
    }

    fn check_frame_bounds(&self, offset: i32, length: usize) -> Option<usize> {
        let offset: usize = usize::try_from(offset).ok()?;
        if offset % FRAME_ALIGNMENT as usize != 0 || offset.checked_add(length)? > self.capacity() {
            return None;
        }
        Some(offset / WORD)
    }

    /// Writes a frame into the term, copying straight from the datagram. A slot whose first word
    ///  is set already is left alone. The frame's first word is written last with a
    ///  compare-and-swap against zero, so a padding frame written concurrently is never
    ///  overwritten either: padding only ever writes the first word.
    ///
    /// Returns `false` if the slot was already taken or the frame does not fit.
    pub fn put_frame(&self, offset: i32, frame: &[u8]) -> bool {
        if frame.len() < WORD {
            return false;
        }
        let Some(first_word) = self.check_frame_bounds(offset, frame.len()) else {
            return false;
        };

        let mut chunks = frame.chunks(WORD);
        let header_word = match chunks.next() {
            Some(chunk) => word_from_le(chunk),
            None => return false,
        };
        if header_word == 0 || self.words[first_word].load(Ordering::Acquire) != 0 {
            return false;
        }

        for (i, chunk) in chunks.enumerate() {
            self.words[first_word + 1 + i].store(word_from_le(chunk), Ordering::Relaxed);
        }

        self.words[first_word]
            .compare_exchange(0, header_word, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// Reads the frame length at the given offset with acquire semantics. A non-zero value
    ///  means the complete frame is visible.
    pub fn frame_length_volatile(&self, offset: i32) -> i32 {
        let idx: usize = offset.prechecked_cast();
        let word = self.words[idx / WORD].load(Ordering::Acquire);
        (word & 0xffff_ffff) as u32 as i32
    }

    /// Copies `dst.len()` bytes starting at `offset`. Only data below a published (acquired)
    ///  frame length is meaningful.
    pub fn get_bytes(&self, offset: usize, dst: &mut [u8]) {
        let mut pos = offset;
        let mut written = 0;
        while written < dst.len() {
            let word = self.words[pos / WORD].load(Ordering::Relaxed).to_le_bytes();
            let in_word = pos % WORD;
            let n = (WORD - in_word).min(dst.len() - written);
            dst[written..written + n].copy_from_slice(&word[in_word..in_word + n]);
            written += n;
            pos += n;
        }
    }

    /// Zero fills a word aligned region. Only called for regions no writer can be
    ///  targeting, i.e. behind the advertised window.
    pub fn set_memory_zero(&self, offset: usize, length: usize) {
        debug_assert!(offset % WORD == 0 && length % WORD == 0);

        // payload words first, frame length words last: a concurrent scanner never sees a
        //  published frame over zeroed data
        let words = &self.words[offset / WORD..(offset + length) / WORD];
        for w in words.iter().rev() {
            w.store(0, Ordering::Release);
        }
    }
}

fn word_from_le(chunk: &[u8]) -> u64 {
    let mut bytes = [0u8; WORD];
    bytes[..chunk.len()].copy_from_slice(chunk);
    u64::from_le_bytes(bytes)
}
