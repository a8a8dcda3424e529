use rayon::prelude::*;
use std::sync::{Condvar, Mutex};

use crate::bits::BitSink;
use crate::error::VellumError;
use crate::huffman::HuffmanCoding;
use crate::lz77::{MatchRecord, MatchRing, Matcher};

const ADLER_BASE: u32 = 65_521;
const ADLER_CHUNK: usize = 1 << 20;

// Largest span a single block may cover after merging.
const MAX_BUFFER_SIZE: usize = 32 * 1024;

// Below this the two-thread split costs more than it saves.
const THREAD_MIN_INPUT: usize = 64 * 1024;

const LENGTH_BASE: [usize; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115, 131,
    163, 195, 227, 258,
];

const LENGTH_EXTRA_BITS: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];

const DIST_BASE: [usize; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];

const DIST_EXTRA_BITS: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13,
];

// Transmission order of the code-length code lengths.
const CLEN_ORDER: [usize; 19] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

#[derive(Debug, Clone)]
pub struct DeflateOptions {
    // Candidate size of the first block attempt; merging may grow it.
    pub start_block_size: usize,
    // When true, adjacent candidate blocks are merged while the merged
    // encoding is no worse than the split one.
    pub dynamic_block_sizing: bool,
    // When true, a block's end is pushed into its successor while the
    // successor's first records encode cheaper under this block's codes.
    pub boundary_tuning: bool,
    // RFC 1950 framing (0x78 0x9C header, Adler-32 trailer).
    pub zlib_wrapper: bool,
    // Run the matcher on its own thread.
    pub threaded: bool,
}

impl Default for DeflateOptions {
    fn default() -> Self {
        Self {
            start_block_size: 4096,
            dynamic_block_sizing: true,
            boundary_tuning: true,
            zlib_wrapper: true,
            threaded: false,
        }
    }
}

fn length_code(len: usize) -> usize {
    debug_assert!((3..=258).contains(&len));
    if len == 258 {
        return 28;
    }
    for (idx, (&base, &extra)) in LENGTH_BASE.iter().zip(LENGTH_EXTRA_BITS.iter()).enumerate() {
        let max = base + ((1usize << extra) - 1);
        if len <= max {
            return idx;
        }
    }
    28
}

fn distance_code(dist: usize) -> usize {
    debug_assert!((1..=32_768).contains(&dist));
    for (idx, (&base, &extra)) in DIST_BASE.iter().zip(DIST_EXTRA_BITS.iter()).enumerate() {
        let max = base + ((1usize << extra) - 1);
        if dist <= max {
            return idx;
        }
    }
    29
}

// Walks the concatenated literal and distance code lengths as one sequence
// and reports the run-length symbols (16: repeat previous, 17/18: zero
// runs) with their extra-bit payloads. Used once to tally frequencies and
// once to emit.
fn rle_code_lengths(
    lit: &HuffmanCoding,
    dist: &HuffmanCoding,
    emit: &mut dyn FnMut(usize, u32, u16),
) {
    let mut seq: Vec<u8> = Vec::with_capacity(lit.count + dist.count);
    seq.extend_from_slice(&lit.bits[..lit.count]);
    seq.extend_from_slice(&dist.bits[..dist.count]);

    let mut i = 0usize;
    while i < seq.len() {
        let value = seq[i];
        let mut run = 1usize;
        while i + run < seq.len() && seq[i + run] == value {
            run += 1;
        }
        i += run;
        if value == 0 {
            while run >= 11 {
                let take = run.min(138);
                emit(18, 7, (take - 11) as u16);
                run -= take;
            }
            if run >= 3 {
                emit(17, 3, (run - 3) as u16);
                run = 0;
            }
            while run > 0 {
                emit(0, 0, 0);
                run -= 1;
            }
        } else {
            emit(value as usize, 0, 0);
            run -= 1;
            while run >= 3 {
                let take = run.min(6);
                emit(16, 2, (take - 3) as u16);
                run -= take;
            }
            while run > 0 {
                emit(value as usize, 0, 0);
                run -= 1;
            }
        }
    }
}

// One candidate block: an input span, the ring slice of records it covers,
// and the three codings its header needs. Built speculatively; the planner
// discards losers of the merge comparison.
struct Block {
    start: usize,
    end: usize,
    buffer_start: usize,
    buffer_end: usize,
    lit: HuffmanCoding,
    dist: HuffmanCoding,
    len: HuffmanCoding,
    clen_count: usize,
    bit_cost: u64,
}

impl Block {
    fn build(
        data: &[u8],
        pending: &[MatchRecord],
        buffer_start: usize,
        start: usize,
        size: usize,
    ) -> Result<Block, VellumError> {
        let nominal_end = (start + size).min(data.len());
        let mut lit = HuffmanCoding::new(288, 15);
        let mut dist = HuffmanCoding::new(32, 15);

        let mut cursor = start;
        let mut idx = buffer_start;
        while idx < pending.len() && (pending[idx].position as usize) < nominal_end {
            let record = pending[idx];
            for &b in &data[cursor..record.position as usize] {
                lit.used[b as usize] += 1;
            }
            lit.used[257 + length_code(record.len())] += 1;
            dist.used[distance_code(record.distance as usize)] += 1;
            // A match may carry the block past its nominal end; the block
            // then owns the overrun.
            cursor = record.end();
            idx += 1;
        }
        if cursor < nominal_end {
            for &b in &data[cursor..nominal_end] {
                lit.used[b as usize] += 1;
            }
            cursor = nominal_end;
        }
        lit.used[256] += 1;

        lit.compute_codes()?;
        lit.truncate(257);
        dist.compute_codes()?;
        dist.truncate(1);

        let mut len = HuffmanCoding::new(19, 7);
        rle_code_lengths(&lit, &dist, &mut |sym, _, _| len.used[sym] += 1);
        len.compute_codes()?;
        let mut clen_count = 19usize;
        while clen_count > 4 && len.bits[CLEN_ORDER[clen_count - 1]] == 0 {
            clen_count -= 1;
        }

        // Header plus payload cost. Match and distance extra bits are the
        // same under any split of the same records, so they stay out of
        // the comparison.
        let mut cost = 3u64 + 5 + 5 + 4 + 3 * clen_count as u64;
        rle_code_lengths(&lit, &dist, &mut |sym, extra_bits, _| {
            cost += len.bits[sym] as u64 + extra_bits as u64;
        });
        for i in 0..lit.count {
            cost += lit.used[i] as u64 * lit.bits[i] as u64;
        }
        for i in 0..dist.count {
            cost += dist.used[i] as u64 * dist.bits[i] as u64;
        }

        Ok(Block {
            start,
            end: cursor,
            buffer_start,
            buffer_end: idx,
            lit,
            dist,
            len,
            clen_count,
            bit_cost: cost,
        })
    }

    // Pushes this block's end into `after` while an initial run of its
    // items encodes in fewer bits under this block's codes than under
    // after's own. Stops at the first symbol this block has no code for.
    fn extend_boundary(&mut self, after: &Block, data: &[u8], pending: &[MatchRecord]) {
        let mut cursor = after.start;
        let mut idx = after.buffer_start;
        let mut delta = 0i64;
        let mut best_delta = 0i64;
        let mut best: Option<(usize, usize)> = None;

        while cursor < after.end {
            if idx < after.buffer_end && pending[idx].position as usize == cursor {
                let record = pending[idx];
                let sym = 257 + length_code(record.len());
                let dc = distance_code(record.distance as usize);
                if sym >= self.lit.count
                    || self.lit.bits[sym] == 0
                    || dc >= self.dist.count
                    || self.dist.bits[dc] == 0
                {
                    break;
                }
                delta += self.lit.bits[sym] as i64 - after.lit.bits[sym] as i64;
                delta += self.dist.bits[dc] as i64 - after.dist.bits[dc] as i64;
                cursor = record.end();
                idx += 1;
            } else {
                let b = data[cursor] as usize;
                if self.lit.bits[b] == 0 {
                    break;
                }
                delta += self.lit.bits[b] as i64 - after.lit.bits[b] as i64;
                cursor += 1;
            }
            if delta < best_delta {
                best_delta = delta;
                best = Some((cursor, idx));
            }
        }

        if let Some((end, buffer_end)) = best {
            self.end = end;
            self.buffer_end = buffer_end;
        }
    }

    fn write(&self, sink: &mut BitSink, data: &[u8], pending: &[MatchRecord], last: bool) {
        sink.write_bits(last as u64 | (2 << 1), 3);
        sink.write_bits((self.lit.count - 257) as u64, 5);
        sink.write_bits((self.dist.count - 1) as u64, 5);
        sink.write_bits((self.clen_count - 4) as u64, 4);
        for i in 0..self.clen_count {
            sink.write_bits(self.len.bits[CLEN_ORDER[i]] as u64, 3);
        }
        rle_code_lengths(&self.lit, &self.dist, &mut |sym, extra_bits, extra_val| {
            sink.write_bits(self.len.code[sym] as u64, self.len.bits[sym] as u32);
            if extra_bits > 0 {
                sink.write_bits(extra_val as u64, extra_bits);
            }
        });

        let mut cursor = self.start;
        for record in &pending[self.buffer_start..self.buffer_end] {
            for &b in &data[cursor..record.position as usize] {
                sink.write_bits(self.lit.code[b as usize] as u64, self.lit.bits[b as usize] as u32);
            }
            let mc = length_code(record.len());
            let sym = 257 + mc;
            sink.write_bits(self.lit.code[sym] as u64, self.lit.bits[sym] as u32);
            if LENGTH_EXTRA_BITS[mc] > 0 {
                sink.write_bits(
                    (record.len() - LENGTH_BASE[mc]) as u64,
                    LENGTH_EXTRA_BITS[mc] as u32,
                );
            }
            let dc = distance_code(record.distance as usize);
            sink.write_bits(self.dist.code[dc] as u64, self.dist.bits[dc] as u32);
            if DIST_EXTRA_BITS[dc] > 0 {
                sink.write_bits(
                    (record.distance as usize - DIST_BASE[dc]) as u64,
                    DIST_EXTRA_BITS[dc] as u32,
                );
            }
            cursor = record.end();
        }
        for &b in &data[cursor..self.end] {
            sink.write_bits(self.lit.code[b as usize] as u64, self.lit.bits[b as usize] as u32);
        }
        sink.write_bits(self.lit.code[256] as u64, self.lit.bits[256] as u32);
    }
}

// Producer/consumer coupling for the threaded mode: one mutex over the
// ring plus the scanned-prefix counter, one condvar serving both wakeup
// predicates (producer: ring has room; consumer: scan passed my request).
struct SharedRing {
    state: Mutex<RingState>,
    cond: Condvar,
}

struct RingState {
    ring: MatchRing,
    buffered: usize,
    done: bool,
    closed: bool,
}

impl SharedRing {
    fn new(input_len: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                ring: MatchRing::with_capacity_for(input_len),
                buffered: 0,
                done: false,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    // Returns false once the consumer has gone away.
    fn push(&self, record: MatchRecord, scanned: usize) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        while state.ring.is_full() && !state.closed {
            state = match self.cond.wait(state) {
                Ok(guard) => guard,
                Err(_) => return false,
            };
        }
        if state.closed {
            return false;
        }
        state.ring.push(record);
        state.buffered = scanned;
        self.cond.notify_all();
        true
    }

    fn finish(&self, input_len: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.done = true;
            state.buffered = input_len;
            self.cond.notify_all();
        }
    }

    fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            self.cond.notify_all();
        }
    }
}

// Feeds match records to the planner; either the matcher runs inline
// through a locally owned ring, or it runs on a producer thread behind
// the shared one.
enum MatchSource<'a, 's> {
    Inline {
        matcher: Matcher<'a>,
        ring: MatchRing,
        exhausted: bool,
    },
    Shared(&'s SharedRing),
}

impl MatchSource<'_, '_> {
    // Appends every record with position below `target` (and possibly
    // beyond) to `pending`; returns the scanned input prefix, which is at
    // least `target` unless the input ended first.
    fn pump(&mut self, target: usize, pending: &mut Vec<MatchRecord>) -> Result<usize, VellumError> {
        match self {
            MatchSource::Inline {
                matcher,
                ring,
                exhausted,
            } => loop {
                while let Some(record) = ring.pop() {
                    pending.push(record);
                }
                if *exhausted || matcher.scanned() >= target {
                    return Ok(matcher.scanned());
                }
                match matcher.next_match() {
                    Some(record) => ring.push(record),
                    None => *exhausted = true,
                }
            },
            MatchSource::Shared(shared) => {
                let mut state = shared
                    .state
                    .lock()
                    .map_err(|_| VellumError::Encoding("match producer panicked".to_string()))?;
                loop {
                    let mut drained = false;
                    while let Some(record) = state.ring.pop() {
                        pending.push(record);
                        drained = true;
                    }
                    if drained {
                        shared.cond.notify_all();
                    }
                    if state.done || state.buffered >= target {
                        return Ok(state.buffered);
                    }
                    state = shared
                        .cond
                        .wait(state)
                        .map_err(|_| VellumError::Encoding("match producer panicked".to_string()))?;
                }
            }
        }
    }
}

fn plan_blocks(
    data: &[u8],
    source: &mut MatchSource,
    options: &DeflateOptions,
    sink: &mut BitSink,
) -> Result<(), VellumError> {
    let n = data.len();
    let mut pending: Vec<MatchRecord> = Vec::new();

    if n == 0 {
        let block = Block::build(data, &pending, 0, 0, 0)?;
        block.write(sink, data, &pending, true);
        return Ok(());
    }

    let mut finished = 0usize;
    while finished < n {
        let mut size = options.start_block_size.clamp(1, n - finished);
        source.pump(finished + size, &mut pending)?;
        let mut block = Block::build(data, &pending, 0, finished, size)?;

        if options.dynamic_block_sizing {
            loop {
                if block.end >= n || block.end - block.start >= MAX_BUFFER_SIZE {
                    break;
                }
                let after_size = size.min(n - block.end);
                source.pump(block.end + after_size, &mut pending)?;
                let after = Block::build(data, &pending, block.buffer_end, block.end, after_size)?;
                let merged = Block::build(data, &pending, 0, block.start, after.end - block.start)?;
                if merged.bit_cost <= block.bit_cost + after.bit_cost {
                    block = merged;
                    size *= 2;
                } else {
                    if options.boundary_tuning {
                        block.extend_boundary(&after, data, &pending);
                    }
                    break;
                }
            }
        }

        let last = block.end >= n;
        block.write(sink, data, &pending, last);
        finished = block.end;
        pending.drain(..block.buffer_end);
    }
    Ok(())
}

pub fn deflate(data: &[u8], options: &DeflateOptions) -> Result<Vec<u8>, VellumError> {
    let mut sink = BitSink::with_capacity(data.len() / 2 + 64);
    if options.zlib_wrapper {
        sink.write_bits(0x78, 8);
        sink.write_bits(0x9C, 8);
    }

    if options.threaded && data.len() >= THREAD_MIN_INPUT {
        let shared = SharedRing::new(data.len());
        std::thread::scope(|scope| {
            scope.spawn(|| {
                let mut matcher = Matcher::new(data);
                while let Some(record) = matcher.next_match() {
                    if !shared.push(record, matcher.scanned()) {
                        return;
                    }
                }
                shared.finish(data.len());
            });
            let result = plan_blocks(data, &mut MatchSource::Shared(&shared), options, &mut sink);
            shared.close();
            result
        })?;
    } else {
        let mut source = MatchSource::Inline {
            matcher: Matcher::new(data),
            ring: MatchRing::with_capacity_for(data.len()),
            exhausted: false,
        };
        plan_blocks(data, &mut source, options, &mut sink)?;
    }

    if options.zlib_wrapper {
        sink.pad_to(8);
        let adler = adler32(data);
        for shift in [24u32, 16, 8, 0] {
            sink.write_bits(((adler >> shift) & 0xFF) as u64, 8);
        }
    }
    Ok(sink.into_bytes())
}

// RFC 1950 framing with the default block plan.
pub fn zlib_deflate(data: &[u8]) -> Result<Vec<u8>, VellumError> {
    deflate(data, &DeflateOptions::default())
}

#[derive(Clone, Copy)]
struct AdlerSum {
    a: u32,
    b: u32,
    len: usize,
}

impl AdlerSum {
    fn identity() -> Self {
        Self { a: 1, b: 0, len: 0 }
    }

    fn of(data: &[u8]) -> Self {
        let mut a: u32 = 1;
        let mut b: u32 = 0;
        for &byte in data {
            a += byte as u32;
            if a >= ADLER_BASE {
                a -= ADLER_BASE;
            }
            b += a;
            b %= ADLER_BASE;
        }
        Self {
            a,
            b,
            len: data.len(),
        }
    }

    fn combine(self, rhs: Self) -> Self {
        if self.len == 0 {
            return rhs;
        }
        if rhs.len == 0 {
            return self;
        }
        let a = (self.a + rhs.a + ADLER_BASE - 1) % ADLER_BASE;
        let b = (self.b as u64
            + rhs.b as u64
            + ((rhs.len as u64 % ADLER_BASE as u64) * ((self.a + ADLER_BASE - 1) as u64)))
            % ADLER_BASE as u64;
        Self {
            a,
            b: b as u32,
            len: self.len + rhs.len,
        }
    }

    fn value(self) -> u32 {
        (self.b << 16) | self.a
    }
}

pub(crate) fn adler32(data: &[u8]) -> u32 {
    if data.len() <= ADLER_CHUNK {
        return AdlerSum::of(data).value();
    }
    data.par_chunks(ADLER_CHUNK)
        .map(AdlerSum::of)
        .collect::<Vec<_>>()
        .into_iter()
        .fold(AdlerSum::identity(), AdlerSum::combine)
        .value()
}
