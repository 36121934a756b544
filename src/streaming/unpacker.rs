//! Consumer side: reorders bunches, decompresses them in sequence and parses
//! the decompressed stream into records as it arrives.
//!
//! The decoder is only ever asked for as many bytes as the current parser
//! phase still needs, so a single bunch may take many decoder calls and a
//! single field may span many bunches.

use crate::error::{Result, TransferError};
use crate::streaming::record::{Phase, RecordKey, RecordParser, RecordSink, WORK_BUFFER_SIZE};
use crate::streaming::reorder::{Offer, PendingBunches};
use crate::streaming::store::DestinationStore;
use bytes::Bytes;
use zstd::stream::raw::{Decoder, InBuffer, Operation, OutBuffer};

/// Default byte quota for one transfer (2 MiB).
pub const DEFAULT_QUOTA: u64 = 2 * 1024 * 1024;

/// Consumer statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnpackStats {
    /// Records fully materialized
    pub records: u64,
    /// Content bytes written to the store
    pub content_bytes: u64,
    /// Bunches drained through the decoder
    pub bunches: u32,
    /// Re-delivered bunches that were ignored
    pub duplicates: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Active,
    Complete,
    Failed,
}

/// Remaining content budget.
#[derive(Debug, Clone, Copy)]
struct Quota {
    remaining: u64,
}

impl Quota {
    fn check(&self, key: &RecordKey, requested: u64) -> Result<()> {
        if requested > self.remaining {
            return Err(TransferError::QuotaExceeded {
                key: key.to_string(),
                requested,
                remaining: self.remaining,
            });
        }
        Ok(())
    }

    fn charge(&mut self, key: &RecordKey, requested: u64) -> Result<()> {
        self.check(key, requested)?;
        self.remaining -= requested;
        Ok(())
    }
}

/// Applies parsed records to the store under the quota.
struct Materializer<'a, S> {
    store: &'a mut S,
    quota: &'a mut Quota,
    stats: &'a mut UnpackStats,
}

impl<S: DestinationStore> RecordSink for Materializer<'_, S> {
    fn begin(&mut self, key: &RecordKey, len: u32) -> Result<()> {
        self.quota.check(key, len as u64)?;
        tracing::debug!("Receiving {} ({} bytes)", key, len);
        self.store.create(key)
    }

    fn content(&mut self, key: &RecordKey, data: &[u8]) -> Result<()> {
        // begin() admitted the declared length and the parser never yields
        // more, so this charge cannot exceed what is left.
        self.quota.charge(key, data.len() as u64)?;
        if let Err(e) = self.store.append(key, data) {
            self.store.discard(key)?;
            return Err(e);
        }
        self.stats.content_bytes += data.len() as u64;
        Ok(())
    }

    fn end(&mut self, key: &RecordKey) -> Result<()> {
        self.store.complete(key)?;
        self.stats.records += 1;
        Ok(())
    }
}

/// Reassembles one bundle from bunches submitted in any order.
///
/// Not internally synchronized: concurrent producers must funnel their
/// bunches through one caller (see [`crate::streaming::channel`]).
pub struct Unpacker<S: DestinationStore> {
    total: u32,
    next_index: u32,
    pending: PendingBunches,
    decoder: Option<Decoder<'static>>,
    /// Whether the last decoder call ended a zstd frame.
    frame_done: bool,
    parser: RecordParser,
    work: Vec<u8>,
    store: S,
    quota: Quota,
    state: SessionState,
    stats: UnpackStats,
}

impl<S: DestinationStore> Unpacker<S> {
    pub fn new(total_bunches: u32, store: S, quota: u64) -> Result<Self> {
        if total_bunches == 0 {
            return Err(TransferError::protocol(
                "A bundle carries at least one bunch",
            ));
        }
        let decoder =
            Decoder::new().map_err(|e| TransferError::compression("decoder initialization", e))?;

        Ok(Self {
            total: total_bunches,
            next_index: 0,
            pending: PendingBunches::new(),
            decoder: Some(decoder),
            frame_done: false,
            parser: RecordParser::new(),
            work: vec![0u8; WORK_BUFFER_SIZE],
            store,
            quota: Quota { remaining: quota },
            state: SessionState::Active,
            stats: UnpackStats::default(),
        })
    }

    /// Offer one bunch. Returns `true` on the call that drains the final
    /// bunch; the decoder is released at that point.
    ///
    /// Any error leaves the session failed and every later call is refused.
    pub fn submit_bunch(&mut self, index: u32, payload: impl Into<Bytes>) -> Result<bool> {
        match self.state {
            SessionState::Active => {}
            SessionState::Complete => {
                return Err(TransferError::protocol(format!(
                    "Bunch {} submitted after the transfer completed",
                    index
                )))
            }
            SessionState::Failed => {
                return Err(TransferError::protocol(format!(
                    "Bunch {} submitted to a failed transfer",
                    index
                )))
            }
        }

        match self.submit_inner(index, payload.into()) {
            Ok(done) => Ok(done),
            Err(e) => {
                tracing::warn!("Transfer failed at bunch {}: {}", index, e);
                self.state = SessionState::Failed;
                self.decoder = None;
                Err(e)
            }
        }
    }

    fn submit_inner(&mut self, index: u32, payload: Bytes) -> Result<bool> {
        if index >= self.total {
            return Err(TransferError::protocol(format!(
                "Bunch index {} out of range (bundle has {} bunches)",
                index, self.total
            )));
        }

        if self.pending.offer(index, self.next_index, payload) == Offer::Duplicate {
            tracing::warn!("Ignoring duplicate bunch {}", index);
            self.stats.duplicates += 1;
            return Ok(false);
        }

        while let Some(payload) = self.pending.take_next(self.next_index) {
            self.drain_bunch(&payload)?;
            tracing::trace!("Drained bunch {} ({} bytes)", self.next_index, payload.len());
            self.next_index += 1;
            self.stats.bunches += 1;
        }

        if self.next_index < self.total {
            return Ok(false);
        }
        self.finalize()?;
        Ok(true)
    }

    /// Run one bunch through the decoder and the parser.
    fn drain_bunch(&mut self, payload: &[u8]) -> Result<()> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| TransferError::protocol("Decoder already finalized"))?;
        let mut sink = Materializer {
            store: &mut self.store,
            quota: &mut self.quota,
            stats: &mut self.stats,
        };
        let mut input = InBuffer::around(payload);

        loop {
            let want = self.parser.want(self.work.len());
            let consumed_before = input.pos();
            let mut output = OutBuffer::around(&mut self.work[..want]);
            let hint = decoder.run(&mut input, &mut output).map_err(|e| {
                TransferError::compression(format!("{} phase", self.parser.phase()), e)
            })?;
            let produced = output.pos();
            let progressed = produced > 0 || input.pos() > consumed_before;
            if progressed {
                self.frame_done = hint == 0;
            }

            if produced > 0 {
                self.parser.accept(&self.work[..produced], &mut sink)?;
            }

            let input_done = input.pos() == payload.len();
            if input_done && produced < want {
                return Ok(());
            }
            if !progressed {
                return Err(TransferError::compression(
                    format!("{} phase", self.parser.phase()),
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "decoder made no progress",
                    ),
                ));
            }
        }
    }

    fn finalize(&mut self) -> Result<()> {
        if !self.frame_done {
            return Err(TransferError::Framing {
                phase: self.parser.phase(),
                message: "compressed stream ended before its frame was complete".to_string(),
            });
        }
        if !self.parser.at_record_boundary() {
            return Err(TransferError::Framing {
                phase: self.parser.phase(),
                message: "stream ended inside a record".to_string(),
            });
        }
        self.decoder = None;
        self.store.finish()?;
        self.state = SessionState::Complete;

        tracing::info!(
            "Unpacked {} records ({} bytes) from {} bunches",
            self.stats.records,
            self.stats.content_bytes,
            self.stats.bunches
        );
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.state == SessionState::Complete
    }

    pub fn is_failed(&self) -> bool {
        self.state == SessionState::Failed
    }

    pub fn total_bunches(&self) -> u32 {
        self.total
    }

    /// Index of the next bunch the decoder is waiting for.
    pub fn next_index(&self) -> u32 {
        self.next_index
    }

    /// Bunches buffered out of order.
    pub fn pending_bunches(&self) -> usize {
        self.pending.len()
    }

    pub fn remaining_quota(&self) -> u64 {
        self.quota.remaining
    }

    pub fn phase(&self) -> Phase {
        self.parser.phase()
    }

    /// Payload bytes held for bunches that arrived ahead of their turn.
    pub fn buffered_bytes(&self) -> usize {
        self.pending.buffered_bytes()
    }

    pub fn stats(&self) -> &UnpackStats {
        &self.stats
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::packer::{Bunch, Packer, PackerConfig};
    use crate::streaming::store::MemoryStore;

    fn pack(bunch_size: usize, records: &[(&str, &str, &[u8])]) -> Vec<Bunch> {
        let mut packer = Packer::new(PackerConfig {
            bunch_size,
            ..Default::default()
        })
        .unwrap();
        for (owner, path, content) in records {
            packer.add_record(owner, path, content).unwrap();
        }
        packer.finish().unwrap();
        packer.into_bunches().unwrap()
    }

    fn noise(len: usize) -> Vec<u8> {
        let mut state = 0x9e37_79b9_u32;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect()
    }

    /// Accepts `limit` content bytes, then fails every append.
    #[derive(Default)]
    struct FullDisk {
        inner: MemoryStore,
        limit: usize,
        written: usize,
        discarded: Vec<String>,
    }

    impl DestinationStore for FullDisk {
        fn create(&mut self, key: &RecordKey) -> Result<()> {
            self.inner.create(key)
        }

        fn append(&mut self, key: &RecordKey, data: &[u8]) -> Result<()> {
            if self.written + data.len() > self.limit {
                return Err(TransferError::io(
                    key.to_string(),
                    std::io::Error::new(std::io::ErrorKind::Other, "no space left"),
                ));
            }
            self.written += data.len();
            self.inner.append(key, data)
        }

        fn discard(&mut self, key: &RecordKey) -> Result<()> {
            self.discarded.push(key.to_string());
            self.inner.discard(key)
        }
    }

    fn unpacker(bunches: &[Bunch], quota: u64) -> Unpacker<MemoryStore> {
        Unpacker::new(bunches.len() as u32, MemoryStore::new(), quota).unwrap()
    }

    #[test]
    fn test_in_order() {
        let bunches = pack(32, &[("modA", "init.lua", b"print('hello')")]);
        let mut u = unpacker(&bunches, DEFAULT_QUOTA);
        let last = bunches.len() - 1;
        for (i, b) in bunches.iter().enumerate() {
            let done = u.submit_bunch(b.index, b.payload.clone()).unwrap();
            assert_eq!(done, i == last);
        }
        assert!(u.is_complete());
        assert_eq!(
            u.store().get("modA", "init.lua"),
            Some(&b"print('hello')"[..])
        );
        assert_eq!(u.stats().records, 1);
    }

    #[test]
    fn test_reverse_order_buffers_until_first() {
        let content = noise(3000);
        let bunches = pack(16, &[("modA", "a.lua", &content)]);
        assert!(bunches.len() > 2);
        let mut u = unpacker(&bunches, DEFAULT_QUOTA);

        for b in bunches.iter().skip(1).rev() {
            assert!(!u.submit_bunch(b.index, b.payload.clone()).unwrap());
        }
        assert_eq!(u.next_index(), 0);
        assert_eq!(u.pending_bunches(), bunches.len() - 1);

        assert!(u.submit_bunch(0, bunches[0].payload.clone()).unwrap());
        assert_eq!(u.pending_bunches(), 0);
        assert_eq!(u.store().get("modA", "a.lua").unwrap(), &content[..]);
    }

    #[test]
    fn test_zero_length_record_creates_entry() {
        let bunches = pack(1024, &[("modA", "empty.lua", b"")]);
        let mut u = unpacker(&bunches, 0);
        assert!(u.submit_bunch(0, bunches[0].payload.clone()).unwrap());
        assert_eq!(u.store().get("modA", "empty.lua"), Some(&b""[..]));
    }

    #[test]
    fn test_quota_exact_fit() {
        let bunches = pack(64, &[("m", "a", b"12345"), ("m", "b", b"678")]);
        let mut u = unpacker(&bunches, 8);
        let mut done = false;
        for b in &bunches {
            done = u.submit_bunch(b.index, b.payload.clone()).unwrap();
        }
        assert!(done);
        assert_eq!(u.remaining_quota(), 0);
    }

    #[test]
    fn test_quota_one_over_fails() {
        let bunches = pack(64, &[("m", "a", b"12345"), ("m", "b", b"6789")]);
        let mut u = unpacker(&bunches, 8);
        let mut failure = None;
        for b in &bunches {
            if let Err(e) = u.submit_bunch(b.index, b.payload.clone()) {
                failure = Some(e);
                break;
            }
        }
        let err = failure.expect("quota should be exceeded");
        assert!(matches!(err, TransferError::QuotaExceeded { .. }));
        assert!(u.is_failed());
        assert!(!u.store().contains("m", "b"));
    }

    #[test]
    fn test_duplicate_is_ignored() {
        let content = noise(2000);
        let bunches = pack(16, &[("modA", "q.lua", &content)]);
        let mut u = unpacker(&bunches, DEFAULT_QUOTA);

        assert!(!u.submit_bunch(0, bunches[0].payload.clone()).unwrap());
        assert!(!u.submit_bunch(0, bunches[0].payload.clone()).unwrap());
        assert!(!u.submit_bunch(2, bunches[2].payload.clone()).unwrap());
        assert!(!u.submit_bunch(2, bunches[2].payload.clone()).unwrap());
        assert_eq!(u.stats().duplicates, 2);

        let mut done = false;
        for b in &bunches[1..] {
            if b.index == 2 {
                continue;
            }
            done = u.submit_bunch(b.index, b.payload.clone()).unwrap();
        }
        assert!(done);
        assert_eq!(u.store().get("modA", "q.lua").unwrap(), &content[..]);
    }

    #[test]
    fn test_submit_after_complete_fails() {
        let bunches = pack(1024, &[("modA", "x", b"x")]);
        let mut u = unpacker(&bunches, DEFAULT_QUOTA);
        assert!(u.submit_bunch(0, bunches[0].payload.clone()).unwrap());
        let err = u.submit_bunch(0, bunches[0].payload.clone()).unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
    }

    #[test]
    fn test_index_out_of_range() {
        let bunches = pack(1024, &[("modA", "x", b"x")]);
        let mut u = unpacker(&bunches, DEFAULT_QUOTA);
        let err = u.submit_bunch(5, Bytes::from_static(b"junk")).unwrap_err();
        assert!(matches!(err, TransferError::Protocol(_)));
        assert!(u.is_failed());
    }

    #[test]
    fn test_zero_total_rejected() {
        assert!(Unpacker::new(0, MemoryStore::new(), DEFAULT_QUOTA).is_err());
    }

    #[test]
    fn test_corrupt_payload_is_compression_error() {
        let mut u = Unpacker::new(1, MemoryStore::new(), DEFAULT_QUOTA).unwrap();
        let err = u
            .submit_bunch(0, Bytes::from_static(b"definitely not zstd"))
            .unwrap_err();
        assert!(matches!(err, TransferError::Compression { .. }));
    }

    #[test]
    fn test_truncated_bundle_is_framing_error() {
        let content = noise(4000);
        let bunches = pack(16, &[("modA", "k.lua", &content)]);
        // Claim one bunch fewer than was produced.
        let short = bunches.len() as u32 - 1;
        let mut u = Unpacker::new(short, MemoryStore::new(), DEFAULT_QUOTA).unwrap();
        let mut result = Ok(false);
        for b in &bunches[..short as usize] {
            result = u.submit_bunch(b.index, b.payload.clone());
        }
        let err = result.unwrap_err();
        assert!(matches!(err, TransferError::Framing { .. }));
    }

    #[test]
    fn test_partial_file_visible_before_completion() {
        // Several zstd blocks, so the first one decodes long before the last
        // bunch arrives.
        let content = noise(300_000);
        let bunches = pack(1024, &[("modA", "big.lua", &content)]);
        assert!(bunches.len() > 2);
        let mut u = unpacker(&bunches, DEFAULT_QUOTA);

        let half = bunches.len() / 2;
        for b in &bunches[..half] {
            assert!(!u.submit_bunch(b.index, b.payload.clone()).unwrap());
        }
        assert!(u.store().contains("modA", "big.lua"));
    }

    #[test]
    fn test_failed_append_discards_partial_entry() {
        let bunches = pack(
            4096,
            &[("modA", "small.lua", b"ok"), ("modA", "big.lua", &noise(3000))],
        );
        let store = FullDisk {
            limit: 100,
            ..Default::default()
        };
        let mut u = Unpacker::new(bunches.len() as u32, store, DEFAULT_QUOTA).unwrap();

        let mut result = Ok(false);
        for b in &bunches {
            result = u.submit_bunch(b.index, b.payload.clone());
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(TransferError::Io { .. })));
        assert!(u.is_failed());

        let store = u.into_store();
        assert_eq!(store.discarded, vec!["modA:big.lua".to_string()]);
        assert!(!store.inner.contains("modA", "big.lua"));
        assert_eq!(store.inner.get("modA", "small.lua"), Some(&b"ok"[..]));
    }

    #[test]
    fn test_buffered_bytes_track_early_bunches() {
        let bunches = pack(16, &[("modA", "a.lua", &noise(500))]);
        assert!(bunches.len() > 2);
        let mut u = unpacker(&bunches, DEFAULT_QUOTA);

        let early: usize = bunches[1..].iter().map(Bunch::len).sum();
        for b in bunches.iter().skip(1) {
            u.submit_bunch(b.index, b.payload.clone()).unwrap();
        }
        assert_eq!(u.buffered_bytes(), early);

        u.submit_bunch(0, bunches[0].payload.clone()).unwrap();
        assert_eq!(u.buffered_bytes(), 0);
    }
}
