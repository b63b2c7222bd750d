//! Probe runtime.
//!
//! A probe is the only object on the instrumented hot path. It is
//! allocation-free after construction: flags and counters are atomics,
//! and the already-seen fast path is a single swapped load.
//!
//! The driver is reached through a non-owning capability reference;
//! probes live in constant pools, which the driver's registry keeps
//! alive, and a strong back-reference would cycle.

use crate::error::{EngineError, EngineResult};
use crate::key::CoverageKey;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use wisp_host::bytecode::Opcode;
use wisp_host::CodeUnit;

/// Threshold sentinel: disable this probe in place, but never trigger
/// a host-wide deinstrument round.
pub const THRESHOLD_REMOVE_ONLY: i64 = -1;

/// Threshold sentinel: never remove the probe and record the key on
/// every firing (diagnostic mode).
pub const THRESHOLD_NEVER_REMOVE: i64 = -2;

/// The operations a probe needs from its driver.
pub trait ProbeSink: Send + Sync {
    /// Record an observed key for a file.
    fn record_key(&self, filename: &Arc<str>, key: CoverageKey);
    /// Ask for a deinstrument round at the next opportunity.
    fn request_deinstrument(&self);
}

/// Where a probe patches its own first opcode byte for immediate
/// removal.
struct ImmediatePatch {
    /// The code unit containing the insert. Weak: the patch point must
    /// not keep a superseded unit alive.
    code: Weak<CodeUnit>,
    /// Byte offset of the insert's leading `Nop`.
    offset: u32,
}

/// Per-site hit state.
pub struct Probe {
    sink: Weak<dyn ProbeSink>,
    filename: Arc<str>,
    key: CoverageKey,
    threshold: i64,

    signalled: AtomicBool,
    removed: AtomicBool,
    /// Starts at -1 so the first firing is not a miss.
    d_miss_count: AtomicI64,
    u_misses: AtomicU64,
    hits: AtomicU64,

    /// Set when immediate removal is wired up.
    has_patch: AtomicBool,
    patch: Mutex<Option<ImmediatePatch>>,
}

impl Probe {
    /// Create a probe.
    pub fn new(
        sink: Weak<dyn ProbeSink>,
        filename: Arc<str>,
        key: CoverageKey,
        threshold: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink,
            filename,
            key,
            threshold,
            signalled: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            d_miss_count: AtomicI64::new(-1),
            u_misses: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            has_patch: AtomicBool::new(false),
            patch: Mutex::new(None),
        })
    }

    /// The observed key.
    #[inline]
    pub fn key(&self) -> CoverageKey {
        self.key
    }

    /// The owning filename.
    #[inline]
    pub fn filename(&self) -> &Arc<str> {
        &self.filename
    }

    /// Record that this probe's location executed.
    ///
    /// First firing records the key; subsequent firings count as
    /// D-misses until removal, then as U-misses. Crossing the
    /// threshold requests a driver-wide deinstrument round; an
    /// immediate patch point instead rewrites the insert's leading
    /// byte into a forward jump right away.
    pub fn signal(&self) -> EngineResult<()> {
        self.hits.fetch_add(1, Ordering::Relaxed);

        let first = !self.signalled.swap(true, Ordering::Relaxed);
        let has_patch = self.has_patch.load(Ordering::Relaxed);

        // Diagnostic mode records every firing, not just the first.
        if first || (!has_patch && self.threshold < THRESHOLD_REMOVE_ONLY) {
            let sink = self
                .sink
                .upgrade()
                .ok_or_else(|| EngineError::probe("probe sink dropped"))?;
            sink.record_key(&self.filename, self.key);
        }

        if self.removed.load(Ordering::Relaxed) {
            self.u_misses.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let misses = self.d_miss_count.fetch_add(1, Ordering::Relaxed) + 1;

        if has_patch {
            self.apply_patch();
        } else if misses == self.threshold {
            // Several misses on one line amortize one round for every
            // line missed so far; the threshold needn't be large.
            let sink = self
                .sink
                .upgrade()
                .ok_or_else(|| EngineError::probe("probe sink dropped"))?;
            sink.request_deinstrument();
        }
        Ok(())
    }

    /// Rewrite the insert's leading `Nop` into a forward jump.
    ///
    /// The `Nop` operand was pre-set to the remaining insert length,
    /// so only the opcode byte changes. The writer is the thread
    /// executing the insert, so it observes its own patch on the next
    /// pass; other threads see it no later than the next code-object
    /// replacement.
    fn apply_patch(&self) {
        let patch = self.patch.lock();
        if let Some(p) = patch.as_ref() {
            if let Some(code) = p.code.upgrade() {
                code.code.patch_byte(p.offset, Opcode::JumpForward as u8);
            }
        }
        self.removed.store(true, Ordering::Relaxed);
    }

    /// Wire up immediate removal: `offset` is the insert's leading
    /// `Nop` inside `code`.
    pub fn set_immediate(&self, code: &Arc<CodeUnit>, offset: u32) {
        *self.patch.lock() = Some(ImmediatePatch {
            code: Arc::downgrade(code),
            offset,
        });
        self.has_patch.store(true, Ordering::Relaxed);
    }

    /// Mark the probe removed; future firings (dormant frames still on
    /// the superseded unit) count as U-misses.
    pub fn mark_removed(&self) {
        self.removed.store(true, Ordering::Relaxed);
    }

    /// Whether the probe has been removed.
    #[inline]
    pub fn was_removed(&self) -> bool {
        self.removed.load(Ordering::Relaxed)
    }

    /// Total firings.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Firings while instrumented, excluding the first.
    pub fn d_misses(&self) -> u64 {
        self.d_miss_count.load(Ordering::Relaxed).max(0) as u64
    }

    /// Firings after removal.
    pub fn u_misses(&self) -> u64 {
        self.u_misses.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Probe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Probe")
            .field("filename", &self.filename)
            .field("key", &self.key)
            .field("removed", &self.was_removed())
            .field("hits", &self.hits())
            .finish()
    }
}

/// One probe insertion point inside an instrumented code unit.
#[derive(Debug, Clone)]
pub struct ProbeSite {
    /// The probe at this site.
    pub probe: Arc<Probe>,
    /// Byte offset of the insert's first byte.
    pub offset: u32,
    /// Insert length in bytes.
    pub length: u32,
}

impl ProbeSite {
    /// Whether the site is still instrumented.
    #[inline]
    pub fn is_instrumented(&self) -> bool {
        !self.probe.was_removed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct TestSink {
        recorded: PlMutex<Vec<(Arc<str>, CoverageKey)>>,
        rounds: AtomicU64,
    }

    impl ProbeSink for TestSink {
        fn record_key(&self, filename: &Arc<str>, key: CoverageKey) {
            self.recorded.lock().push((filename.clone(), key));
        }
        fn request_deinstrument(&self) {
            self.rounds.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn probe_with(threshold: i64) -> (Arc<TestSink>, Arc<Probe>) {
        let sink: Arc<TestSink> = Arc::new(TestSink::default());
        let dyn_sink: Arc<dyn ProbeSink> = sink.clone();
        let probe = Probe::new(
            Arc::downgrade(&dyn_sink),
            Arc::from("t.wsp"),
            CoverageKey::Line(3),
            threshold,
        );
        (sink, probe)
    }

    #[test]
    fn test_first_signal_records_once() {
        let (sink, probe) = probe_with(50);
        probe.signal().unwrap();
        probe.signal().unwrap();
        probe.signal().unwrap();
        assert_eq!(sink.recorded.lock().len(), 1);
        assert_eq!(probe.hits(), 3);
        assert_eq!(probe.d_misses(), 2);
    }

    #[test]
    fn test_threshold_requests_round_once() {
        let (sink, probe) = probe_with(2);
        for _ in 0..5 {
            probe.signal().unwrap();
        }
        // d_miss_count hits the threshold exactly once.
        assert_eq!(sink.rounds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_only_threshold_never_rounds() {
        let (sink, probe) = probe_with(THRESHOLD_REMOVE_ONLY);
        for _ in 0..10 {
            probe.signal().unwrap();
        }
        assert_eq!(sink.rounds.load(Ordering::SeqCst), 0);
        assert!(!probe.was_removed());
    }

    #[test]
    fn test_diagnostic_threshold_records_every_time() {
        let (sink, probe) = probe_with(THRESHOLD_NEVER_REMOVE);
        probe.signal().unwrap();
        probe.signal().unwrap();
        probe.signal().unwrap();
        assert_eq!(sink.recorded.lock().len(), 3);
        assert_eq!(sink.rounds.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_u_misses_after_removal() {
        let (_sink, probe) = probe_with(50);
        probe.signal().unwrap();
        probe.mark_removed();
        probe.signal().unwrap();
        probe.signal().unwrap();
        assert_eq!(probe.u_misses(), 2);
        assert_eq!(probe.d_misses(), 0);
    }

    #[test]
    fn test_dropped_sink_is_probe_error() {
        let probe = {
            let sink: Arc<dyn ProbeSink> = Arc::new(TestSink::default());
            Probe::new(
                Arc::downgrade(&sink),
                Arc::from("t.wsp"),
                CoverageKey::Line(1),
                50,
            )
        };
        let err = probe.signal().unwrap_err();
        assert!(matches!(err, EngineError::ProbeRuntime { .. }));
    }
}
