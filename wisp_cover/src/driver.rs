//! Instrumentation driver.
//!
//! Owns the collected line/branch sets, the code registry, and the
//! deinstrumentation scheduler, and selects the collection backend at
//! construction: bytecode rewriting, or the host's monitoring API when
//! available. The two backends feed the same data model and are never
//! mixed within one driver.

use crate::editor::{Editor, PROBE_INSERT_LEN};
use crate::error::{EngineError, EngineResult};
use crate::key::CoverageKey;
use crate::monitor;
use crate::preinstrument::{self, BRANCH_NAME};
use crate::probe::{Probe, ProbeSink, ProbeSite, THRESHOLD_NEVER_REMOVE};
use crate::replace::replace_code_objects;
use crate::report::{CoverageReport, FileCoverage, FileStats, Meta};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};
use wisp_host::ast::Module as AstModule;
use wisp_host::bytecode::CodeId;
use wisp_host::{CodeUnit, HostError, ModuleObject, NativeFn, Runtime, Value};

/// Default number of D-misses a probe tolerates before it asks for a
/// deinstrument round.
pub const DEFAULT_D_MISS_THRESHOLD: i64 = 50;

/// Filter deciding which filenames are instrumented.
pub type SourceFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Collection backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendChoice {
    /// Monitoring when the host supports it, bytecode otherwise.
    #[default]
    Auto,
    /// Always rewrite bytecode.
    Bytecode,
    /// Require the host monitoring API.
    Monitoring,
}

/// Driver configuration.
#[derive(Clone)]
pub struct Config {
    /// Collect branch coverage in addition to line coverage.
    pub branch: bool,
    /// Let probes disable themselves in place with a one-byte patch
    /// instead of scheduling deinstrument rounds.
    pub immediate: bool,
    /// D-miss threshold; see the sentinels in [`crate::probe`].
    pub d_miss_threshold: i64,
    /// Aggregate probe counters into reports.
    pub collect_stats: bool,
    /// Instrument only filenames accepted by this predicate.
    pub source_filter: Option<SourceFilter>,
    /// Backend selection.
    pub backend: BackendChoice,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            branch: false,
            immediate: false,
            d_miss_threshold: DEFAULT_D_MISS_THRESHOLD,
            collect_stats: false,
            source_filter: None,
            backend: BackendChoice::Auto,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("branch", &self.branch)
            .field("immediate", &self.immediate)
            .field("d_miss_threshold", &self.d_miss_threshold)
            .field("collect_stats", &self.collect_stats)
            .field("source_filter", &self.source_filter.is_some())
            .field("backend", &self.backend)
            .finish()
    }
}

/// Resolved backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    Bytecode,
    Monitoring,
}

/// Observed and observable keys, per file.
#[derive(Default)]
struct CollectorState {
    /// Keys seen since the last drain.
    newly_seen: FxHashMap<Arc<str>, FxHashSet<CoverageKey>>,
    /// Every key seen across all rounds.
    all_seen: FxHashMap<Arc<str>, FxHashSet<CoverageKey>>,
    /// Instrumentable lines per file.
    code_lines: FxHashMap<Arc<str>, FxHashSet<u32>>,
    /// Possible branch edges per file.
    code_branches: FxHashMap<Arc<str>, FxHashSet<(u32, u32)>>,
}

/// Per-unit probe bookkeeping.
struct UnitRecord {
    sites: Vec<(CoverageKey, ProbeSite)>,
    /// Code units this unit's constant pool contains, transitively
    /// rebuilt together with it.
    inners: Vec<CodeId>,
}

/// Registry of instrumented code.
#[derive(Default)]
struct Registry {
    /// Probe sites per code unit.
    records: FxHashMap<CodeId, UnitRecord>,
    /// Top-level instrumented units per file. Holding the units keeps
    /// their probe capsules alive independent of the caller.
    instrumented: FxHashMap<Arc<str>, Vec<Arc<CodeUnit>>>,
}

/// The coverage driver.
pub struct Driver {
    inner: Arc<DriverInner>,
}

struct DriverInner {
    config: Config,
    threshold: i64,
    backend: Backend,
    runtime: Weak<Runtime>,
    weak_self: Weak<DriverInner>,
    state: Mutex<CollectorState>,
    registry: Mutex<Registry>,
    /// Modules registered as replacement roots.
    modules: Mutex<Vec<Arc<ModuleObject>>>,
    /// Set by probes requesting a round, cleared when one runs.
    pending_round: AtomicBool,
    /// Guards round reentrancy.
    round_active: AtomicBool,
    /// Shared `signal` callable injected into constant pools.
    signal_fn: Arc<NativeFn>,
}

impl Driver {
    /// Validate configuration, pick a backend, and build a driver for
    /// `runtime`.
    pub fn new(config: Config, runtime: &Arc<Runtime>) -> EngineResult<Self> {
        if config.d_miss_threshold < THRESHOLD_NEVER_REMOVE {
            return Err(EngineError::config(format!(
                "d_miss_threshold must be >= {}, got {}",
                THRESHOLD_NEVER_REMOVE, config.d_miss_threshold
            )));
        }
        if config.immediate && config.d_miss_threshold == THRESHOLD_NEVER_REMOVE {
            return Err(EngineError::config(
                "immediate removal conflicts with the never-remove threshold",
            ));
        }

        let backend = match config.backend {
            BackendChoice::Bytecode => Backend::Bytecode,
            BackendChoice::Monitoring => {
                if !runtime.monitoring_supported() {
                    return Err(EngineError::config(
                        "monitoring backend requested but the host does not expose it",
                    ));
                }
                Backend::Monitoring
            }
            BackendChoice::Auto => {
                if runtime.monitoring_supported() {
                    Backend::Monitoring
                } else {
                    Backend::Bytecode
                }
            }
        };

        if backend == Backend::Monitoring && config.immediate {
            return Err(EngineError::config(
                "immediate removal requires the bytecode backend",
            ));
        }

        let threshold = config.d_miss_threshold;
        let branch = config.branch;
        let inner = Arc::new_cyclic(|weak_self: &Weak<DriverInner>| DriverInner {
            config,
            threshold,
            backend,
            runtime: Arc::downgrade(runtime),
            weak_self: weak_self.clone(),
            state: Mutex::new(CollectorState::default()),
            registry: Mutex::new(Registry::default()),
            modules: Mutex::new(Vec::new()),
            pending_round: AtomicBool::new(false),
            round_active: AtomicBool::new(false),
            signal_fn: Arc::new(NativeFn::new("signal", signal_entry)),
        });

        if backend == Backend::Monitoring {
            monitor::install_callbacks(runtime, inner.sink_weak(), branch)?;
        }

        debug!(?backend, "coverage driver initialized");
        Ok(Self { inner })
    }

    /// The resolved backend name, for diagnostics.
    pub fn backend_name(&self) -> &'static str {
        match self.inner.backend {
            Backend::Bytecode => "bytecode",
            Backend::Monitoring => "monitoring",
        }
    }

    /// Rewrite a source tree so branch decisions are observable.
    ///
    /// Branch mode with the bytecode backend only; the monitoring
    /// backend reports branches natively.
    pub fn pre_instrument_source(&self, module: AstModule) -> EngineResult<AstModule> {
        if !self.inner.config.branch {
            return Err(EngineError::config(
                "pre-instrumentation requires branch mode",
            ));
        }
        if self.inner.backend == Backend::Monitoring {
            return Err(EngineError::config(
                "the monitoring backend does not use pre-instrumentation",
            ));
        }
        Ok(preinstrument::preinstrument(module))
    }

    /// Instrument a compiled unit (and, transitively, the units in its
    /// constant pool) for coverage, registering it under `filename`.
    ///
    /// Units rejected by the source filter, and units whose bytecode
    /// cannot be rewritten, are returned unchanged; rewrite failures
    /// are logged and never poison the run.
    pub fn instrument_code(&self, code: &Arc<CodeUnit>, filename: &str) -> Arc<CodeUnit> {
        if let Some(filter) = &self.inner.config.source_filter {
            if !filter(filename) {
                return code.clone();
            }
        }

        match self.inner.backend {
            Backend::Monitoring => {
                self.inner.enable_monitoring(code);
                code.clone()
            }
            Backend::Bytecode => match self.inner.instrument_unit(code) {
                Ok(new_code) => {
                    let mut registry = self.inner.registry.lock();
                    registry
                        .instrumented
                        .entry(code.filename.clone())
                        .or_default()
                        .push(new_code.clone());
                    new_code
                }
                Err(e) => {
                    warn!(unit = %code.qualname, error = %e, "instrumentation failed; unit passed through");
                    code.clone()
                }
            },
        }
    }

    /// Register a module as a root for code-object replacement.
    pub fn register_module(&self, module: &Arc<ModuleObject>) {
        self.inner.modules.lock().push(module.clone());
    }

    /// Retire every probe whose key has been seen since the last round
    /// and swap the rebuilt units into the live object graph.
    ///
    /// Reentrant and idempotent within a round.
    pub fn deinstrument_seen(&self) {
        self.inner.deinstrument_seen();
    }

    /// Whether a probe has requested a round that has not run yet.
    pub fn pending_deinstrument(&self) -> bool {
        self.inner.pending_round.load(Ordering::Relaxed)
    }

    /// Drain outstanding observations and build the coverage report.
    pub fn get_coverage(&self) -> CoverageReport {
        let inner = &self.inner;

        // Registry before state: rounds take the locks in that order.
        let stats = inner
            .config
            .collect_stats
            .then(|| inner.collect_stats_per_file());

        let mut state = inner.state.lock();

        // Fold anything not yet merged by a round.
        let newly = std::mem::take(&mut state.newly_seen);
        for (file, keys) in newly {
            state.all_seen.entry(file).or_default().extend(keys);
        }

        let mut files = BTreeMap::new();
        for (file, lines) in &state.code_lines {
            let empty = FxHashSet::default();
            let seen = state.all_seen.get(file).unwrap_or(&empty);

            let executed_lines: Vec<u32> = seen
                .iter()
                .filter_map(|k| match k {
                    CoverageKey::Line(line) => Some(*line),
                    CoverageKey::Branch(..) => None,
                })
                .collect();
            let executed_set: FxHashSet<u32> = executed_lines.iter().copied().collect();
            let missing_lines: Vec<u32> = lines
                .iter()
                .copied()
                .filter(|l| !executed_set.contains(l))
                .collect();

            let branches = inner.config.branch.then(|| {
                let executed: Vec<(u32, u32)> = seen
                    .iter()
                    .filter_map(|k| match k {
                        CoverageKey::Branch(s, d) => Some((*s, *d)),
                        CoverageKey::Line(_) => None,
                    })
                    .collect();
                let executed_set: FxHashSet<(u32, u32)> = executed.iter().copied().collect();
                let missing: Vec<(u32, u32)> = state
                    .code_branches
                    .get(file)
                    .map(|possible| {
                        possible
                            .iter()
                            .copied()
                            .filter(|e| !executed_set.contains(e))
                            .collect()
                    })
                    .unwrap_or_default();
                (executed, missing)
            });

            let file_stats = stats
                .as_ref()
                .and_then(|per_file| per_file.get(file).copied());

            files.insert(
                file.to_string(),
                FileCoverage::new(executed_lines, missing_lines, branches, file_stats),
            );
        }

        CoverageReport::new(Meta::current(inner.config.branch), files)
    }
}

/// Entry point stored in constant pools; dispatches to the capsule's
/// probe.
fn signal_entry(args: &[Value]) -> Result<Value, HostError> {
    let capsule = match args.first() {
        Some(Value::Capsule(capsule)) => capsule,
        _ => return Err(HostError::internal("coverage signal without probe capsule")),
    };
    let probe = capsule
        .downcast_ref::<Probe>()
        .ok_or_else(|| HostError::internal("coverage capsule holds no probe"))?;
    probe
        .signal()
        .map_err(|e| HostError::internal(e.to_string()))?;
    Ok(Value::None)
}

impl ProbeSink for DriverInner {
    fn record_key(&self, filename: &Arc<str>, key: CoverageKey) {
        self.state
            .lock()
            .newly_seen
            .entry(filename.clone())
            .or_default()
            .insert(key);
    }

    fn request_deinstrument(&self) {
        self.pending_round.store(true, Ordering::Relaxed);
        self.deinstrument_seen();
    }
}

impl DriverInner {
    fn sink_weak(&self) -> Weak<dyn ProbeSink> {
        self.weak_self.clone()
    }

    // =========================================================================
    // Monitoring backend
    // =========================================================================

    fn enable_monitoring(&self, code: &Arc<CodeUnit>) {
        let Some(runtime) = self.runtime.upgrade() else {
            return;
        };
        runtime.monitoring().set_local_events(CodeId::of(code));

        for c in code.consts.iter() {
            if let Value::Code(inner) = c {
                self.enable_monitoring(inner);
            }
        }

        let mut state = self.state.lock();
        state
            .code_lines
            .entry(code.filename.clone())
            .or_default()
            .extend(code.lines());
        if self.config.branch {
            state
                .code_branches
                .entry(code.filename.clone())
                .or_default()
                .extend(monitor::possible_branches(code));
        }
    }

    // =========================================================================
    // Bytecode backend: instrumentation
    // =========================================================================

    fn instrument_unit(&self, code: &Arc<CodeUnit>) -> EngineResult<Arc<CodeUnit>> {
        let filename = code.filename.clone();
        let mut ed = Editor::new(code)?;

        // Inner units first; a failing inner unit passes through.
        let mut inners = Vec::new();
        for (i, c) in code.consts.iter().enumerate() {
            if let Value::Code(inner) = c {
                match self.instrument_unit(inner) {
                    Ok(new_inner) => {
                        inners.push(CodeId::of(&new_inner));
                        ed.set_const(i as u32, Value::Code(new_inner));
                    }
                    Err(e) => {
                        warn!(unit = %inner.qualname, error = %e, "inner unit passed through");
                        inners.push(CodeId::of(inner));
                    }
                }
            }
        }

        let signal_idx = ed.add_const(Value::Native(self.signal_fn.clone()));
        let mut planned: Vec<(usize, CoverageKey, Arc<Probe>)> = Vec::new();

        if self.config.branch {
            for site in ed.find_marker_assignments(BRANCH_NAME) {
                let key = match ed.const_at(site.const_index) {
                    Some(Value::Tuple(pair)) if pair.len() == 2 => {
                        match (pair[0].as_int(), pair[1].as_int()) {
                            (Some(src), Some(dst)) => {
                                CoverageKey::Branch(src as u32, dst as u32)
                            }
                            _ => {
                                return Err(EngineError::bytecode(
                                    "branch marker constant is not a line pair",
                                    code.qualname.to_string(),
                                ))
                            }
                        }
                    }
                    _ => {
                        return Err(EngineError::bytecode(
                            "branch marker constant is not a line pair",
                            code.qualname.to_string(),
                        ))
                    }
                };

                let probe = Probe::new(self.sink_weak(), filename.clone(), key, self.threshold);
                // The marker's constant slot becomes the probe capsule.
                ed.set_const(site.const_index, Value::Capsule(probe.clone()));
                let plan = ed.replace_marker_with_probe(&site, signal_idx, site.const_index);
                planned.push((plan, key, probe));
            }
        }

        for (index, line) in ed.line_start_sites(None) {
            let key = CoverageKey::Line(line);
            let probe = Probe::new(self.sink_weak(), filename.clone(), key, self.threshold);
            let capsule_idx = ed.add_const(Value::Capsule(probe.clone()));
            let plan = ed.insert_probe_call(index, signal_idx, capsule_idx);
            planned.push((plan, key, probe));
        }

        let (new_code, offsets) = ed.finish()?;

        let mut sites = Vec::with_capacity(planned.len());
        let mut state = self.state.lock();
        for (plan, key, probe) in planned {
            let offset = offsets[plan];
            if self.config.immediate {
                probe.set_immediate(&new_code, offset);
            }
            match key {
                CoverageKey::Line(line) => {
                    state
                        .code_lines
                        .entry(filename.clone())
                        .or_default()
                        .insert(line);
                }
                CoverageKey::Branch(src, dst) => {
                    state
                        .code_branches
                        .entry(filename.clone())
                        .or_default()
                        .insert((src, dst));
                }
            }
            sites.push((
                key,
                ProbeSite {
                    probe,
                    offset,
                    length: PROBE_INSERT_LEN,
                },
            ));
        }
        drop(state);

        self.registry.lock().records.insert(
            CodeId::of(&new_code),
            UnitRecord { sites, inners },
        );
        Ok(new_code)
    }

    // =========================================================================
    // Bytecode backend: deinstrumentation
    // =========================================================================

    fn deinstrument_seen(&self) {
        // Monitoring and immediate modes have nothing to rebuild; a
        // drain keeps the seen-set invariants identical across modes.
        if self.backend == Backend::Monitoring || self.config.immediate {
            let mut state = self.state.lock();
            let newly = std::mem::take(&mut state.newly_seen);
            for (file, keys) in newly {
                state.all_seen.entry(file).or_default().extend(keys);
            }
            self.pending_round.store(false, Ordering::Relaxed);
            return;
        }

        if self.round_active.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pending_round.store(false, Ordering::Relaxed);

        let drained = std::mem::take(&mut self.state.lock().newly_seen);

        let mut replace_map: FxHashMap<CodeId, Arc<CodeUnit>> = FxHashMap::default();
        let mut superseded: Vec<Arc<Probe>> = Vec::new();

        {
            let mut registry = self.registry.lock();
            for (file, keys) in &drained {
                let roots = registry.instrumented.get(file).cloned().unwrap_or_default();
                let mut new_roots = Vec::with_capacity(roots.len());
                for root in roots {
                    match self.deinstrument_unit(
                        &mut registry,
                        &root,
                        keys,
                        &mut superseded,
                        &mut replace_map,
                    ) {
                        Some(new_root) => new_roots.push(new_root),
                        None => new_roots.push(root),
                    }
                }
                registry.instrumented.insert(file.clone(), new_roots);
            }
        }

        {
            let mut state = self.state.lock();
            for (file, keys) in drained {
                state.all_seen.entry(file).or_default().extend(keys);
            }
        }

        if !replace_map.is_empty() {
            debug!(units = replace_map.len(), "deinstrument round replacing code");
            let mut roots = self.modules.lock().clone();
            let executing = match self.runtime.upgrade() {
                Some(runtime) => {
                    roots.extend(runtime.modules());
                    runtime.executing_code_ids()
                }
                None => FxHashSet::default(),
            };
            replace_code_objects(&roots, &replace_map, &executing);
        }

        for probe in superseded {
            probe.mark_removed();
        }
        self.round_active.store(false, Ordering::Release);
    }

    /// Rebuild one unit with the given keys' probes disabled, recursing
    /// through constant-pool units. Every rebuilt unit (roots and
    /// inner units alike) lands in `replace_map` so the replacer can
    /// redirect function objects and dormant frames that reference it
    /// directly. Returns `None` when unchanged.
    fn deinstrument_unit(
        &self,
        registry: &mut Registry,
        code: &Arc<CodeUnit>,
        keys: &FxHashSet<CoverageKey>,
        superseded: &mut Vec<Arc<Probe>>,
        replace_map: &mut FxHashMap<CodeId, Arc<CodeUnit>>,
    ) -> Option<Arc<CodeUnit>> {
        // The registry knows whether this unit contains inner units;
        // most leaf functions can skip the constant-pool scan.
        let has_inners = registry
            .records
            .get(&CodeId::of(code))
            .map_or(true, |record| !record.inners.is_empty());

        let mut new_consts: Option<Vec<Value>> = None;
        if has_inners {
            for (i, c) in code.consts.iter().enumerate() {
                if let Value::Code(inner) = c {
                    if let Some(new_inner) =
                        self.deinstrument_unit(registry, inner, keys, superseded, replace_map)
                    {
                        new_consts.get_or_insert_with(|| code.consts.to_vec())[i] =
                            Value::Code(new_inner);
                    }
                }
            }
        }

        let mut offsets = Vec::new();
        let mut retired = Vec::new();
        if let Some(record) = registry.records.get(&CodeId::of(code)) {
            for (key, site) in &record.sites {
                if keys.contains(key) && site.is_instrumented() {
                    offsets.push(site.offset);
                    retired.push(site.probe.clone());
                }
            }
        }

        let new_code = Editor::deinstrument(code, &offsets, new_consts)?;
        superseded.extend(retired);
        replace_map.insert(CodeId::of(code), new_code.clone());

        // Offsets are preserved, so the record carries over verbatim.
        if let Some(record) = registry.records.remove(&CodeId::of(code)) {
            registry.records.insert(CodeId::of(&new_code), record);
        }
        Some(new_code)
    }

    // =========================================================================
    // Stats
    // =========================================================================

    fn collect_stats_per_file(&self) -> FxHashMap<Arc<str>, FileStats> {
        let registry = self.registry.lock();
        let mut per_file: FxHashMap<Arc<str>, FileStats> = FxHashMap::default();
        for record in registry.records.values() {
            for (_, site) in &record.sites {
                let entry = per_file.entry(site.probe.filename().clone()).or_default();
                entry.probes += 1;
                if site.probe.was_removed() {
                    entry.removed += 1;
                }
                entry.hits += site.probe.hits();
                entry.d_misses += site.probe.d_misses();
                entry.u_misses += site.probe.u_misses();
            }
        }
        per_file
    }
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("backend", &self.backend_name())
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_validation() {
        let rt = Runtime::without_monitoring();
        let err = Driver::new(
            Config {
                d_miss_threshold: -3,
                ..Config::default()
            },
            &rt,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }));
    }

    #[test]
    fn test_immediate_conflicts_with_never_remove() {
        let rt = Runtime::without_monitoring();
        let err = Driver::new(
            Config {
                immediate: true,
                d_miss_threshold: THRESHOLD_NEVER_REMOVE,
                ..Config::default()
            },
            &rt,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }));
    }

    #[test]
    fn test_monitoring_requires_host_support() {
        let rt = Runtime::without_monitoring();
        let err = Driver::new(
            Config {
                backend: BackendChoice::Monitoring,
                ..Config::default()
            },
            &rt,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }));
    }

    #[test]
    fn test_auto_backend_selection() {
        let with = Runtime::new();
        let without = Runtime::without_monitoring();
        assert_eq!(
            Driver::new(Config::default(), &with).unwrap().backend_name(),
            "monitoring"
        );
        assert_eq!(
            Driver::new(Config::default(), &without)
                .unwrap()
                .backend_name(),
            "bytecode"
        );
    }

    #[test]
    fn test_pre_instrument_requires_branch_mode() {
        let rt = Runtime::without_monitoring();
        let driver = Driver::new(Config::default(), &rt).unwrap();
        let err = driver
            .pre_instrument_source(AstModule::new(vec![]))
            .unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }));
    }
}
