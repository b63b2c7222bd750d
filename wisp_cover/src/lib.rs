//! Near-zero-overhead line and branch coverage for the Wisp VM.
//!
//! The engine injects a fixed-shape probe call before every tracked
//! line of a compiled program. Each probe records its location once,
//! then counts subsequent firings; past a tunable threshold the driver
//! rebuilds the affected code units without the retired probes and
//! swaps them into every live reference, so a hot loop pays for
//! coverage only a bounded number of times.
//!
//! On hosts exposing the structured monitoring API the same data model
//! is fed by LINE and branch callbacks instead, with per-location
//! disabling standing in for deinstrumentation.
//!
//! ```ignore
//! let runtime = Runtime::without_monitoring();
//! let driver = Driver::new(Config { branch: true, ..Config::default() }, &runtime)?;
//!
//! let ast = driver.pre_instrument_source(parse(source))?;
//! let code = compile_module(&ast, "app.wsp")?;
//! let code = driver.instrument_code(&code, "app.wsp");
//!
//! let module = runtime.new_module("app");
//! driver.register_module(&module);
//! Interp::new(&runtime).run_module(&code, &module)?;
//!
//! println!("{}", driver.get_coverage().to_json()?);
//! ```

mod driver;
mod editor;
mod error;
mod key;
mod monitor;
mod preinstrument;
mod probe;
mod replace;
mod report;

pub use driver::{BackendChoice, Config, Driver, SourceFilter, DEFAULT_D_MISS_THRESHOLD};
pub use editor::{Editor, MarkerSite, PROBE_INSERT_LEN};
pub use error::{EngineError, EngineResult};
pub use key::CoverageKey;
pub use monitor::possible_branches;
pub use preinstrument::{preinstrument, BRANCH_NAME};
pub use probe::{
    Probe, ProbeSink, ProbeSite, THRESHOLD_NEVER_REMOVE, THRESHOLD_REMOVE_ONLY,
};
pub use replace::{replace_code_objects, ReplaceOutcome};
pub use report::{CoverageReport, FileCoverage, FileStats, Meta, Summary};
