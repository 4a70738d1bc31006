//! Capability prober: turns helper self-description output into a `CapSet`.
//!
//! Each `probe` call is an independent, blocking operation: it runs the
//! plugin listing, the filter listing, and the version query against the
//! binary at the given path, matches tokens, and returns a finished
//! `Arc<HelperCaps>`. There is no retry and no staleness tracking here;
//! callers that want memoization use [`crate::cache::CapsCache`].
//!
//! Only invocation failures (the binary could not be executed at all, or an
//! invocation timed out) abort the probe. A listing that runs but produces
//! empty, malformed, or non-zero-exit output contributes zero capabilities;
//! absence of evidence is absence of the feature, so the prober never
//! reports a false positive.

use crate::flags::{CapFlag, Listing};
use crate::set::{CapSet, HelperCaps};
use hc_runner::{HelperRunner, RunnerConfig};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Why a single helper invocation produced no usable listing.
#[derive(Debug, Error)]
pub enum InvokeFailure {
    /// The helper could not be executed at all: missing file, not
    /// executable, spawn failure, or timeout.
    #[error("helper could not be executed: {0}")]
    CouldNotRun(String),

    /// The helper ran but its output is unusable (non-zero exit).
    #[error("helper exited with status {status:?}")]
    Unusable { status: Option<i32> },
}

/// Errors crossing the `probe` boundary.
///
/// Callers receiving this must treat every capability as unknown, not
/// false: no feature-gated configuration may proceed until a later probe
/// succeeds.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("helper invocation failed for {path}: {reason}")]
    Invocation { path: PathBuf, reason: String },
}

/// The process invocation collaborator consumed by the prober.
///
/// Implementations run the executable at `path` with `args` and return its
/// captured standard output.
pub trait Invoke {
    fn invoke(&self, path: &Path, args: &[&str]) -> Result<String, InvokeFailure>;
}

/// Production `Invoke` implementation backed by [`hc_runner::HelperRunner`].
#[derive(Debug)]
pub struct RunnerInvoker {
    runner: HelperRunner,
}

impl RunnerInvoker {
    /// Wrap an existing runner.
    pub fn new(runner: HelperRunner) -> Self {
        Self { runner }
    }

    /// Build with default runner configuration.
    pub fn with_defaults() -> Self {
        Self::new(HelperRunner::new(RunnerConfig::default()))
    }
}

impl Invoke for RunnerInvoker {
    fn invoke(&self, path: &Path, args: &[&str]) -> Result<String, InvokeFailure> {
        let output = self
            .runner
            .run(path, args)
            .map_err(|e| InvokeFailure::CouldNotRun(e.to_string()))?;

        // A timeout means the helper never finished self-describing; that is
        // an execution failure, not a usable empty listing.
        if output.timed_out {
            return Err(InvokeFailure::CouldNotRun(format!(
                "timed out after {:?}",
                output.duration
            )));
        }

        if !output.success() {
            return Err(InvokeFailure::Unusable {
                status: output.exit_code,
            });
        }

        Ok(output.stdout_str())
    }
}

/// Probes a helper binary for its supported capabilities.
///
/// Stateless between calls; one probe produces one `HelperCaps`.
#[derive(Debug)]
pub struct Prober<I: Invoke> {
    invoker: I,
}

impl Prober<RunnerInvoker> {
    /// A prober wired to the real process runner.
    pub fn with_defaults() -> Self {
        Self::new(RunnerInvoker::with_defaults())
    }
}

impl<I: Invoke> Prober<I> {
    /// Create a prober using the given invocation collaborator.
    pub fn new(invoker: I) -> Self {
        Self { invoker }
    }

    /// The invocation collaborator in use.
    pub fn invoker(&self) -> &I {
        &self.invoker
    }

    /// Probe the binary at `path` and return its capability snapshot.
    pub fn probe(&self, path: &Path) -> Result<Arc<HelperCaps>, ProbeError> {
        debug!(helper = %path.display(), "probing helper capabilities");

        let plugin_tokens = self.listing_tokens(path, Listing::Plugins)?;
        let filter_tokens = self.listing_tokens(path, Listing::Filters)?;

        let mut caps = CapSet::new();
        for flag in CapFlag::ALL {
            // Each flag is bound to exactly one listing, so no flag can be
            // set twice from different outputs.
            let tokens = match flag.listing() {
                Listing::Plugins => &plugin_tokens,
                Listing::Filters => &filter_tokens,
                Listing::Version => continue,
            };
            if tokens.contains(flag.token()) {
                trace!(flag = %flag, "capability present");
                caps.set(flag);
            }
        }

        let version = self.query_version(path)?;

        let snapshot = Arc::new(HelperCaps::new(path.to_path_buf(), version, caps));
        info!(summary = %snapshot.summary(), "capability probe complete");
        Ok(snapshot)
    }

    /// Run one listing and split it into exact tokens.
    ///
    /// Unusable output is absorbed here as an empty token set; only
    /// execution failure propagates.
    fn listing_tokens(
        &self,
        path: &Path,
        listing: Listing,
    ) -> Result<HashSet<String>, ProbeError> {
        let output = match self.invoker.invoke(path, listing.args()) {
            Ok(output) => output,
            Err(InvokeFailure::CouldNotRun(reason)) => {
                return Err(ProbeError::Invocation {
                    path: path.to_path_buf(),
                    reason,
                });
            }
            Err(failure @ InvokeFailure::Unusable { .. }) => {
                warn!(
                    helper = %path.display(),
                    listing = ?listing,
                    error = %failure,
                    "listing unusable, assuming no capabilities from it"
                );
                return Ok(HashSet::new());
            }
        };

        let tokens: HashSet<String> = output.split_whitespace().map(str::to_string).collect();

        if tokens.is_empty() {
            warn!(
                helper = %path.display(),
                listing = ?listing,
                "listing was empty, assuming no capabilities from it"
            );
        }

        Ok(tokens)
    }

    /// Query the version self-report. Parse failure is not an error.
    fn query_version(&self, path: &Path) -> Result<Option<String>, ProbeError> {
        let output = match self.invoker.invoke(path, Listing::Version.args()) {
            Ok(output) => output,
            Err(InvokeFailure::CouldNotRun(reason)) => {
                return Err(ProbeError::Invocation {
                    path: path.to_path_buf(),
                    reason,
                });
            }
            Err(failure @ InvokeFailure::Unusable { .. }) => {
                warn!(helper = %path.display(), error = %failure, "version query unusable");
                return Ok(None);
            }
        };

        Ok(parse_version(&output))
    }
}

/// Extract the first version-shaped token ("X.Y" or "X.Y.Z[-suffix]",
/// optionally "v"-prefixed) from a version self-report.
fn parse_version(output: &str) -> Option<String> {
    for word in output.split_whitespace() {
        let cleaned = word.trim_start_matches('v').trim_end_matches(',');
        let parts: Vec<&str> = cleaned.split('.').collect();
        if parts.len() >= 2
            && parts
                .iter()
                .take(2)
                .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
        {
            return Some(cleaned.to_string());
        }
    }
    None
}
