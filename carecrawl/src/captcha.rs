//! reCAPTCHA token acquisition.
//!
//! Every strategy implements [`CaptchaSolver`]. [`CaptchaChain`] is itself a
//! solver that tries its members in order and returns the first fresh token.
#[cfg(feature = "browser")]
pub mod browser;
pub mod capsolver;
mod poll;
pub mod two_captcha;

#[cfg(feature = "browser")]
pub use browser::{BrowserSolver, BrowserSolverOptions};
pub use capsolver::CapSolverSolver;
pub use two_captcha::TwoCaptchaSolver;

use crate::error::CaptchaError;
use async_trait::async_trait;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{info, instrument, warn};

/// Single-use challenge token. Not `Clone`: inserting it into a request
/// consumes it.
#[derive(Debug)]
pub struct CaptchaToken {
    value: String,
    acquired_at: Instant,
    solver: &'static str,
}

impl CaptchaToken {
    pub fn new(value: impl Into<String>, solver: &'static str) -> Self {
        Self {
            value: value.into(),
            acquired_at: Instant::now(),
            solver,
        }
    }

    pub fn solver(&self) -> &'static str {
        self.solver
    }

    pub fn age(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub fn is_fresh(&self, validity: Duration) -> bool {
        self.age() < validity
    }

    pub fn into_value(self) -> String {
        self.value
    }
}

#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn solve(&self, site_key: &str, page_url: &str) -> Result<CaptchaToken, CaptchaError>;
}

/// Solver bound to the target page. Every call returns a fresh token.
#[derive(Clone)]
pub struct CaptchaProvider {
    solver: Arc<dyn CaptchaSolver>,
    site_key: String,
    page_url: String,
}

impl CaptchaProvider {
    pub fn new(
        solver: Arc<dyn CaptchaSolver>,
        site_key: impl Into<String>,
        page_url: impl Into<String>,
    ) -> Self {
        Self {
            solver,
            site_key: site_key.into(),
            page_url: page_url.into(),
        }
    }

    pub async fn acquire(&self) -> Result<CaptchaToken, CaptchaError> {
        self.solver.solve(&self.site_key, &self.page_url).await
    }
}

impl std::fmt::Debug for CaptchaProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptchaProvider")
            .field("solver", &self.solver.name())
            .field("page_url", &self.page_url)
            .finish()
    }
}

/// Ordered fallback chain; first fresh token wins.
pub struct CaptchaChain {
    solvers: Vec<Arc<dyn CaptchaSolver>>,
    validity: Duration,
}

impl CaptchaChain {
    pub fn new(solvers: Vec<Arc<dyn CaptchaSolver>>, validity: Duration) -> Self {
        Self { solvers, validity }
    }

    pub fn len(&self) -> usize {
        self.solvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.solvers.is_empty()
    }
}

impl std::fmt::Debug for CaptchaChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.solvers.iter().map(|s| s.name()).collect();
        f.debug_struct("CaptchaChain")
            .field("solvers", &names)
            .field("validity", &self.validity)
            .finish()
    }
}

#[async_trait]
impl CaptchaSolver for CaptchaChain {
    fn name(&self) -> &'static str {
        "chain"
    }

    #[instrument(skip_all)]
    async fn solve(&self, site_key: &str, page_url: &str) -> Result<CaptchaToken, CaptchaError> {
        let mut failures = Vec::with_capacity(self.solvers.len());

        for solver in &self.solvers {
            let started = Instant::now();
            match solver.solve(site_key, page_url).await {
                Ok(token) if token.is_fresh(self.validity) => {
                    info!(
                        "Captcha solved by {} in {:.1}s",
                        solver.name(),
                        started.elapsed().as_secs_f32()
                    );
                    return Ok(token);
                }
                Ok(token) => {
                    let err = CaptchaError::Expired {
                        solver: solver.name(),
                        age: token.age(),
                    };
                    warn!("Discarding stale token: {err}");
                    failures.push(err.to_string());
                }
                Err(e) => {
                    warn!("Captcha strategy {} failed: {e}", solver.name());
                    failures.push(e.to_string());
                }
            }
        }

        Err(CaptchaError::Exhausted(failures))
    }
}
