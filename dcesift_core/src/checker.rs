use crate::builder::{Builder, CompileError};
use crate::case::Case;
use tracing::debug;

/// Confirms that a tentative case is worth reporting.
pub trait Checker: Send + Sync {
    fn is_interesting(&self, case: &Case) -> Result<bool, CompileError>;
}

impl<C: Checker + ?Sized> Checker for std::sync::Arc<C> {
    fn is_interesting(&self, case: &Case) -> Result<bool, CompileError> {
        (**self).is_interesting(case)
    }
}

/// Accepts a case only if the divergence shows up again on a fresh build:
/// the marker survives under the bad setting and is gone under every good one.
pub struct ReproductionChecker<B> {
    builder: B,
    marker_prefix: String,
}

impl<B: Builder> ReproductionChecker<B> {
    pub fn new(builder: B, marker_prefix: impl Into<String>) -> Self {
        Self {
            builder,
            marker_prefix: marker_prefix.into(),
        }
    }
}

impl<B: Builder> Checker for ReproductionChecker<B> {
    fn is_interesting(&self, case: &Case) -> Result<bool, CompileError> {
        let bad_alive =
            self.builder
                .find_alive_markers(&case.code, &case.bad_setting, &self.marker_prefix)?;
        if !bad_alive.contains(&case.marker) {
            debug!(marker = %case.marker, bad = %case.bad_setting, "Marker vanished under bad setting");
            return Ok(false);
        }

        for good in &case.good_settings {
            let good_alive = self
                .builder
                .find_alive_markers(&case.code, good, &self.marker_prefix)?;
            if good_alive.contains(&case.marker) {
                debug!(marker = %case.marker, good = %good, "Marker reappeared under good setting");
                return Ok(false);
            }
        }
        Ok(true)
    }
}
