//! Stand-in for a slow, synchronous external service.

use std::thread;
use std::time::Duration;

use handoff_core::{ExternalService, ExternalServiceError};

/// Blocks for `processing_time` per call, then answers with a canned result.
#[derive(Debug, Clone)]
pub struct SimulatedExternalService {
    processing_time: Duration,
}

impl SimulatedExternalService {
    #[must_use]
    pub fn new(processing_time: Duration) -> Self {
        Self { processing_time }
    }
}

impl Default for SimulatedExternalService {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl ExternalService for SimulatedExternalService {
    fn get_link(&self, query: &str) -> Result<String, ExternalServiceError> {
        thread::sleep(self.processing_time);
        Ok(format!("result for query '{query}'"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn answers_after_processing_time() {
        let service = SimulatedExternalService::new(Duration::from_millis(20));
        let started = Instant::now();
        assert_eq!(service.get_link("abc").unwrap(), "result for query 'abc'");
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
